//! Durable room snapshots.
//!
//! The relay hands each room's `encode_state()` to a [`SnapshotStore`] on
//! an interval and when the last connection leaves; a room is hydrated from
//! its stored snapshot the next time someone joins.
//!
//! On disk every room is one file, `<dir>/<room>.snap`, holding a bincode
//! encoded [`CompressedSnapshot`] whose payload is LZ4 block compressed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const EXTENSION: &str = "snap";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(String),

    #[error("decompression failed: {0}")]
    Compression(String),
}

/// Where room snapshots live between sessions.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Names of every stored room, sorted.
    fn rooms(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots().insert(room.to_string(), snapshot.to_vec());
        Ok(())
    }

    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshots().get(room).cloned())
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut rooms: Vec<String> = self.snapshots().keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}

/// A snapshot as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedSnapshot {
    /// Room name, kept so listing does not depend on the file name.
    pub room: String,
    pub original_size: u64,
    /// LZ4 block, size-prepended.
    pub compressed: Vec<u8>,
}

impl CompressedSnapshot {
    pub fn compress(room: &str, data: &[u8]) -> Self {
        Self {
            room: room.to_string(),
            original_size: data.len() as u64,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }

    /// Original / compressed.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(snapshot)
    }
}

/// One LZ4-compressed file per room.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a snapshot directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        log::info!("snapshot store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, room: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(room), EXTENSION))
    }
}

/// Room names come from URL paths; keep the file name to a safe alphabet.
/// Everything else is percent-encoded byte by byte, so distinct names
/// always map to distinct files.
fn file_stem(room: &str) -> String {
    let mut stem = String::with_capacity(room.len());
    for byte in room.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => stem.push(byte as char),
            other => stem.push_str(&format!("%{other:02x}")),
        }
    }
    stem
}

impl SnapshotStore for FileStore {
    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let record = CompressedSnapshot::compress(room, snapshot);
        let bytes = record.to_bytes()?;
        // Write then rename so a crash never leaves a torn snapshot.
        let path = self.path_for(room);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        log::debug!(
            "saved room '{}': {} -> {} bytes ({:.1}x)",
            room,
            record.original_size,
            record.compressed.len(),
            record.compression_ratio()
        );
        Ok(())
    }

    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let bytes = match fs::read(self.path_for(room)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = CompressedSnapshot::from_bytes(&bytes)?;
        record.decompress().map(Some)
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut rooms = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| CompressedSnapshot::from_bytes(&bytes))
            {
                Ok(record) => rooms.push(record.room),
                Err(e) => log::warn!("skipping unreadable snapshot {}: {}", path.display(), e),
            }
        }
        rooms.sort();
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load("a").unwrap().is_none());
        store.save("b", &[1, 2]).unwrap();
        store.save("a", &[3]).unwrap();
        assert_eq!(store.load("b").unwrap(), Some(vec![1, 2]));
        assert_eq!(store.rooms().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let data = vec![7u8; 4096];
        let snapshot = CompressedSnapshot::compress("room", &data);
        assert!(snapshot.compression_ratio() > 10.0);
        assert_eq!(snapshot.decompress().unwrap(), data);
    }

    #[test]
    fn test_file_stem_escapes_separators() {
        assert_eq!(file_stem("team/q1 budget"), "team%2fq1%20budget");
        assert_eq!(file_stem("plain-name_1"), "plain-name_1");
    }

    #[test]
    fn test_file_stem_keeps_non_ascii_names_apart() {
        assert_eq!(file_stem("\u{1f600}"), "%f0%9f%98%80");
        assert_eq!(file_stem("\u{1f}600"), "%1f600");
        assert_ne!(file_stem("\u{1f600}"), file_stem("\u{1f}600"));
        assert_eq!(file_stem("caf\u{e9}"), "caf%c3%a9");
    }

    #[test]
    fn test_file_store_separates_colliding_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("\u{1f600}", b"emoji").unwrap();
        store.save("\u{1f}600", b"control").unwrap();
        assert_eq!(store.load("\u{1f600}").unwrap().unwrap(), b"emoji".to_vec());
        assert_eq!(store.load("\u{1f}600").unwrap().unwrap(), b"control".to_vec());
    }

    #[test]
    fn test_corrupt_payload_is_compression_error() {
        let snapshot = CompressedSnapshot {
            room: "x".into(),
            original_size: 100,
            compressed: vec![100, 0, 0, 0, 0xff],
        };
        assert!(matches!(
            snapshot.decompress(),
            Err(StoreError::Compression(_))
        ));
    }
}
