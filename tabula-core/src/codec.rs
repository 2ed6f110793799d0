//! Tagged binary payloads: updates, snapshots, state vectors, awareness.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────────────────┐
//! │ tag      │ body                                 │
//! │ 1 byte   │ variable                             │
//! └──────────┴──────────────────────────────────────┘
//!
//! 0x01 update      yrs update (v1)
//! 0x02 snapshot    yrs update (v1) of the whole state
//! 0x03 state vec   yrs state vector (v1)
//! 0x04 awareness   bincode [AwarenessEntry]
//! ```
//!
//! Updates and snapshots decode to the same [`Update`], so either can be
//! fed to `apply_update`.

use crate::error::{DocError, DocResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::updates::decoder::Decode;
use yrs::{StateVector, Update};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    Update = 0x01,
    Snapshot = 0x02,
    StateVector = 0x03,
    Awareness = 0x04,
}

impl Format {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> DocResult<Self> {
        match tag {
            0x01 => Ok(Format::Update),
            0x02 => Ok(Format::Snapshot),
            0x03 => Ok(Format::StateVector),
            0x04 => Ok(Format::Awareness),
            other => Err(DocError::UnknownFormat(other)),
        }
    }
}

/// Prefixes an already encoded body with its tag.
pub fn frame(format: Format, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(format.tag());
    out.extend_from_slice(body);
    out
}

/// Tag + bincode body. Encoding our own types does not fail in practice;
/// if it ever does the error is logged and an empty payload returned, which
/// every decoder rejects.
pub(crate) fn encode<T: Serialize>(format: Format, body: &T) -> Vec<u8> {
    match bincode::serde::encode_to_vec(body, bincode::config::standard()) {
        Ok(encoded) => frame(format, &encoded),
        Err(e) => {
            log::error!("failed to encode {:?} payload: {}", format, e);
            Vec::new()
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], expected: Format) -> DocResult<T> {
    let body = expect(bytes, expected)?;
    let (value, read) = bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map_err(|e| DocError::Decode(e.to_string()))?;
    if read != body.len() {
        return Err(DocError::Decode(format!(
            "{} trailing bytes",
            body.len() - read
        )));
    }
    Ok(value)
}

fn expect(bytes: &[u8], expected: Format) -> DocResult<&[u8]> {
    let format = peek_format(bytes)?;
    if format != expected {
        return Err(DocError::Decode(format!(
            "expected {:?} payload, found {:?}",
            expected, format
        )));
    }
    Ok(&bytes[1..])
}

pub fn peek_format(bytes: &[u8]) -> DocResult<Format> {
    match bytes.first() {
        Some(&tag) => Format::from_tag(tag),
        None => Err(DocError::Empty),
    }
}

/// Decodes either an update or a snapshot.
pub fn decode_update(bytes: &[u8]) -> DocResult<Update> {
    match peek_format(bytes)? {
        Format::Update | Format::Snapshot => Ok(Update::decode_v1(&bytes[1..])?),
        other => Err(DocError::Decode(format!(
            "{:?} payload is not a document update",
            other
        ))),
    }
}

/// Empty input means "nothing seen", which asks the peer for everything.
pub fn decode_state_vector(bytes: &[u8]) -> DocResult<StateVector> {
    if bytes.is_empty() {
        return Ok(StateVector::default());
    }
    let body = expect(bytes, Format::StateVector)?;
    Ok(StateVector::decode_v1(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellKey, Scalar};
    use crate::store::{Field, ReplicatedStore, Slot, SlotValue};

    fn sample_update() -> (ReplicatedStore, Vec<u8>) {
        let mut store = ReplicatedStore::new();
        let (update, _) = store
            .write(&[(
                Slot::cell(CellKey::new(2, 3), Field::Value),
                Some(SlotValue::Scalar(Scalar::from("Q1 Revenue"))),
            )])
            .unwrap();
        (store, frame(Format::Update, &update))
    }

    #[test]
    fn test_update_decodes() {
        let (_, bytes) = sample_update();
        assert_eq!(bytes[0], 0x01);
        let mut other = ReplicatedStore::new();
        let (learned, changes) = other.apply(decode_update(&bytes).unwrap()).unwrap();
        assert!(learned);
        assert_eq!(changes.cells.len(), 1);
    }

    #[test]
    fn test_empty_and_unknown_tag() {
        assert!(matches!(decode_update(&[]), Err(DocError::Empty)));
        assert!(matches!(
            decode_update(&[0x7f, 0, 0]),
            Err(DocError::UnknownFormat(0x7f))
        ));
    }

    #[test]
    fn test_unterminated_body_is_decode_error() {
        let err = decode_update(&[0x01, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, DocError::Decode(_)));
        assert!(!err.is_integrity());
    }

    #[test]
    fn test_state_vector_empty_bytes() {
        assert_eq!(decode_state_vector(&[]).unwrap(), StateVector::default());

        let (store, _) = sample_update();
        let bytes = frame(Format::StateVector, &store.encode_state_vector());
        assert_eq!(decode_state_vector(&bytes).unwrap(), store.state_vector());
    }

    #[test]
    fn test_state_vector_is_not_an_update() {
        let bytes = frame(Format::StateVector, &[0]);
        assert!(matches!(decode_update(&bytes), Err(DocError::Decode(_))));
        let (_, update) = sample_update();
        assert!(matches!(decode_state_vector(&update), Err(DocError::Decode(_))));
    }
}
