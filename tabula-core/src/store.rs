//! Cell and metadata storage on top of a [`yrs::Doc`].
//!
//! ```text
//!  yrs::Doc
//! ┌───────────────────────────────────────────────────────────┐
//! │ "value"   Map  "8589934595" -> "{\"Text\":\"Q1 Revenue\"}"│
//! │ "formula" Map  "8589934595" -> "\"=SUM(A1:A9)\""          │
//! │ "format"  Map  "8589934595" -> "{\"bold\":true}"          │
//! │ "meta"    Map  "rows"       -> "{\"Number\":100.0}"       │
//! └───────────────────────────────────────────────────────────┘
//!        │ map observers record touched keys
//!        ▼
//!  cache: BTreeMap<CellKey, CellRecord>   (sorted, row-major)
//! ```
//!
//! Each field of a cell lives in its own root map keyed by the decimal
//! [`CellKey`], so two replicas creating the same cell concurrently never
//! race on a shared nested container. Values are JSON strings.
//!
//! Reads are served from the cache. After every transaction the keys the
//! observers saw are re-read from the doc and the cache entries replaced.

use crate::cell::{CellFormat, CellKey, CellRecord, Scalar};
use crate::error::{DocError, DocResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, Observable, ReadTxn, StateVector, Subscription, Transact, Update};

/// yrs origin of transactions made through the document API.
pub(crate) const LOCAL_ORIGIN: &str = "tabula:local";
/// yrs origin of transactions integrating a peer's update.
pub(crate) const REMOTE_ORIGIN: &str = "tabula:remote";

/// Independently mergeable field of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Value,
    Formula,
    Format,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Value, Field::Formula, Field::Format];

    fn index(self) -> usize {
        match self {
            Field::Value => 0,
            Field::Formula => 1,
            Field::Format => 2,
        }
    }

    fn root(self) -> &'static str {
        match self {
            Field::Value => "value",
            Field::Formula => "formula",
            Field::Format => "format",
        }
    }
}

/// Top-level container a change belongs to; undo scopes select by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Container {
    Cells,
    Meta,
}

/// Address of one stored field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    Cell { key: CellKey, field: Field },
    Meta(String),
}

impl Slot {
    pub fn cell(key: CellKey, field: Field) -> Self {
        Slot::Cell { key, field }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Scalar(Scalar),
    Text(String),
    Format(CellFormat),
}

impl SlotValue {
    fn to_json(&self) -> serde_json::Result<String> {
        match self {
            SlotValue::Scalar(v) => serde_json::to_string(v),
            SlotValue::Text(v) => serde_json::to_string(v),
            SlotValue::Format(v) => serde_json::to_string(v),
        }
    }
}

/// Keys a transaction changed, in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub cells: Vec<(CellKey, Option<CellRecord>)>,
    pub meta: Vec<(String, Option<Scalar>)>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.meta.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Touched {
    Cell(CellKey),
    Meta(String),
}

type TouchLog = Arc<Mutex<Vec<Touched>>>;

pub struct ReplicatedStore {
    doc: Doc,
    fields: [MapRef; 3],
    meta: MapRef,
    cells: BTreeMap<CellKey, CellRecord>,
    meta_cache: BTreeMap<String, Scalar>,
    touched: TouchLog,
    _observers: Vec<Subscription>,
}

impl Default for ReplicatedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedStore {
    pub fn new() -> Self {
        let doc = Doc::new();
        let fields = Field::ALL.map(|field| doc.get_or_insert_map(field.root()));
        let meta = doc.get_or_insert_map("meta");
        let touched: TouchLog = Arc::new(Mutex::new(Vec::new()));

        let mut observers = Vec::with_capacity(4);
        for map in &fields {
            let log = touched.clone();
            observers.push(map.observe(move |txn, event| {
                let keys = event
                    .keys(txn)
                    .iter()
                    .filter_map(|(key, _)| key.parse::<u64>().ok())
                    .map(|k| Touched::Cell(CellKey(k)));
                if let Ok(mut log) = log.lock() {
                    log.extend(keys);
                }
            }));
        }
        let log = touched.clone();
        observers.push(meta.observe(move |txn, event| {
            let keys = event
                .keys(txn)
                .iter()
                .map(|(key, _)| Touched::Meta(key.to_string()));
            if let Ok(mut log) = log.lock() {
                log.extend(keys);
            }
        }));

        Self {
            doc,
            fields,
            meta,
            cells: BTreeMap::new(),
            meta_cache: BTreeMap::new(),
            touched,
            _observers: observers,
        }
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Root maps holding `container`.
    pub(crate) fn maps(&self, container: Container) -> Vec<&MapRef> {
        match container {
            Container::Cells => self.fields.iter().collect(),
            Container::Meta => vec![&self.meta],
        }
    }

    pub fn record(&self, key: CellKey) -> Option<CellRecord> {
        self.cells.get(&key).cloned()
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.cells.contains_key(&key)
    }

    /// Non-empty cells in key order.
    pub fn records(&self) -> impl Iterator<Item = (CellKey, &CellRecord)> + '_ {
        self.cells.iter().map(|(k, r)| (*k, r))
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn meta(&self, name: &str) -> Option<&Scalar> {
        self.meta_cache.get(name)
    }

    /// Runs `writes` as one local transaction and returns its update.
    pub fn write(&mut self, writes: &[(Slot, Option<SlotValue>)]) -> DocResult<(Vec<u8>, Changes)> {
        let update = {
            let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
            for (slot, value) in writes {
                let (map, key) = match slot {
                    Slot::Cell { key, field } => (&self.fields[field.index()], key.0.to_string()),
                    Slot::Meta(name) => (&self.meta, name.clone()),
                };
                match value {
                    Some(value) => {
                        let json = value
                            .to_json()
                            .map_err(|e| DocError::Decode(e.to_string()))?;
                        map.insert(&mut txn, key, json);
                    }
                    None => {
                        map.remove(&mut txn, &key);
                    }
                }
            }
            txn.encode_update_v1()
        };
        Ok((update, self.refresh()))
    }

    /// Integrates a decoded peer update. Returns what became visible and
    /// whether the doc learned anything new.
    pub fn apply(&mut self, update: Update) -> DocResult<(bool, Changes)> {
        let before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(update)
                .map_err(|e| DocError::Integrity(e.to_string()))?;
        }
        let changes = self.refresh();
        let learned = self.state_vector() != before || !changes.is_empty();
        Ok((learned, changes))
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Everything the doc holds, as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default())
    }

    /// Blocks missing from `since`, plus the whole delete set.
    pub fn encode_diff(&self, since: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(since)
    }

    /// Re-reads every key the observers recorded since the last call and
    /// updates the cache.
    pub fn refresh(&mut self) -> Changes {
        let touched: BTreeSet<Touched> = match self.touched.lock() {
            Ok(mut log) => log.drain(..).collect(),
            Err(_) => {
                log::error!("touched-key log poisoned, cache left as is");
                return Changes::default();
            }
        };
        if touched.is_empty() {
            return Changes::default();
        }

        let mut changes = Changes::default();
        let txn = self.doc.transact();
        for t in touched {
            match t {
                Touched::Cell(key) => {
                    let record = self.read_record(&txn, key);
                    match &record {
                        Some(r) => self.cells.insert(key, r.clone()),
                        None => self.cells.remove(&key),
                    };
                    changes.cells.push((key, record));
                }
                Touched::Meta(name) => {
                    let value = read_json::<Scalar, _>(&self.meta, &txn, &name);
                    match &value {
                        Some(v) => self.meta_cache.insert(name.clone(), v.clone()),
                        None => self.meta_cache.remove(&name),
                    };
                    changes.meta.push((name, value));
                }
            }
        }
        changes
    }

    fn read_record<T: ReadTxn>(&self, txn: &T, key: CellKey) -> Option<CellRecord> {
        let k = key.0.to_string();
        let value = read_json::<Scalar, _>(&self.fields[Field::Value.index()], txn, &k);
        let formula = read_json::<String, _>(&self.fields[Field::Formula.index()], txn, &k);
        let format = read_json::<CellFormat, _>(&self.fields[Field::Format.index()], txn, &k);
        if value.is_none() && formula.is_none() && format.is_none() {
            return None;
        }
        Some(CellRecord {
            value: value.unwrap_or_default(),
            formula,
            format,
        })
    }
}

/// A stored string that does not parse as `V` reads as absent.
fn read_json<V, T>(map: &MapRef, txn: &T, key: &str) -> Option<V>
where
    V: serde::de::DeserializeOwned,
    T: ReadTxn,
{
    let json = map.get(txn, key)?.to_string(txn);
    match serde_json::from_str(&json) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("ignoring unreadable entry {:?}: {}", key, e);
            None
        }
    }
}
