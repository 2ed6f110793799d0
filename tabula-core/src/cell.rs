//! Cell addressing and the cell record model.
//!
//! ```text
//! CellKey (u64)
//! ┌────────────────────┬────────────────────┐
//! │ row (u32, high)    │ col (u32, low)     │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! Keys sort row-major, so a sorted index over keys gives range reads
//! without a map of maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical integer encoding of a `(row, col)` coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellKey(pub u64);

impl CellKey {
    pub fn new(row: u32, col: u32) -> Self {
        Self(((row as u64) << 32) | col as u64)
    }

    pub fn row(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn col(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn coords(self) -> (u32, u32) {
        (self.row(), self.col())
    }
}

impl From<CellRef> for CellKey {
    fn from(r: CellRef) -> Self {
        CellKey::new(r.row, r.col)
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}C{}", self.row(), self.col())
    }
}

/// Zero-based coordinate of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    pub fn key(self) -> CellKey {
        CellKey::from(self)
    }
}

impl From<CellKey> for CellRef {
    fn from(key: CellKey) -> Self {
        Self::new(key.row(), key.col())
    }
}

/// Inclusive rectangular range. Always normalised so `start <= end` on
/// both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub start: CellRef,
    pub end: CellRef,
}

impl CellRange {
    pub fn new(r0: u32, c0: u32, r1: u32, c1: u32) -> Self {
        Self {
            start: CellRef::new(r0.min(r1), c0.min(c1)),
            end: CellRef::new(r0.max(r1), c0.max(c1)),
        }
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        (self.start.row..=self.end.row).contains(&cell.row)
            && (self.start.col..=self.end.col).contains(&cell.col)
    }

    /// Number of cells covered by the range. A whole sheet is 2^64 cells,
    /// one more than `u64` holds.
    pub fn cell_count(&self) -> u128 {
        let rows = (self.end.row - self.start.row) as u128 + 1;
        let cols = (self.end.col - self.start.col) as u128 + 1;
        rows * cols
    }

    /// Row-major iteration over every coordinate in the range. Lazy, so a
    /// whole-sheet range costs nothing until it is consumed.
    pub fn iter(self) -> impl Iterator<Item = CellRef> {
        let (cols_start, cols_end) = (self.start.col, self.end.col);
        (self.start.row..=self.end.row)
            .flat_map(move |row| (cols_start..=cols_end).map(move |col| CellRef::new(row, col)))
    }
}

/// A plain cell value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Number(n as f64)
    }
}

impl From<i32> for Scalar {
    fn from(n: i32) -> Self {
        Scalar::Number(n as f64)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// Structured style attributes, e.g. `{bold: true, color: "#f00"}`.
///
/// The whole object is one mergeable field of the cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellFormat(pub BTreeMap<String, Scalar>);

impl CellFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The visible contents of one cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellRecord {
    pub value: Scalar,
    pub formula: Option<String>,
    pub format: Option<CellFormat>,
}

impl CellRecord {
    pub fn with_value(value: impl Into<Scalar>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }
}

/// A partial update to a cell. Fields left as `None` are not touched.
///
/// `formula` and `format` are doubly optional: `Some(None)` clears the
/// field, `None` leaves it alone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellPatch {
    pub value: Option<Scalar>,
    pub formula: Option<Option<String>>,
    pub format: Option<Option<CellFormat>>,
}

impl CellPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<Scalar>) -> Self {
        Self::new().with_value(value)
    }

    pub fn format(format: CellFormat) -> Self {
        Self::new().with_format(format)
    }

    pub fn with_value(mut self, value: impl Into<Scalar>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(Some(formula.into()));
        self
    }

    pub fn clear_formula(mut self) -> Self {
        self.formula = Some(None);
        self
    }

    pub fn with_format(mut self, format: CellFormat) -> Self {
        self.format = Some(Some(format));
        self
    }

    pub fn clear_format(mut self) -> Self {
        self.format = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.formula.is_none() && self.format.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip_extremes() {
        for &(r, c) in &[(0, 0), (2, 3), (u32::MAX, 0), (0, u32::MAX), (u32::MAX, u32::MAX)] {
            let key = CellKey::new(r, c);
            assert_eq!(key.coords(), (r, c));
        }
    }

    #[test]
    fn test_keys_sort_row_major() {
        let mut keys = vec![CellKey::new(1, 0), CellKey::new(0, 5), CellKey::new(0, 1)];
        keys.sort();
        assert_eq!(
            keys.iter().map(|k| k.coords()).collect::<Vec<_>>(),
            vec![(0, 1), (0, 5), (1, 0)]
        );
    }

    #[test]
    fn test_range_normalises_reversed_bounds() {
        let range = CellRange::new(5, 4, 1, 2);
        assert_eq!(range.start, CellRef::new(1, 2));
        assert_eq!(range.end, CellRef::new(5, 4));
        assert_eq!(range.cell_count(), 15);
        assert!(range.contains(CellRef::new(3, 3)));
        assert!(!range.contains(CellRef::new(0, 3)));
    }

    #[test]
    fn test_range_iter_row_major() {
        let cells: Vec<_> = CellRange::new(0, 0, 1, 1).iter().collect();
        assert_eq!(
            cells,
            vec![CellRef::new(0, 0), CellRef::new(0, 1), CellRef::new(1, 0), CellRef::new(1, 1)]
        );
    }

    #[test]
    fn test_whole_sheet_range_iterates_lazily() {
        let range = CellRange::new(0, 0, u32::MAX, u32::MAX);
        assert_eq!(range.cell_count(), 1u128 << 64);
        let first: Vec<_> = range.iter().take(2).collect();
        assert_eq!(first, vec![CellRef::new(0, 0), CellRef::new(0, 1)]);
    }

    #[test]
    fn test_patch_builders() {
        let patch = CellPatch::value("x").with_formula("=A1").clear_format();
        assert_eq!(patch.value, Some(Scalar::from("x")));
        assert_eq!(patch.formula, Some(Some("=A1".to_string())));
        assert_eq!(patch.format, Some(None));
        assert!(CellPatch::new().is_empty());
    }
}
