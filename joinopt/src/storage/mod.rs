//! Storage engine interface consumed by the executor.
//!
//! The optimizer only reads [`TableDef`] and [`TableStats`] from a handler. The executor drives
//! the cursor operations; every "no row" outcome is an `Ok(None)`, errors are reserved for real
//! engine failures.

use datafusion_common::ScalarValue;
use thiserror::Error;

use crate::catalog::{TableDef, TableStats};

mod key;
mod memory;

pub use key::*;
pub use memory::*;

/// Values of one table row, in field order.
pub type Row = Vec<ScalarValue>;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("table {table} has no index {index}")]
    NoSuchIndex { table: String, index: usize },
    #[error("duplicate entry for key {key} of table {table}")]
    DuplicateKey { table: String, key: String },
    #[error("data too long for field {field} of table {table}")]
    DataTooLong { table: String, field: String },
    #[error("cursor is not positioned")]
    NoCursor,
    #[error("cannot store {value} in a key part of type {data_type}")]
    UnsupportedKeyValue { value: String, data_type: String },
    #[error("row has {actual} values, table {table} has {expected} fields")]
    RowArity {
        table: String,
        expected: usize,
        actual: usize,
    },
    #[error("corrupted data: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Direction in which an index is walked.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ScanOrder {
    #[default]
    Forward,
    Backward,
}

impl ScanOrder {
    pub fn reverse(self) -> Self {
        match self {
            ScanOrder::Forward => ScanOrder::Backward,
            ScanOrder::Backward => ScanOrder::Forward,
        }
    }
}

/// How a key image is matched against index entries.
///
/// The key image may cover a prefix of the index; matching is on that prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyMatch {
    /// First entry equal to the key.
    Exact,
    /// Last entry equal to the key.
    PrefixLast,
    /// First entry greater than or equal to the key.
    KeyOrNext,
    /// Last entry less than or equal to the key.
    KeyOrPrev,
}

/// Row access to one table.
pub trait TableHandler {
    fn def(&self) -> &TableDef;

    fn stats(&self) -> TableStats;

    /// Positions on the first (or last) entry of `index`.
    fn index_first(&mut self, index: usize, order: ScanOrder) -> StorageResult<Option<Row>>;

    /// Positions on `index` by a key image built with [`encode_key_part`].
    fn index_read(&mut self, index: usize, key: &[u8], mode: KeyMatch)
        -> StorageResult<Option<Row>>;

    fn index_next(&mut self) -> StorageResult<Option<Row>>;

    fn index_prev(&mut self) -> StorageResult<Option<Row>>;

    /// Next entry, as long as it still matches the key image `key`.
    fn index_next_same(&mut self, key: &[u8]) -> StorageResult<Option<Row>>;

    /// Previous entry, as long as it still matches the key image `key`.
    fn index_prev_same(&mut self, key: &[u8]) -> StorageResult<Option<Row>>;

    /// Key image of the entry the index cursor is positioned on.
    fn current_key(&self) -> StorageResult<&[u8]>;

    fn scan_first(&mut self) -> StorageResult<Option<Row>>;

    fn scan_next(&mut self) -> StorageResult<Option<Row>>;
}
