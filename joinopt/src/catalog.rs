//! Table and index metadata consumed by the optimizer.

use std::fmt::{Debug, Display, Formatter};

use arrow_schema::DataType;
use derive_more::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

use crate::table_map::TableNo;

/// A field of one query table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table: TableNo,
    pub field: usize,
}

impl ColumnRef {
    pub fn new(table: TableNo, field: usize) -> Self {
        Self { table, field }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Storage width in bytes, without the null indicator.
    pub length: usize,
}

impl FieldDef {
    pub fn new<S: Into<String>>(name: S, data_type: DataType, nullable: bool) -> Self {
        let length = default_length(&data_type);
        Self {
            name: name.into(),
            data_type,
            nullable,
            length,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Whether two fields have the same definition, the precondition for placing them in one
    /// multiple equality.
    pub fn eq_def(&self, other: &FieldDef) -> bool {
        self.data_type == other.data_type && self.length == other.length
    }

    pub fn is_string(&self) -> bool {
        matches!(self.data_type, DataType::Utf8 | DataType::LargeUtf8)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.data_type,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Float32
                | DataType::Float64
        )
    }

    /// Variable length fields that an in-memory temporary table cannot hold.
    pub fn is_blob(&self) -> bool {
        matches!(
            self.data_type,
            DataType::LargeUtf8 | DataType::Binary | DataType::LargeBinary
        )
    }

    pub fn pack_length(&self) -> usize {
        self.length
    }

    /// Bytes the field occupies inside a key, null indicator included.
    pub fn store_length(&self) -> usize {
        self.length + usize::from(self.nullable)
    }
}

fn default_length(data_type: &DataType) -> usize {
    match data_type {
        DataType::Boolean | DataType::Int8 | DataType::UInt8 => 1,
        DataType::Int16 | DataType::UInt16 => 2,
        DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::Date32 => 4,
        DataType::Utf8 => 32,
        DataType::LargeUtf8 | DataType::Binary | DataType::LargeBinary => 255,
        _ => 8,
    }
}

/// Set of indexes of one table, one bit per key number.
#[derive(Copy, Clone, PartialEq, Eq, Default, BitAnd, BitAndAssign, BitOr, BitOrAssign)]
pub struct KeyMap(u64);

impl KeyMap {
    pub const EMPTY: KeyMap = KeyMap(0);

    pub fn of(key: usize) -> Self {
        KeyMap(1 << key)
    }

    pub fn all(keys: usize) -> Self {
        if keys >= 64 {
            KeyMap(u64::MAX)
        } else {
            KeyMap((1 << keys) - 1)
        }
    }

    pub fn contains(&self, key: usize) -> bool {
        key < 64 && self.0 & (1 << key) != 0
    }

    pub fn insert(&mut self, key: usize) {
        self.0 |= 1 << key;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..64).filter(move |k| bits & (1 << k) != 0)
    }
}

impl Debug for KeyMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An ordered index over some fields of a table.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyDef {
    pub name: String,
    /// Field numbers, in key order.
    pub parts: Vec<usize>,
    pub unique: bool,
    /// Whether the engine can walk this index backwards.
    pub can_read_backward: bool,
}

impl KeyDef {
    pub fn new<S: Into<String>>(name: S, parts: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            parts,
            unique: false,
            can_read_backward: true,
        }
    }

    pub fn unique<S: Into<String>>(name: S, parts: Vec<usize>) -> Self {
        Self {
            unique: true,
            ..Self::new(name, parts)
        }
    }

    pub fn forward_only(mut self) -> Self {
        self.can_read_backward = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub keys: Vec<KeyDef>,
}

impl TableDef {
    pub fn new<S: Into<String>>(name: S, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            keys: vec![],
        }
    }

    pub fn with_key(mut self, key: KeyDef) -> Self {
        self.keys.push(key);
        self
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn key_part_field(&self, key: usize, part: usize) -> &FieldDef {
        &self.fields[self.keys[key].parts[part]]
    }

    /// Whether a lookup on `key` can match more than one row even with all parts bound.
    pub fn key_has_nullable_part(&self, key: usize) -> bool {
        self.keys[key]
            .parts
            .iter()
            .any(|f| self.fields[*f].nullable)
    }

    /// Length in bytes of the first `parts` key parts.
    pub fn key_prefix_length(&self, key: usize, parts: usize) -> usize {
        self.keys[key].parts[..parts]
            .iter()
            .map(|f| self.fields[*f].store_length())
            .sum()
    }

    pub fn key_length(&self, key: usize) -> usize {
        self.key_prefix_length(key, self.keys[key].parts.len())
    }

    /// Keys containing `field` at any position.
    pub fn part_of_key(&self, field: usize) -> KeyMap {
        let mut map = KeyMap::EMPTY;
        for (nr, key) in self.keys.iter().enumerate() {
            if key.parts.contains(&field) {
                map.insert(nr);
            }
        }
        map
    }

    /// Keys whose first part is `field`.
    pub fn key_start(&self, field: usize) -> KeyMap {
        let mut map = KeyMap::EMPTY;
        for (nr, key) in self.keys.iter().enumerate() {
            if key.parts.first() == Some(&field) {
                map.insert(nr);
            }
        }
        map
    }

    /// Keys from which all of `fields` can be read without touching the row.
    pub fn covering_keys(&self, fields: &[usize]) -> KeyMap {
        let mut map = KeyMap::EMPTY;
        for (nr, key) in self.keys.iter().enumerate() {
            if fields.iter().all(|f| key.parts.contains(f)) {
                map.insert(nr);
            }
        }
        map
    }

    /// Length of a fixed-width record: null bitmap followed by all fields.
    pub fn reclength(&self) -> usize {
        let null_fields = self.fields.iter().filter(|f| f.nullable).count();
        (null_fields + 7) / 8 + self.fields.iter().map(|f| f.pack_length()).sum::<usize>()
    }
}

impl Display for TableDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Row count and selectivity statistics of a table.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TableStats {
    /// Approximate row count.
    pub rows: u64,
    pub mean_rec_len: usize,
    /// `rec_per_key[key][n]`: average rows sharing one value of the first `n + 1` key parts.
    pub rec_per_key: Vec<Vec<f64>>,
    /// Whether `rows` is exact, which allows tables with at most one row to be read up front.
    pub exact: bool,
}

impl TableStats {
    pub fn records_per_key(&self, key: usize, prefix_parts: usize) -> Option<f64> {
        if prefix_parts == 0 {
            return None;
        }
        self.rec_per_key
            .get(key)
            .and_then(|parts| parts.get(prefix_parts - 1))
            .copied()
    }
}
