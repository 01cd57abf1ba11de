//! In-memory storage engine with sorted indexes.

use std::collections::HashSet;

use crate::catalog::{TableDef, TableStats};
use crate::storage::{
    encode_row_key, fits_field, KeyMatch, Row, ScanOrder, StorageError, StorageResult,
    TableHandler,
};

/// Index entries ordered by key image, ties by row id.
type IndexEntries = Vec<(Vec<u8>, usize)>;

#[derive(Clone, Copy, Debug)]
enum Cursor {
    Closed,
    Index { index: usize, pos: usize },
    Scan { pos: usize },
}

pub struct MemoryTable {
    def: TableDef,
    rows: Vec<Row>,
    indexes: Vec<IndexEntries>,
    cursor: Cursor,
}

impl MemoryTable {
    pub fn new(def: TableDef) -> Self {
        let indexes = vec![vec![]; def.keys.len()];
        Self {
            def,
            rows: vec![],
            indexes,
            cursor: Cursor::Closed,
        }
    }

    pub fn with_rows(def: TableDef, rows: Vec<Row>) -> StorageResult<Self> {
        let mut table = Self::new(def);
        for row in rows {
            table.insert(row)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, row: Row) -> StorageResult<()> {
        if row.len() != self.def.fields.len() {
            return Err(StorageError::RowArity {
                table: self.def.name.clone(),
                expected: self.def.fields.len(),
                actual: row.len(),
            });
        }
        let too_long = self.def.fields.iter().zip(&row).find(|(f, v)| !fits_field(f, v));
        if let Some((field, _)) = too_long {
            return Err(StorageError::DataTooLong {
                table: self.def.name.clone(),
                field: field.name.clone(),
            });
        }

        let mut images = Vec::with_capacity(self.def.keys.len());
        for (nr, key) in self.def.keys.iter().enumerate() {
            let image = encode_row_key(&self.def, nr, key.parts.len(), &row)?;
            let has_null = key.parts.iter().any(|f| row[*f].is_null());
            if key.unique && !has_null {
                let entries = &self.indexes[nr];
                let pos = entries.partition_point(|(k, _)| k < &image);
                if entries.get(pos).map_or(false, |(k, _)| k == &image) {
                    return Err(StorageError::DuplicateKey {
                        table: self.def.name.clone(),
                        key: key.name.clone(),
                    });
                }
            }
            images.push(image);
        }

        let row_id = self.rows.len();
        for (entries, image) in self.indexes.iter_mut().zip(images) {
            let pos = entries.partition_point(|(k, id)| (k, *id) < (&image, row_id));
            entries.insert(pos, (image, row_id));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn entries(&self, index: usize) -> StorageResult<&IndexEntries> {
        self.indexes.get(index).ok_or_else(|| StorageError::NoSuchIndex {
            table: self.def.name.clone(),
            index,
        })
    }

    fn row_at(&mut self, index: usize, pos: Option<usize>) -> Option<Row> {
        let entries = &self.indexes[index];
        match pos.filter(|p| *p < entries.len()) {
            Some(pos) => {
                self.cursor = Cursor::Index { index, pos };
                Some(self.rows[entries[pos].1].clone())
            }
            None => {
                self.cursor = Cursor::Closed;
                None
            }
        }
    }

    fn step(&mut self, forward: bool, key: Option<&[u8]>) -> StorageResult<Option<Row>> {
        let (index, pos) = match self.cursor {
            Cursor::Index { index, pos } => (index, pos),
            _ => return Err(StorageError::NoCursor),
        };
        let next = if forward {
            pos.checked_add(1)
        } else {
            pos.checked_sub(1)
        };
        let next = next.filter(|p| {
            self.indexes[index]
                .get(*p)
                .map_or(false, |(image, _)| key.map_or(true, |k| image.starts_with(k)))
        });
        Ok(self.row_at(index, next))
    }
}

fn prefix<'a>(image: &'a [u8], key: &[u8]) -> &'a [u8] {
    &image[..key.len().min(image.len())]
}

impl TableHandler for MemoryTable {
    fn def(&self) -> &TableDef {
        &self.def
    }

    fn stats(&self) -> TableStats {
        let rows = self.rows.len() as u64;
        let rec_per_key = self
            .def
            .keys
            .iter()
            .enumerate()
            .map(|(nr, key)| {
                let mut offset = 0;
                key.parts
                    .iter()
                    .map(|field| {
                        offset += self.def.fields[*field].store_length();
                        let distinct = self.indexes[nr]
                            .iter()
                            .map(|(image, _)| &image[..offset])
                            .collect::<HashSet<_>>()
                            .len()
                            .max(1);
                        (rows as f64 / distinct as f64).max(1.0)
                    })
                    .collect()
            })
            .collect();
        TableStats {
            rows,
            mean_rec_len: self.def.reclength(),
            rec_per_key,
            exact: true,
        }
    }

    fn index_first(&mut self, index: usize, order: ScanOrder) -> StorageResult<Option<Row>> {
        let len = self.entries(index)?.len();
        let pos = match order {
            ScanOrder::Forward => Some(0),
            ScanOrder::Backward => len.checked_sub(1),
        };
        Ok(self.row_at(index, pos))
    }

    fn index_read(
        &mut self,
        index: usize,
        key: &[u8],
        mode: KeyMatch,
    ) -> StorageResult<Option<Row>> {
        let entries = self.entries(index)?;
        let pos = match mode {
            KeyMatch::Exact => {
                let pos = entries.partition_point(|(image, _)| prefix(image, key) < key);
                Some(pos).filter(|p| entries.get(*p).map_or(false, |(i, _)| i.starts_with(key)))
            }
            KeyMatch::PrefixLast => {
                let end = entries.partition_point(|(image, _)| prefix(image, key) <= key);
                end.checked_sub(1)
                    .filter(|p| entries.get(*p).map_or(false, |(i, _)| i.starts_with(key)))
            }
            KeyMatch::KeyOrNext => {
                Some(entries.partition_point(|(image, _)| prefix(image, key) < key))
            }
            KeyMatch::KeyOrPrev => entries
                .partition_point(|(image, _)| prefix(image, key) <= key)
                .checked_sub(1),
        };
        Ok(self.row_at(index, pos))
    }

    fn index_next(&mut self) -> StorageResult<Option<Row>> {
        self.step(true, None)
    }

    fn index_prev(&mut self) -> StorageResult<Option<Row>> {
        self.step(false, None)
    }

    fn index_next_same(&mut self, key: &[u8]) -> StorageResult<Option<Row>> {
        self.step(true, Some(key))
    }

    fn index_prev_same(&mut self, key: &[u8]) -> StorageResult<Option<Row>> {
        self.step(false, Some(key))
    }

    fn current_key(&self) -> StorageResult<&[u8]> {
        match self.cursor {
            Cursor::Index { index, pos } => Ok(self.indexes[index][pos].0.as_slice()),
            _ => Err(StorageError::NoCursor),
        }
    }

    fn scan_first(&mut self) -> StorageResult<Option<Row>> {
        self.cursor = Cursor::Scan { pos: 0 };
        Ok(self.rows.first().cloned())
    }

    fn scan_next(&mut self) -> StorageResult<Option<Row>> {
        match self.cursor {
            Cursor::Scan { pos } => {
                self.cursor = Cursor::Scan { pos: pos + 1 };
                Ok(self.rows.get(pos + 1).cloned())
            }
            _ => Err(StorageError::NoCursor),
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::catalog::{FieldDef, KeyDef, TableDef};
    use crate::storage::{
        encode_key_part, KeyMatch, MemoryTable, ScanOrder, StorageError, TableHandler,
    };

    fn table() -> MemoryTable {
        let def = TableDef::new(
            "t",
            vec![
                FieldDef::new("a", DataType::Int64, true),
                FieldDef::new("b", DataType::Int64, false),
            ],
        )
        .with_key(KeyDef::new("ab", vec![0, 1]))
        .with_key(KeyDef::unique("b", vec![1]));
        let rows = [(Some(2), 1), (None, 2), (Some(1), 3), (Some(2), 4), (Some(3), 5)];
        MemoryTable::with_rows(
            def,
            rows.iter()
                .map(|(a, b)| vec![ScalarValue::Int64(*a), ScalarValue::Int64(Some(*b))])
                .collect(),
        )
        .unwrap()
    }

    fn key_a(t: &MemoryTable, v: Option<i64>) -> Vec<u8> {
        let mut key = vec![];
        encode_key_part(&t.def().fields[0], &ScalarValue::Int64(v), &mut key).unwrap();
        key
    }

    fn b_of(row: Option<Vec<ScalarValue>>) -> Option<i64> {
        row.map(|r| match r[1] {
            ScalarValue::Int64(Some(v)) => v,
            _ => panic!("unexpected value"),
        })
    }

    #[test]
    fn test_exact_and_next_same() {
        let mut t = table();
        let key = key_a(&t, Some(2));
        assert_eq!(Some(1), b_of(t.index_read(0, &key, KeyMatch::Exact).unwrap()));
        assert_eq!(Some(4), b_of(t.index_next_same(&key).unwrap()));
        assert_eq!(None, b_of(t.index_next_same(&key).unwrap()));
    }

    #[test]
    fn test_prefix_last_and_prev_same() {
        let mut t = table();
        let key = key_a(&t, Some(2));
        assert_eq!(Some(4), b_of(t.index_read(0, &key, KeyMatch::PrefixLast).unwrap()));
        assert_eq!(Some(1), b_of(t.index_prev_same(&key).unwrap()));
        assert_eq!(None, b_of(t.index_prev_same(&key).unwrap()));
    }

    #[test]
    fn test_null_key_and_order() {
        let mut t = table();
        let key = key_a(&t, None);
        assert_eq!(Some(2), b_of(t.index_read(0, &key, KeyMatch::Exact).unwrap()));
        assert_eq!(Some(2), b_of(t.index_first(0, ScanOrder::Forward).unwrap()));
        assert_eq!(Some(5), b_of(t.index_first(0, ScanOrder::Backward).unwrap()));
        assert_eq!(
            Some(5),
            b_of(t.index_read(0, &key_a(&t, Some(7)), KeyMatch::KeyOrPrev).unwrap())
        );
        assert_eq!(
            None,
            b_of(t.index_read(0, &key_a(&t, Some(7)), KeyMatch::KeyOrNext).unwrap())
        );
    }

    #[test]
    fn test_unique_violation() {
        let mut t = table();
        let err = t.insert(vec![ScalarValue::Int64(Some(9)), ScalarValue::Int64(Some(3))]);
        assert!(err.is_err());
        assert_eq!(5, t.len());
    }

    #[test]
    fn test_long_string_rejected() {
        let code_field = FieldDef::new("code", DataType::Utf8, false).with_length(4);
        let def = TableDef::new("s", vec![code_field])
            .with_key(KeyDef::unique("code", vec![0]));
        let mut t = MemoryTable::new(def);
        let code = |s: &str| vec![ScalarValue::Utf8(Some(s.to_string()))];

        t.insert(code("abcd")).unwrap();
        // Would share the image of "abcd" if it were cut to the field length.
        let err = t.insert(code("abcdX")).unwrap_err();
        assert!(matches!(err, StorageError::DataTooLong { .. }));
        assert!(matches!(t.insert(code("abcd")), Err(StorageError::DuplicateKey { .. })));
        t.insert(code("abc")).unwrap();
        assert_eq!(2, t.len());
    }

    #[test]
    fn test_stats() {
        let t = table();
        let stats = t.stats();
        assert_eq!(5, stats.rows);
        assert_eq!(Some(1.25), stats.records_per_key(0, 1));
        assert_eq!(Some(1.0), stats.records_per_key(1, 1));
    }
}
