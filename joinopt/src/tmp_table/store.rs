use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow_schema::DataType;
use datafusion_common::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::error::JoinResult;
use crate::storage::{Row, StorageError, StorageResult};

static TMP_FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Value as written to a disk temporary table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum StoredValue {
    Null,
    Boolean(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl StoredValue {
    fn from_scalar(value: &ScalarValue) -> StorageResult<Self> {
        if value.is_null() {
            return Ok(StoredValue::Null);
        }
        let stored = match value {
            ScalarValue::Boolean(Some(v)) => StoredValue::Boolean(*v),
            ScalarValue::Int8(Some(v)) => StoredValue::Int(i64::from(*v)),
            ScalarValue::Int16(Some(v)) => StoredValue::Int(i64::from(*v)),
            ScalarValue::Int32(Some(v)) => StoredValue::Int(i64::from(*v)),
            ScalarValue::Int64(Some(v)) => StoredValue::Int(*v),
            ScalarValue::UInt8(Some(v)) => StoredValue::UInt(u64::from(*v)),
            ScalarValue::UInt16(Some(v)) => StoredValue::UInt(u64::from(*v)),
            ScalarValue::UInt32(Some(v)) => StoredValue::UInt(u64::from(*v)),
            ScalarValue::UInt64(Some(v)) => StoredValue::UInt(*v),
            ScalarValue::Float32(Some(v)) => StoredValue::Float(f64::from(*v)),
            ScalarValue::Float64(Some(v)) => StoredValue::Float(*v),
            ScalarValue::Date32(Some(v)) => StoredValue::Int(i64::from(*v)),
            ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) => {
                StoredValue::Utf8(v.clone())
            }
            ScalarValue::Binary(Some(v)) | ScalarValue::LargeBinary(Some(v)) => {
                StoredValue::Binary(v.clone())
            }
            other => {
                return Err(StorageError::UnsupportedKeyValue {
                    value: other.to_string(),
                    data_type: other.get_datatype().to_string(),
                })
            }
        };
        Ok(stored)
    }

    fn into_scalar(self, data_type: &DataType) -> StorageResult<ScalarValue> {
        let mismatch = |v: &StoredValue| {
            StorageError::Corrupted(format!("{:?} stored in a field of type {}", v, data_type))
        };
        let value = match (self, data_type) {
            (StoredValue::Null, dt) => crate::value::null_of(dt),
            (StoredValue::Boolean(v), DataType::Boolean) => ScalarValue::Boolean(Some(v)),
            (StoredValue::Int(v), DataType::Int8) => ScalarValue::Int8(Some(v as i8)),
            (StoredValue::Int(v), DataType::Int16) => ScalarValue::Int16(Some(v as i16)),
            (StoredValue::Int(v), DataType::Int32) => ScalarValue::Int32(Some(v as i32)),
            (StoredValue::Int(v), DataType::Int64) => ScalarValue::Int64(Some(v)),
            (StoredValue::Int(v), DataType::Date32) => ScalarValue::Date32(Some(v as i32)),
            (StoredValue::UInt(v), DataType::UInt8) => ScalarValue::UInt8(Some(v as u8)),
            (StoredValue::UInt(v), DataType::UInt16) => ScalarValue::UInt16(Some(v as u16)),
            (StoredValue::UInt(v), DataType::UInt32) => ScalarValue::UInt32(Some(v as u32)),
            (StoredValue::UInt(v), DataType::UInt64) => ScalarValue::UInt64(Some(v)),
            (StoredValue::Float(v), DataType::Float32) => ScalarValue::Float32(Some(v as f32)),
            (StoredValue::Float(v), DataType::Float64) => ScalarValue::Float64(Some(v)),
            (StoredValue::Utf8(v), DataType::Utf8) => ScalarValue::Utf8(Some(v)),
            (StoredValue::Utf8(v), DataType::LargeUtf8) => ScalarValue::LargeUtf8(Some(v)),
            (StoredValue::Binary(v), DataType::Binary) => ScalarValue::Binary(Some(v)),
            (StoredValue::Binary(v), DataType::LargeBinary) => ScalarValue::LargeBinary(Some(v)),
            (v, _) => return Err(mismatch(&v)),
        };
        Ok(value)
    }
}

/// Rows of a temporary table kept in a file, one JSON line per row version.
///
/// An update appends the new version and repoints the row, the file only grows.
#[derive(Debug)]
pub struct DiskStore {
    path: PathBuf,
    file: File,
    types: Vec<DataType>,
    /// Byte offset and length of the current version of every row.
    offsets: Vec<(u64, usize)>,
    end: u64,
}

impl DiskStore {
    pub fn create(dir: &Path, types: Vec<DataType>) -> StorageResult<Self> {
        let path = dir.join(format!(
            "#sql_{}_{}.jsonl",
            std::process::id(),
            TMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        log::debug!("created disk temporary table {}", path.display());
        Ok(Self {
            path,
            file,
            types,
            offsets: vec![],
            end: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    fn append(&mut self, row: &Row) -> StorageResult<(u64, usize)> {
        let stored = row
            .iter()
            .map(StoredValue::from_scalar)
            .collect::<StorageResult<Vec<_>>>()?;
        let mut line = serde_json::to_vec(&stored)
            .map_err(|e| StorageError::Corrupted(e.to_string()))?;
        line.push(b'\n');
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&line)?;
        let at = (self.end, line.len() - 1);
        self.end += line.len() as u64;
        Ok(at)
    }

    pub fn push(&mut self, row: &Row) -> StorageResult<usize> {
        let at = self.append(row)?;
        self.offsets.push(at);
        Ok(self.offsets.len() - 1)
    }

    pub fn update(&mut self, pos: usize, row: &Row) -> StorageResult<()> {
        let at = self.append(row)?;
        self.offsets[pos] = at;
        Ok(())
    }

    pub fn get(&mut self, pos: usize) -> StorageResult<Row> {
        let (offset, len) = self.offsets[pos];
        let mut buf = vec![0; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        let stored: Vec<StoredValue> =
            serde_json::from_slice(&buf).map_err(|e| StorageError::Corrupted(e.to_string()))?;
        if stored.len() != self.types.len() {
            return Err(StorageError::Corrupted(format!(
                "row of {} values in a table of {} fields",
                stored.len(),
                self.types.len()
            )));
        }
        stored
            .into_iter()
            .zip(&self.types)
            .map(|(v, dt)| v.into_scalar(dt))
            .collect()
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!(
                "failed to remove temporary table {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Where the rows of a temporary table live.
#[derive(Debug)]
pub enum RowStore {
    Heap(Vec<Row>),
    Disk(DiskStore),
}

impl RowStore {
    pub fn len(&self) -> usize {
        match self {
            RowStore::Heap(rows) => rows.len(),
            RowStore::Disk(disk) => disk.len(),
        }
    }

    pub fn push(&mut self, row: Row) -> JoinResult<usize> {
        match self {
            RowStore::Heap(rows) => {
                rows.try_reserve(1)?;
                rows.push(row);
                Ok(rows.len() - 1)
            }
            RowStore::Disk(disk) => Ok(disk.push(&row)?),
        }
    }

    pub fn update(&mut self, pos: usize, row: Row) -> JoinResult<()> {
        match self {
            RowStore::Heap(rows) => rows[pos] = row,
            RowStore::Disk(disk) => disk.update(pos, &row)?,
        }
        Ok(())
    }

    pub fn get(&mut self, pos: usize) -> JoinResult<Row> {
        match self {
            RowStore::Heap(rows) => Ok(rows[pos].clone()),
            RowStore::Disk(disk) => Ok(disk.get(pos)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::tmp_table::DiskStore;

    #[test]
    fn test_disk_store_update_and_cleanup() {
        let dir = std::env::temp_dir();
        let mut disk = DiskStore::create(&dir, vec![DataType::Int32, DataType::Utf8]).unwrap();
        let path = disk.path().to_path_buf();

        disk.push(&vec![ScalarValue::Int32(Some(1)), ScalarValue::Utf8(None)])
            .unwrap();
        disk.push(&vec![ScalarValue::Int32(None), ScalarValue::Utf8(Some("b".into()))])
            .unwrap();
        disk.update(0, &vec![ScalarValue::Int32(Some(7)), ScalarValue::Utf8(Some("a".into()))])
            .unwrap();

        assert_eq!(2, disk.len());
        assert_eq!(
            vec![ScalarValue::Int32(Some(7)), ScalarValue::Utf8(Some("a".into()))],
            disk.get(0).unwrap()
        );
        assert_eq!(
            vec![ScalarValue::Int32(None), ScalarValue::Utf8(Some("b".into()))],
            disk.get(1).unwrap()
        );

        drop(disk);
        assert!(!path.exists());
    }
}
