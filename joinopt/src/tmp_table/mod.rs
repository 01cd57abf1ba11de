//! Temporary tables for GROUP BY, DISTINCT and sorted output.
//!
//! A table starts in memory and moves to disk once it outgrows `max_heap_table_size`. Tables
//! holding blobs, or whose key needs a hash constraint, are created on disk right away.

use std::collections::HashMap;

use anyhow::anyhow;
use smallvec::SmallVec;

use crate::context::OptimizerSettings;
use crate::error::{JoinError, JoinResult};
use crate::predicate::RowSource;
use crate::storage::Row;

mod layout;
mod store;

pub use layout::*;
pub use store::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same key is already stored, nothing was written.
    Duplicate,
}

#[derive(Debug)]
pub struct TmpTable {
    layout: TmpTableLayout,
    store: RowStore,
    /// Rows by key image. Images may collide, rows are compared in full.
    index: HashMap<Vec<u8>, SmallVec<[usize; 1]>>,
    heap_capacity: usize,
    settings: OptimizerSettings,
}

impl TmpTable {
    pub fn create(
        layout: TmpTableLayout,
        settings: &OptimizerSettings,
        big_result: bool,
    ) -> JoinResult<Self> {
        let heap_capacity = (settings.max_heap_table_size / layout.reclength().max(1)).max(1);
        let on_disk =
            layout.has_blobs() || layout.unique_constraint || settings.big_tables || big_result;
        let store = if on_disk {
            RowStore::Disk(DiskStore::create(&settings.tmpdir, layout_types(&layout))?)
        } else {
            RowStore::Heap(vec![])
        };
        log::debug!(
            "temporary table with {} fields, key length {}, {}",
            layout.fields.len(),
            layout.key_length,
            if on_disk { "on disk" } else { "in memory" }
        );
        Ok(Self {
            layout,
            store,
            index: HashMap::new(),
            heap_capacity,
            settings: settings.clone(),
        })
    }

    pub fn layout(&self) -> &TmpTableLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.store, RowStore::Disk(_))
    }

    /// Position of the stored row with the key of `row`.
    fn find(&mut self, image: &[u8], row: &Row) -> JoinResult<Option<usize>> {
        let Some(candidates) = self.index.get(image) else {
            return Ok(None);
        };
        for pos in candidates.clone() {
            let stored = self.store.get(pos)?;
            if self.layout.same_key(&stored, row) {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// Stores `row` unless a row with the same key is already there.
    pub fn write_row(&mut self, row: Row) -> JoinResult<InsertOutcome> {
        if !self.layout.has_key() {
            self.append(row)?;
            return Ok(InsertOutcome::Inserted);
        }
        let image = self.layout.key_image(&row)?;
        if self.find(&image, &row)?.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }
        let pos = self.append(row)?;
        self.index.entry(image).or_default().push(pos);
        Ok(InsertOutcome::Inserted)
    }

    /// Folds the current joined row into its group, creating the group on first sight.
    pub fn update_group(&mut self, src: &dyn RowSource) -> JoinResult<()> {
        let row = self.layout.init_row(src);
        let image = self.layout.key_image(&row)?;
        match self.find(&image, &row)? {
            Some(pos) => {
                let mut stored = self.store.get(pos)?;
                self.layout.update_row(&mut stored, src);
                self.store.update(pos, stored)
            }
            None => {
                let pos = self.append(row)?;
                self.index.entry(image).or_default().push(pos);
                Ok(())
            }
        }
    }

    fn append(&mut self, row: Row) -> JoinResult<usize> {
        if matches!(&self.store, RowStore::Heap(rows) if rows.len() >= self.heap_capacity) {
            self.convert_to_disk()?;
        }
        self.store.push(row)
    }

    /// Moves the rows of a full in-memory table to disk, keeping their positions.
    fn convert_to_disk(&mut self) -> JoinResult<()> {
        let RowStore::Heap(rows) = &self.store else {
            return Ok(());
        };
        let mut disk = DiskStore::create(&self.settings.tmpdir, layout_types(&self.layout))?;
        for (pos, row) in rows.iter().enumerate() {
            if disk.push(row)? != pos {
                return Err(JoinError::Internal(anyhow!(
                    "row {} of temporary table moved while converting to disk",
                    pos
                )));
            }
        }
        log::info!(
            "temporary table of {} rows converted to disk table {}",
            rows.len(),
            disk.path().display()
        );
        self.store = RowStore::Disk(disk);
        Ok(())
    }

    /// All rows, in insertion order.
    pub fn rows(&mut self) -> JoinResult<Vec<Row>> {
        (0..self.store.len()).map(|pos| self.store.get(pos)).collect()
    }
}

fn layout_types(layout: &TmpTableLayout) -> Vec<arrow_schema::DataType> {
    layout.fields.iter().map(|f| f.data_type.clone()).collect()
}

#[cfg(test)]
mod tests {
    use datafusion_common::ScalarValue;

    use crate::catalog::ColumnRef;
    use crate::context::OptimizerSettings;
    use crate::predicate::test_util::field;
    use crate::predicate::RowSource;
    use crate::select::{AggFunc, SelectItem};
    use crate::tmp_table::{InsertOutcome, TmpTable, TmpTableLayout};

    struct Joined(Vec<ScalarValue>);

    impl RowSource for Joined {
        fn value(&self, column: ColumnRef) -> &ScalarValue {
            &self.0[column.field]
        }
    }

    fn int(v: Option<i64>) -> ScalarValue {
        ScalarValue::Int64(v)
    }

    #[test]
    fn test_distinct_rows_survive_conversion_to_disk() {
        let items = vec![SelectItem::expr(field(0, 0, "a", true))];
        let settings = OptimizerSettings {
            max_heap_table_size: 20,
            ..Default::default()
        };
        let layout = TmpTableLayout::build(&items, &[], &[], true, &settings);
        let mut tmp = TmpTable::create(layout, &settings, false).unwrap();
        assert!(!tmp.is_on_disk());

        let mut inserted = 0;
        for v in [Some(1), Some(2), None, Some(1), Some(3), None, Some(2), Some(4)] {
            if tmp.write_row(vec![int(v)]).unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert!(tmp.is_on_disk());
        assert_eq!(5, inserted);
        assert_eq!(
            vec![
                vec![int(Some(1))],
                vec![int(Some(2))],
                vec![int(None)],
                vec![int(Some(3))],
                vec![int(Some(4))]
            ],
            tmp.rows().unwrap()
        );
    }

    #[test]
    fn test_update_group() {
        let items = vec![
            SelectItem::expr(field(0, 0, "a", false)),
            SelectItem::count_star(),
            SelectItem::agg(AggFunc::Max, field(0, 1, "b", true)),
        ];
        let settings = OptimizerSettings::default();
        let layout = TmpTableLayout::build(
            &items,
            &[field(0, 0, "a", false)],
            &[],
            false,
            &settings,
        );
        let mut tmp = TmpTable::create(layout, &settings, true).unwrap();
        assert!(tmp.is_on_disk());

        for (a, b) in [(1, Some(5)), (2, None), (1, Some(9)), (1, None)] {
            tmp.update_group(&Joined(vec![int(Some(a)), int(b)])).unwrap();
        }
        let rows = tmp.rows().unwrap();
        let output = rows
            .iter()
            .map(|r| tmp.layout().finish(r))
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                vec![int(Some(1)), int(Some(3)), int(Some(9))],
                vec![int(Some(2)), int(Some(1)), int(None)],
            ],
            output
        );
    }
}
