//! Join order search.
//!
//! Tables are added to the plan one at a time. Each step looks `search_depth` tables ahead,
//! exhaustively over the orders the nesting of outer joins allows, and fixes the first table
//! of the cheapest partial plan found.

use anyhow::anyhow;

use crate::access::RangeScan;
use crate::catalog::{TableDef, TableStats};
use crate::context::OptimizerSettings;
use crate::error::OptResult;
use crate::join_nest::{JoinOrderValidator, JoinTree};
use crate::keyuse::{KeyOptimize, KeyUseCatalog};
use crate::plan::cost::{
    full_scan_time, range_read_time, worst_seeks, Cost, INF, TIME_FOR_COMPARE,
};
use crate::table_map::{TableMap, TableNo};

/// Default depth of the exhaustive part of the search.
const AUTO_SEARCH_DEPTH: usize = 7;

/// How a table is read in a plan.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PlannedAccess {
    /// Lookup on the key.
    Ref(usize),
    /// The table's range scan.
    Range,
    Scan,
}

/// A table in a (partial) join order.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub table: TableNo,
    pub access: PlannedAccess,
    /// Rows read for each row of the preceding partial join.
    pub records_read: f64,
    pub read_time: Cost,
}

pub struct JoinSearch<'a> {
    tree: &'a JoinTree,
    catalog: &'a KeyUseCatalog,
    defs: &'a [TableDef],
    stats: &'a [TableStats],
    ranges: &'a [Option<RangeScan>],
    settings: &'a OptimizerSettings,
    const_tables: TableMap,
    validator: JoinOrderValidator<'a>,
    positions: Vec<Position>,
    best_positions: Vec<Position>,
    best_read: Cost,
}

impl<'a> JoinSearch<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: &'a JoinTree,
        catalog: &'a KeyUseCatalog,
        defs: &'a [TableDef],
        stats: &'a [TableStats],
        ranges: &'a [Option<RangeScan>],
        settings: &'a OptimizerSettings,
        const_tables: TableMap,
    ) -> Self {
        Self {
            tree,
            catalog,
            defs,
            stats,
            ranges,
            settings,
            const_tables,
            validator: JoinOrderValidator::new(tree),
            positions: vec![],
            best_positions: vec![],
            best_read: INF,
        }
    }

    /// Cheapest way to read `table` after the tables of `prefix` produced `record_count` rows.
    pub fn best_access_path(&self, table: TableNo, prefix: TableMap, record_count: f64) -> Position {
        let def = &self.defs[table];
        let stats = &self.stats[table];
        let table_rows = (stats.rows as f64).max(1.0);
        let mut best = Position {
            table,
            access: PlannedAccess::Scan,
            records_read: table_rows,
            read_time: INF,
        };
        let mut best_total = INF;

        for key in 0..def.keys.len() {
            let mut found_part = 0u64;
            let mut ref_or_null_part = 0u64;
            for keyuse in self.catalog.for_key(table, key) {
                if keyuse.used_tables.is_subset_of(prefix) {
                    found_part |= keyuse.keypart_map;
                    if keyuse.optimize.contains(KeyOptimize::RefOrNull) {
                        ref_or_null_part |= keyuse.keypart_map;
                    }
                }
            }
            if found_part & 1 == 0 {
                continue;
            }
            let key_def = &def.keys[key];
            let parts = (found_part.trailing_ones() as usize).min(key_def.parts.len());
            let records = if parts == key_def.parts.len()
                && key_def.unique
                && ref_or_null_part == 0
                && !def.key_has_nullable_part(key)
            {
                1.0
            } else {
                let per_key = stats
                    .records_per_key(key, parts)
                    .unwrap_or_else(|| (table_rows / 10.0).max(1.0));
                if ref_or_null_part != 0 {
                    per_key * 2.0
                } else {
                    per_key
                }
            };
            let read_time = record_count * records.min(worst_seeks(stats, self.settings).max(1.0));
            let total = Cost::from(read_time + record_count * records / TIME_FOR_COMPARE);
            if total < best_total {
                best_total = total;
                best = Position {
                    table,
                    access: PlannedAccess::Ref(key),
                    records_read: records,
                    read_time: Cost::from(read_time),
                };
            }
        }

        let (access, records, read_time) = match &self.ranges[table] {
            Some(range) => (
                PlannedAccess::Range,
                range.rows.max(1.0),
                record_count * range_read_time(range.rows),
            ),
            None => (
                PlannedAccess::Scan,
                table_rows,
                full_scan_time(stats, self.settings, record_count),
            ),
        };
        let total = Cost::from(read_time + record_count * records / TIME_FOR_COMPARE);
        if total < best_total {
            best = Position {
                table,
                access,
                records_read: records,
                read_time: Cost::from(read_time),
            };
        }
        best
    }

    fn search_depth(&self, tables: usize) -> usize {
        match self.settings.optimizer_search_depth {
            0 => tables.min(AUTO_SEARCH_DEPTH),
            depth => depth.min(tables),
        }
    }

    /// Orders the tables which are not const. Returns the positions and the plan cost.
    pub fn choose_plan(mut self) -> OptResult<(Vec<Position>, Cost)> {
        for table in self.const_tables.iter() {
            self.validator.can_extend(table);
        }
        let all = TableMap::first(self.defs.len()) & !self.const_tables;
        if self.settings.straight_join {
            self.optimize_straight_join(all)
        } else {
            self.greedy_search(all)
        }
    }

    fn optimize_straight_join(mut self, tables: TableMap) -> OptResult<(Vec<Position>, Cost)> {
        let mut prefix = self.const_tables;
        let mut record_count = 1.0;
        let mut read_time = Cost::default();
        for table in tables.iter() {
            if !self.tree.nesting(table).dependent.is_subset_of(prefix)
                || !self.validator.can_extend(table)
            {
                return Err(anyhow!(
                    "table {} can not be joined in query order",
                    self.defs[table].name
                ));
            }
            let position = self.best_access_path(table, prefix, record_count);
            record_count *= position.records_read;
            read_time += position.read_time + Cost::from(record_count / TIME_FOR_COMPARE);
            prefix.insert(table);
            self.positions.push(position);
        }
        Ok((self.positions, read_time))
    }

    fn greedy_search(mut self, mut remaining: TableMap) -> OptResult<(Vec<Position>, Cost)> {
        let mut prefix = self.const_tables;
        let mut record_count = 1.0;
        let mut read_time = Cost::default();
        let depth = self.search_depth(remaining.len());

        while !remaining.is_empty() {
            self.best_read = INF;
            self.best_positions.clear();
            let idx = self.positions.len();
            self.best_extension_by_limited_search(prefix, remaining, record_count, read_time, depth);

            let best = self
                .best_positions
                .get(idx)
                .cloned()
                .ok_or_else(|| anyhow!("no valid join order for tables {:?}", remaining))?;
            if remaining.len() <= depth {
                log::debug!("join order search finished with cost {:?}", self.best_read);
                let cost = self.best_read;
                return Ok((self.best_positions, cost));
            }

            self.validator.can_extend(best.table);
            record_count *= best.records_read;
            read_time += best.read_time + Cost::from(record_count / TIME_FOR_COMPARE);
            prefix.insert(best.table);
            remaining.remove(best.table);
            self.positions.push(best);
        }
        Ok((self.positions, read_time))
    }

    fn best_extension_by_limited_search(
        &mut self,
        prefix: TableMap,
        remaining: TableMap,
        record_count: f64,
        read_time: Cost,
        depth: usize,
    ) {
        for table in remaining.iter() {
            if !self.tree.nesting(table).dependent.is_subset_of(prefix) {
                continue;
            }
            if !self.validator.can_extend(table) {
                continue;
            }
            let position = self.best_access_path(table, prefix, record_count);
            let current_record_count = record_count * position.records_read;
            let current_read_time = read_time
                + position.read_time
                + Cost::from(current_record_count / TIME_FOR_COMPARE);

            if current_read_time >= self.best_read {
                log::trace!("pruned partial plan ending with table #{}", table);
                self.validator.retract(table);
                continue;
            }

            self.positions.push(position);
            let mut rest = remaining;
            rest.remove(table);
            if depth > 1 && !rest.is_empty() {
                let mut next_prefix = prefix;
                next_prefix.insert(table);
                self.best_extension_by_limited_search(
                    next_prefix,
                    rest,
                    current_record_count,
                    current_read_time,
                    depth - 1,
                );
            } else {
                self.best_read = current_read_time;
                self.best_positions = self.positions.clone();
            }
            self.positions.pop();
            self.validator.retract(table);
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use crate::access::RangeScan;
    use crate::catalog::{FieldDef, KeyDef, TableDef, TableStats};
    use crate::context::OptimizerSettings;
    use crate::equality::EqualityContext;
    use crate::join_nest::{JoinClause, JoinTree};
    use crate::keyuse::KeyUseCatalog;
    use crate::plan::search::{JoinSearch, PlannedAccess};
    use crate::predicate::test_util::field;
    use crate::predicate::Predicate;
    use crate::table_map::TableMap;

    fn def(name: &str) -> TableDef {
        TableDef::new(
            name,
            vec![
                FieldDef::new("a", DataType::Int64, false),
                FieldDef::new("b", DataType::Int64, true),
            ],
        )
        .with_key(KeyDef::unique("primary", vec![0]))
    }

    fn stats(rows: u64) -> TableStats {
        TableStats {
            rows,
            mean_rec_len: 20,
            rec_per_key: vec![vec![1.0]],
            exact: true,
        }
    }

    fn catalog(defs: &[TableDef], tree: &JoinTree, conds: Predicate) -> KeyUseCatalog {
        let mut equalities = EqualityContext::new();
        let (conds, _) = equalities.build_equal_items(defs, conds, None);
        KeyUseCatalog::build(defs, &equalities, Some(&conds), tree).unwrap()
    }

    #[test]
    fn test_big_table_is_read_by_key() {
        let defs = vec![def("t0"), def("t1")];
        let stats = vec![stats(10), stats(10_000)];
        let mut tree = JoinTree::new(vec![JoinClause::table(0), JoinClause::table(1)], 2).unwrap();
        tree.prepare(None).unwrap();
        // t0.b = t1.a: only t1 can be read by its primary key.
        let catalog = catalog(
            &defs,
            &tree,
            Predicate::eq(field(0, 1, "b", true), field(1, 0, "a", false)),
        );
        let ranges: Vec<Option<RangeScan>> = vec![None, None];
        let settings = OptimizerSettings::default();
        let search = JoinSearch::new(&tree, &catalog, &defs, &stats, &ranges, &settings, TableMap::EMPTY);
        let (positions, _) = search.choose_plan().unwrap();

        assert_eq!(vec![0, 1], positions.iter().map(|p| p.table).collect::<Vec<_>>());
        assert_eq!(PlannedAccess::Scan, positions[0].access);
        assert_eq!(PlannedAccess::Ref(0), positions[1].access);
        assert_eq!(1.0, positions[1].records_read);
    }

    #[test]
    fn test_outer_join_dependency_is_honoured() {
        let defs = vec![def("t0"), def("t1")];
        // The inner table is much smaller, but has to follow the outer one.
        let stats = vec![stats(10_000), stats(2)];
        let mut tree = JoinTree::new(
            vec![
                JoinClause::table(0),
                JoinClause::table(1)
                    .left_join_on(Predicate::eq(field(0, 1, "b", true), field(1, 1, "b", true))),
            ],
            2,
        )
        .unwrap();
        tree.prepare(None).unwrap();
        let catalog = catalog(&defs, &tree, Predicate::Const(true));
        let ranges: Vec<Option<RangeScan>> = vec![None, None];
        let settings = OptimizerSettings {
            optimizer_search_depth: 1,
            ..Default::default()
        };
        let search = JoinSearch::new(&tree, &catalog, &defs, &stats, &ranges, &settings, TableMap::EMPTY);
        let (positions, _) = search.choose_plan().unwrap();
        assert_eq!(vec![0, 1], positions.iter().map(|p| p.table).collect::<Vec<_>>());
    }

    #[test]
    fn test_straight_join_keeps_query_order() {
        let defs = vec![def("t0"), def("t1"), def("t2")];
        let stats = vec![stats(1000), stats(10), stats(100)];
        let mut tree = JoinTree::new(
            vec![JoinClause::table(0), JoinClause::table(1), JoinClause::table(2)],
            3,
        )
        .unwrap();
        tree.prepare(None).unwrap();
        let catalog = catalog(&defs, &tree, Predicate::Const(true));
        let ranges: Vec<Option<RangeScan>> = vec![None, None, None];
        let settings = OptimizerSettings {
            straight_join: true,
            ..Default::default()
        };
        let search = JoinSearch::new(&tree, &catalog, &defs, &stats, &ranges, &settings, TableMap::of(1));
        let (positions, _) = search.choose_plan().unwrap();
        assert_eq!(vec![0, 2], positions.iter().map(|p| p.table).collect::<Vec<_>>());
    }
}
