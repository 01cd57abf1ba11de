use crate::access::{create_ref_for_key, Access, RangeScan};
use crate::catalog::{KeyMap, TableDef};
use crate::error::JoinResult;
use crate::join_nest::{JoinNodeId, JoinTree};
use crate::keyuse::KeyUseCatalog;
use crate::plan::const_tables::ConstTables;
use crate::plan::cost::Cost;
use crate::plan::search::{PlannedAccess, Position};
use crate::predicate::{Guard, Predicate};
use crate::table_map::{TableMap, TableNo};

/// A table of the join order, with everything needed to read it.
#[derive(Clone, Debug)]
pub struct JoinTab {
    pub table: TableNo,
    pub access: Access,
    /// Estimated rows read per row of the preceding partial join.
    pub records: f64,
    pub read_time: Cost,
    /// Conditions checked on every row read from the table.
    pub select_cond: Option<Predicate>,
    /// First slot of the innermost outer join the table is an inner table of.
    pub first_inner: Option<usize>,
    /// Set on the first inner slot of an outer join: its last inner slot.
    pub last_inner: Option<usize>,
    /// Set on the first inner slot of an outer join: the first inner slot of the embedding
    /// outer join.
    pub first_upper: Option<usize>,
    /// Reading can stop at the first match, a `col IS NULL` on a NOT NULL column rejects it.
    pub not_exists: bool,
    /// Rows may be kept in a row cache between rescans.
    pub use_row_cache: bool,
    pub possible_keys: KeyMap,
}

impl JoinTab {
    /// Adds `cond` to the conditions of the slot.
    pub fn add_cond(&mut self, cond: Predicate) {
        self.select_cond = Some(match self.select_cond.take() {
            Some(prev) => Predicate::and(vec![prev, cond]),
            None => cond,
        });
    }
}

/// Builds the slots of the join order chosen by the search.
pub fn make_join_readinfo(
    positions: &[Position],
    defs: &[TableDef],
    catalog: &KeyUseCatalog,
    consts: &ConstTables,
    ranges: &[Option<RangeScan>],
) -> JoinResult<Vec<JoinTab>> {
    let mut used_tables = consts.map;
    let mut slots = Vec::with_capacity(positions.len());
    for (idx, position) in positions.iter().enumerate() {
        let table = position.table;
        let access = match position.access {
            PlannedAccess::Ref(key) => {
                let keyuses = catalog.for_key(table, key).collect::<Vec<_>>();
                create_ref_for_key(&defs[table], &keyuses, used_tables, consts.map, consts)?
            }
            PlannedAccess::Range => match &ranges[table] {
                Some(range) => Access::Range(range.clone()),
                None => Access::All,
            },
            PlannedAccess::Scan => Access::All,
        };
        let info = &catalog.tables[table];
        slots.push(JoinTab {
            table,
            use_row_cache: idx > 0 && matches!(access, Access::All),
            access,
            records: position.records_read,
            read_time: position.read_time,
            select_cond: None,
            first_inner: None,
            last_inner: None,
            first_upper: None,
            not_exists: false,
            possible_keys: info.keys,
        });
        used_tables.insert(table);
    }
    Ok(slots)
}

/// Innermost outer join containing `node`, the node itself included.
pub(crate) fn innermost_outer_join(tree: &JoinTree, node: JoinNodeId) -> Option<JoinNodeId> {
    std::iter::once(node)
        .chain(tree.embeddings(node))
        .find(|n| tree.node(*n).outer_join)
}

/// Slot range `(first, last)` of the tables of an outer join.
pub(crate) fn inner_slots(slots: &[JoinTab], tables: TableMap) -> Option<(usize, usize)> {
    let mut found = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| tables.contains(s.table))
        .map(|(i, _)| i);
    let first = found.next()?;
    let last = found.last().unwrap_or(first);
    Some((first, last))
}

/// Sets the first inner, last inner and first upper slots of every outer join.
pub fn make_outerjoin_info(slots: &mut [JoinTab], tree: &JoinTree) {
    for idx in 0..slots.len() {
        let node = tree.table_node(slots[idx].table);
        let Some(group) = innermost_outer_join(tree, node) else {
            continue;
        };
        let Some((first, last)) = inner_slots(slots, tree.node(group).used_tables) else {
            continue;
        };
        slots[idx].first_inner = Some(first);
        if idx == first {
            slots[idx].last_inner = Some(last);
            slots[idx].first_upper = tree
                .embeddings(group)
                .find(|n| tree.node(*n).outer_join)
                .and_then(|upper| inner_slots(slots, tree.node(upper).used_tables))
                .map(|(upper_first, _)| upper_first);
        }
    }
}

/// Wraps `cond` into found-match guards of the outer joins from the one starting at `tab` up to,
/// but not including, the one starting at `root`.
pub fn add_found_match_trig_cond(
    slots: &[JoinTab],
    tab: Option<usize>,
    cond: Predicate,
    root: Option<usize>,
) -> Predicate {
    match tab {
        Some(t) if Some(t) != root => Predicate::guarded(
            Guard::Found(t),
            add_found_match_trig_cond(slots, slots[t].first_upper, cond, root),
        ),
        _ => cond,
    }
}

#[cfg(test)]
mod tests {
    use crate::access::Access;
    use crate::catalog::KeyMap;
    use crate::join_nest::{JoinClause, JoinTree};
    use crate::plan::cost::Cost;
    use crate::plan::join_tab::{add_found_match_trig_cond, make_outerjoin_info, JoinTab};
    use crate::predicate::test_util::field;
    use crate::predicate::{Guard, Predicate};

    fn slot(table: usize) -> JoinTab {
        JoinTab {
            table,
            access: Access::All,
            records: 1.0,
            read_time: Cost::default(),
            select_cond: None,
            first_inner: None,
            last_inner: None,
            first_upper: None,
            not_exists: false,
            use_row_cache: false,
            possible_keys: KeyMap::EMPTY,
        }
    }

    fn eq(l: usize, r: usize) -> Predicate {
        Predicate::eq(field(l, 0, "a", true), field(r, 0, "a", true))
    }

    /// t0 LEFT JOIN (t1 LEFT JOIN t2 ON t1.a = t2.a) ON t0.a = t1.a
    fn nested_outer_joins() -> JoinTree {
        let mut tree = JoinTree::new(
            vec![
                JoinClause::table(0),
                JoinClause::nest(vec![JoinClause::table(1), JoinClause::table(2).left_join_on(eq(1, 2))])
                    .left_join_on(eq(0, 1)),
            ],
            3,
        )
        .unwrap();
        tree.prepare(None).unwrap();
        tree
    }

    #[test]
    fn test_nested_outer_join_info() {
        let tree = nested_outer_joins();
        let mut slots = vec![slot(0), slot(1), slot(2)];
        make_outerjoin_info(&mut slots, &tree);

        assert_eq!(None, slots[0].first_inner);
        assert_eq!(Some(1), slots[1].first_inner);
        assert_eq!(Some(2), slots[1].last_inner);
        assert_eq!(None, slots[1].first_upper);
        assert_eq!(Some(2), slots[2].first_inner);
        assert_eq!(Some(2), slots[2].last_inner);
        assert_eq!(Some(1), slots[2].first_upper);

        let cond = eq(0, 2);
        assert_eq!(
            Predicate::guarded(
                Guard::Found(2),
                Predicate::guarded(Guard::Found(1), cond.clone())
            ),
            add_found_match_trig_cond(&slots, Some(2), cond.clone(), None)
        );
        assert_eq!(
            Predicate::guarded(Guard::Found(2), cond.clone()),
            add_found_match_trig_cond(&slots, Some(2), cond, Some(1))
        );
    }
}
