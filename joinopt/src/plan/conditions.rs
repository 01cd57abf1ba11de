//! Placement of the WHERE and ON conditions on the slots of the join order.
//!
//! Every conjunct is attached to the earliest slot where all of its tables have a row. A
//! conjunct attached to an inner table of an outer join is wrapped into guards: found-match
//! guards keep a WHERE condition switched off until the outer join has a match for the current
//! outer row, and a not-null-complemented guard switches ON conditions off while the executor
//! produces the NULL complemented row.

use crate::access::Access;
use crate::equality::EqualityContext;
use crate::join_nest::JoinTree;
use crate::keyuse::KeyUseCatalog;
use crate::plan::const_tables::ConstTables;
use crate::plan::join_tab::{add_found_match_trig_cond, inner_slots, JoinTab};
use crate::predicate::{Expr, Guard, Predicate};
use crate::table_map::TableMap;

/// Earliest slot at which all `used` tables have a row.
fn first_slot_covering(slots: &[JoinTab], consts: TableMap, used: TableMap) -> usize {
    let mut available = consts;
    for (idx, slot) in slots.iter().enumerate() {
        available.insert(slot.table);
        if used.is_subset_of(available) {
            return idx;
        }
    }
    slots.len().saturating_sub(1)
}

/// `IS NOT NULL` on the sources of null rejecting ref key parts, checked on the table the
/// value is read from.
pub fn add_not_null_conds(slots: &mut [JoinTab], tree: &JoinTree, consts: &ConstTables) {
    for idx in 0..slots.len() {
        if tree.nesting(slots[idx].table).maybe_null {
            continue;
        }
        let descriptor = match &slots[idx].access {
            Access::EqRef(r) | Access::Ref(r) | Access::RefOrNull(r) => r,
            _ => continue,
        };
        let fields = descriptor
            .parts
            .iter()
            .filter(|p| p.null_rejecting)
            .filter_map(|p| p.value.as_field().cloned())
            .collect::<Vec<_>>();
        for field in fields {
            if consts.contains(field.column.table) {
                continue;
            }
            let Some(referred) = slots.iter().position(|s| s.table == field.column.table) else {
                continue;
            };
            let cond = Predicate::IsNotNull(Expr::Field(field));
            let cond = add_found_match_trig_cond(slots, slots[referred].first_inner, cond, None);
            slots[referred].add_cond(cond);
        }
    }
}

/// Attaches the conjuncts of the WHERE condition and of all ON conditions to the slots.
///
/// `table_position[t]` is the position of table `t` in the join order, const tables first.
/// Conjuncts over const tables only are dropped, they were checked when the const tables were
/// read.
pub fn make_join_select(
    slots: &mut [JoinTab],
    tree: &JoinTree,
    equalities: &EqualityContext,
    catalog: &KeyUseCatalog,
    conds: Option<Predicate>,
    consts: &ConstTables,
    table_position: &[usize],
) {
    add_not_null_conds(slots, tree, consts);

    if let Some(conds) = conds {
        let conds = equalities.substitute_for_best_equal_field(conds, table_position);
        for conjunct in conds.into_conjuncts() {
            let used = conjunct.used_tables();
            if used.is_subset_of(consts.map) {
                continue;
            }
            let idx = first_slot_covering(slots, consts.map, used);
            let cond = add_found_match_trig_cond(slots, slots[idx].first_inner, conjunct, None);
            slots[idx].add_cond(cond);
        }
    }

    for node in tree.nodes_with_on_expr() {
        let node = tree.node(node);
        if !node.outer_join || node.used_tables.is_subset_of(consts.map) {
            continue;
        }
        let (Some(on), Some((first, _))) = (&node.on_expr, inner_slots(slots, node.used_tables))
        else {
            continue;
        };
        let on = equalities.substitute_for_best_equal_field(on.clone(), table_position);
        for conjunct in on.into_conjuncts() {
            let used = conjunct.used_tables();
            let idx = first_slot_covering(slots, consts.map, used).max(first);
            let cond = add_found_match_trig_cond(slots, slots[idx].first_inner, conjunct, Some(first));
            let cond = Predicate::guarded(Guard::NotNullComplemented(first), cond);
            slots[idx].add_cond(cond);
        }
    }

    for slot in slots.iter_mut() {
        slot.not_exists = catalog.tables[slot.table].not_exists_optimize
            && tree.nesting(slot.table).maybe_null;
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use enumset::EnumSet;

    use crate::access::{create_ref_for_key, Access};
    use crate::catalog::{FieldDef, KeyDef, KeyMap, TableDef};
    use crate::equality::EqualityContext;
    use crate::join_nest::{JoinClause, JoinTree};
    use crate::keyuse::{KeyUse, KeyUseCatalog};
    use crate::plan::conditions::{add_not_null_conds, make_join_select};
    use crate::plan::const_tables::ConstTables;
    use crate::plan::cost::Cost;
    use crate::plan::join_tab::{make_outerjoin_info, JoinTab};
    use crate::predicate::test_util::{field, int};
    use crate::predicate::{CmpOp, Predicate};
    use crate::table_map::TableMap;

    fn slot(table: usize, access: Access) -> JoinTab {
        JoinTab {
            table,
            access,
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

    #[test]
    fn test_where_and_on_guards() {
        let on = Predicate::and(vec![
            Predicate::eq(field(0, 0, "a", false), field(1, 0, "a", false)),
            Predicate::compare(CmpOp::Gt, field(1, 1, "b", true), int(3)),
        ]);
        let mut tree = JoinTree::new(
            vec![JoinClause::table(0), JoinClause::table(1).left_join_on(on)],
            2,
        )
        .unwrap();
        let conds = tree
            .prepare(Some(Predicate::IsNull(field(1, 1, "b", true))))
            .unwrap();
        let defs = vec![def("t0"), def("t1")];
        let equalities = EqualityContext::new();
        let catalog = KeyUseCatalog::build(&defs, &equalities, conds.as_ref(), &tree).unwrap();

        let mut slots = vec![slot(0, Access::All), slot(1, Access::All)];
        make_outerjoin_info(&mut slots, &tree);
        make_join_select(
            &mut slots,
            &tree,
            &equalities,
            &catalog,
            conds,
            &ConstTables::new(2),
            &[0, 1],
        );

        assert!(slots[0].select_cond.is_none());
        assert_eq!(
            "(trigcond(found(#1), t1.b IS NULL) AND trigcond(not_null_compl(#1), t0.a = t1.a) \
             AND trigcond(not_null_compl(#1), t1.b > 3))",
            slots[1].select_cond.as_ref().unwrap().to_string()
        );
        assert!(!slots[1].not_exists);
    }

    #[test]
    fn test_null_rejecting_ref_source_gets_not_null_cond() {
        let mut tree = JoinTree::new(vec![JoinClause::table(0), JoinClause::table(1)], 2).unwrap();
        tree.prepare(None).unwrap();
        let defs = vec![def("t0"), def("t1")];
        let keyuse = KeyUse {
            table: 1,
            key: 0,
            keypart: 0,
            value: field(0, 1, "b", true),
            used_tables: TableMap::of(0),
            optimize: EnumSet::empty(),
            keypart_map: 1,
            null_rejecting: true,
            ref_table_rows: f64::MAX,
        };
        let consts = ConstTables::new(2);
        let access = create_ref_for_key(&defs[1], &[&keyuse], TableMap::of(0), TableMap::EMPTY, &consts)
            .unwrap();
        let mut slots = vec![slot(0, Access::All), slot(1, access)];
        add_not_null_conds(&mut slots, &tree, &consts);
        assert_eq!(
            Some("t0.b IS NOT NULL".to_string()),
            slots[0].select_cond.as_ref().map(|c| c.to_string())
        );
        assert!(slots[1].select_cond.is_none());
    }
}
