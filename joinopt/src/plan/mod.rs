//! Join planning: const tables, range analysis, join order search and the slots of the chosen
//! order with their conditions attached.

use crate::access::{best_range_scan, RangeScan};
use crate::catalog::{TableDef, TableStats};
use crate::context::OptimizerSettings;
use crate::equality::EqualityContext;
use crate::error::JoinResult;
use crate::join_nest::JoinTree;
use crate::keyuse::KeyUseCatalog;
use crate::predicate::Predicate;
use crate::storage::TableHandler;
use crate::table_map::TableNo;

mod conditions;
mod const_tables;
mod cost;
mod explain;
mod join_tab;
mod search;

pub use conditions::*;
pub use const_tables::*;
pub use cost::*;
pub use explain::*;
pub use join_tab::*;
pub use search::*;

use join_tab::innermost_outer_join;

/// The plan of a join, ready to be executed.
#[derive(Debug)]
pub struct JoinPlan {
    pub catalog: KeyUseCatalog,
    pub consts: ConstTables,
    /// Non-const tables in join order.
    pub slots: Vec<JoinTab>,
    /// Position of every table in the join order, const tables first.
    pub table_position: Vec<usize>,
    pub ranges: Vec<Option<RangeScan>>,
    pub cost: Cost,
    /// The WHERE condition can not be satisfied, no row has to be read.
    pub impossible_where: bool,
}

impl JoinPlan {
    pub(crate) fn impossible(
        catalog: KeyUseCatalog,
        consts: ConstTables,
        table_count: usize,
    ) -> Self {
        Self {
            catalog,
            consts,
            slots: vec![],
            table_position: (0..table_count).collect(),
            ranges: vec![None; table_count],
            cost: Cost::default(),
            impossible_where: true,
        }
    }

    /// Slot reading `table`, `None` for const tables.
    pub fn slot_of(&self, table: TableNo) -> Option<usize> {
        self.slots.iter().position(|s| s.table == table)
    }
}

/// Condition range analysis uses for `table`: the ON condition of its innermost outer join for
/// an inner table, the WHERE condition otherwise.
fn range_condition<'a>(
    tree: &'a JoinTree,
    conds: Option<&'a Predicate>,
    table: TableNo,
) -> Option<&'a Predicate> {
    if !tree.nesting(table).maybe_null {
        return conds;
    }
    innermost_outer_join(tree, tree.table_node(table)).and_then(|n| tree.node(n).on_expr.as_ref())
}

/// Plans the join of the tables of `tree` under the WHERE condition `conds`.
///
/// `tree` must be prepared and carry the multiple equalities of its ON conditions; `conds` is
/// the WHERE condition after equality propagation and constant folding.
#[allow(clippy::too_many_arguments)]
pub fn make_join_plan(
    tree: &JoinTree,
    equalities: &EqualityContext,
    conds: Option<Predicate>,
    defs: &[TableDef],
    stats: &[TableStats],
    handlers: &mut [Box<dyn TableHandler>],
    settings: &OptimizerSettings,
) -> JoinResult<JoinPlan> {
    let table_count = defs.len();
    let mut catalog = KeyUseCatalog::build(defs, equalities, conds.as_ref(), tree)?;
    log::debug!("{} key uses after pruning", catalog.keyuse.len());

    let consts = find_const_tables(tree, &catalog, defs, stats, handlers)?;
    if consts.impossible || !check_const_conds(conds.as_ref(), &consts) {
        log::debug!("impossible WHERE noticed after reading const tables");
        return Ok(JoinPlan::impossible(catalog, consts, table_count));
    }
    catalog.optimize_keyuse(consts.map, stats);

    let mut ranges = vec![None; table_count];
    for table in 0..table_count {
        if consts.contains(table) {
            continue;
        }
        let Some(cond) = range_condition(tree, conds.as_ref(), table) else {
            continue;
        };
        let range = best_range_scan(table, &defs[table], &stats[table], cond);
        if let Some(range) = &range {
            if range.is_empty() && !tree.nesting(table).maybe_null {
                log::debug!("impossible range on {}", defs[table].name);
                return Ok(JoinPlan::impossible(catalog, consts, table_count));
            }
        }
        ranges[table] = range;
    }

    let (positions, cost) = JoinSearch::new(
        tree, &catalog, defs, stats, &ranges, settings, consts.map,
    )
    .choose_plan()?;
    log::info!(
        "join order [{}], cost {:.2}",
        consts
            .order
            .iter()
            .chain(positions.iter().map(|p| &p.table))
            .map(|t| defs[*t].name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        cost.value()
    );

    let mut slots = make_join_readinfo(&positions, defs, &catalog, &consts, &ranges)?;
    let mut table_position = vec![0; table_count];
    for (position, table) in consts
        .order
        .iter()
        .copied()
        .chain(slots.iter().map(|s| s.table))
        .enumerate()
    {
        table_position[table] = position;
    }
    make_outerjoin_info(&mut slots, tree);
    make_join_select(
        &mut slots,
        tree,
        equalities,
        &catalog,
        conds,
        &consts,
        &table_position,
    );

    Ok(JoinPlan {
        catalog,
        consts,
        slots,
        table_position,
        ranges,
        cost,
        impossible_where: false,
    })
}
