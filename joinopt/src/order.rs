//! Sort elision: reading the first table of the join through an index that already delivers
//! the rows in the requested order.

use std::fmt::{Display, Formatter};

use crate::access::{create_ref_for_key, Access};
use crate::catalog::{KeyMap, TableDef, TableStats};
use crate::context::OptimizerSettings;
use crate::error::JoinResult;
use crate::plan::{scan_time, JoinPlan};
use crate::predicate::Expr;
use crate::storage::ScanOrder;
use crate::table_map::{TableMap, TableNo};

/// One term of an ORDER BY or GROUP BY list.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub asc: bool,
}

impl OrderItem {
    pub fn asc<E: Into<Expr>>(expr: E) -> Self {
        Self {
            expr: expr.into(),
            asc: true,
        }
    }

    pub fn desc<E: Into<Expr>>(expr: E) -> Self {
        Self {
            expr: expr.into(),
            asc: false,
        }
    }
}

impl Display for OrderItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.expr, if self.asc { "ASC" } else { "DESC" })
    }
}

/// Checks whether reading `key` of `table` returns rows in the order of `order`.
///
/// Key parts set in `const_key_parts` are bound to constants and skipped. Returns the scan
/// direction and the number of key parts the order covers.
pub fn test_if_order_by_key(
    order: &[OrderItem],
    table: TableNo,
    def: &TableDef,
    key: usize,
    mut const_key_parts: u64,
) -> Option<(ScanOrder, usize)> {
    let parts = &def.keys[key].parts;
    let mut part = 0;
    let mut direction = None;
    for item in order {
        let field = item.expr.as_field()?;
        while const_key_parts & 1 == 1 && part < parts.len() {
            const_key_parts >>= 1;
            part += 1;
        }
        if part == parts.len()
            || field.column.table != table
            || field.column.field != parts[part]
        {
            return None;
        }
        let flag = if item.asc {
            ScanOrder::Forward
        } else {
            ScanOrder::Backward
        };
        if direction.map_or(false, |d| d != flag) {
            return None;
        }
        direction = Some(flag);
        part += 1;
        const_key_parts >>= 1;
    }
    let direction = direction?;
    if direction == ScanOrder::Backward && !def.keys[key].can_read_backward {
        return None;
    }
    Some((direction, part))
}

/// The shortest key among `usable_keys` starting with the first `ref_key_parts` fields of
/// `ref_key` and delivering `order`.
pub fn test_if_subkey(
    order: &[OrderItem],
    table: TableNo,
    def: &TableDef,
    const_key_parts: &[u64],
    ref_key: usize,
    ref_key_parts: usize,
    usable_keys: KeyMap,
) -> Option<usize> {
    let ref_parts = &def.keys[ref_key].parts[..ref_key_parts];
    usable_keys
        .iter()
        .filter(|nr| {
            let parts = &def.keys[*nr].parts;
            parts.len() >= ref_key_parts
                && &parts[..ref_key_parts] == ref_parts
                && test_if_order_by_key(order, table, def, *nr, const_key_parts[*nr]).is_some()
        })
        .min_by_key(|nr| def.key_length(*nr))
}

/// Statistics and settings the elision cost check reads.
pub struct SortElisionEnv<'a> {
    pub defs: &'a [TableDef],
    pub stats: &'a [TableStats],
    pub settings: &'a OptimizerSettings,
}

/// Tries to switch the first slot of `plan` to an access that reads its rows in the order of
/// `order`. Returns `true` when no explicit sort is needed afterwards.
///
/// `select_limit` is the number of rows the query needs, `None` when it needs them all.
/// `covering_keys` are the keys of the first table holding every field the query reads from it.
pub fn test_if_skip_sort_order(
    plan: &mut JoinPlan,
    order: &[OrderItem],
    select_limit: Option<u64>,
    group: bool,
    covering_keys: KeyMap,
    env: &SortElisionEnv,
) -> JoinResult<bool> {
    let Some(tab) = plan.slots.first() else {
        return Ok(false);
    };
    let table = tab.table;
    let def = &env.defs[table];
    let const_key_parts = &plan.catalog.tables[table].const_key_parts;

    let mut usable_keys = KeyMap::all(def.keys.len());
    for item in order {
        match &item.expr {
            Expr::Field(f) if f.column.table == table => {
                usable_keys &= def.part_of_key(f.column.field);
            }
            _ => return Ok(false),
        }
        if usable_keys.is_empty() {
            return Ok(false);
        }
    }

    let mut access = tab.access.clone();
    let ref_key = match &access {
        Access::RefOrNull(_) => return Ok(false),
        Access::Const(r) | Access::EqRef(r) | Access::Ref(r) => Some((r.key, r.key_parts)),
        Access::Range(range) => Some((range.key, 1)),
        Access::Index { .. } | Access::All => None,
    };

    let mut found = None;
    if let Some((mut key, key_parts)) = ref_key {
        if !usable_keys.contains(key) {
            let mut candidates = usable_keys;
            if covering_keys.contains(key) {
                candidates &= covering_keys;
            }
            if let Some(new_key) =
                test_if_subkey(order, table, def, const_key_parts, key, key_parts, candidates)
            {
                access = match access {
                    Access::Range(mut range) => {
                        range.key = new_key;
                        Access::Range(range)
                    }
                    _ => {
                        let keyuses = plan.catalog.for_key(table, new_key).collect::<Vec<_>>();
                        create_ref_for_key(
                            def,
                            &keyuses,
                            plan.consts.map,
                            plan.consts.map,
                            &plan.consts,
                        )?
                    }
                };
                log::debug!("ref of {} moved to key {}", def.name, def.keys[new_key].name);
                key = new_key;
            }
        }
        if usable_keys.contains(key) {
            found = test_if_order_by_key(order, table, def, key, const_key_parts[key]);
        }
    }

    let (direction, used_key_parts) = match found {
        Some(found) => found,
        None => {
            let Some((best_key, direction, best_key_parts)) = best_ordered_index(
                plan,
                order,
                select_limit,
                group,
                covering_keys,
                usable_keys,
                ref_key.is_some(),
                env,
            ) else {
                return Ok(false);
            };
            access = match &plan.ranges[table] {
                Some(range) if range.key == best_key && ref_key.map(|(k, _)| k) != Some(best_key) => {
                    Access::Range(range.clone())
                }
                _ => Access::Index {
                    key: best_key,
                    order: ScanOrder::Forward,
                },
            };
            (direction, best_key_parts)
        }
    };

    if direction == ScanOrder::Backward {
        match &mut access {
            Access::Range(range) => {
                if range.is_composite() {
                    log::debug!("composite range on {} can not be read backwards", def.name);
                    return Ok(false);
                }
                range.order = ScanOrder::Backward;
            }
            Access::Index { order, .. } => *order = ScanOrder::Backward,
            other => {
                if let Some(r) = other.ref_descriptor_mut() {
                    if r.key_parts <= used_key_parts {
                        r.order = ScanOrder::Backward;
                    }
                }
            }
        }
    }

    log::debug!(
        "{} read by {} in {:?} order, no sort needed",
        def.name,
        access.access_type().as_ref(),
        direction
    );
    let tab = &mut plan.slots[0];
    tab.use_row_cache &= matches!(access, Access::All);
    tab.access = access;
    Ok(true)
}

/// Looks for an index scan delivering `order` that is cheaper than the current access of the
/// first slot.
#[allow(clippy::too_many_arguments)]
fn best_ordered_index(
    plan: &JoinPlan,
    order: &[OrderItem],
    select_limit: Option<u64>,
    group: bool,
    covering_keys: KeyMap,
    usable_keys: KeyMap,
    has_ref_key: bool,
    env: &SortElisionEnv,
) -> Option<(usize, ScanOrder, usize)> {
    let tab = &plan.slots[0];
    let table = tab.table;
    let def = &env.defs[table];
    let stats = &env.stats[table];
    let table_records = stats.rows;
    let const_key_parts = &plan.catalog.tables[table].const_key_parts;
    let range = plan.ranges[table].as_ref();

    let keys = match select_limit {
        Some(limit) if limit < table_records => usable_keys,
        _ => {
            // Without a limit, sorting beats reading a whole table in index order unless the
            // index alone holds the rows.
            if matches!(tab.access, Access::All) && plan.slots.len() > 1 {
                return None;
            }
            covering_keys & usable_keys
        }
    };

    let read_time = tab.read_time.value();
    let fanout = plan.slots[1..]
        .iter()
        .map(|s| s.records.max(1.0))
        .product::<f64>();
    let quick_condition_rows = range.map_or(table_records as f64, |r| r.rows).max(1.0);

    let mut best: Option<(usize, ScanOrder, usize, f64, bool)> = None;
    for nr in keys.iter() {
        let Some((direction, used_key_parts)) =
            test_if_order_by_key(order, table, def, nr, const_key_parts[nr])
        else {
            continue;
        };
        let is_covering = covering_keys.contains(nr);
        if !is_covering && select_limit.is_none() && (has_ref_key || !group) {
            continue;
        }
        let key_parts = def.keys[nr].parts.len();
        let rec_per_key_at = |parts: usize| {
            stats
                .records_per_key(nr, parts)
                .unwrap_or(1.0)
                .max(1.0)
        };

        let mut limit = select_limit.unwrap_or(table_records) as f64;
        let records = table_records as f64;
        if group {
            let rec_per_key = rec_per_key_at(used_key_parts.max(1));
            limit = if limit > records / rec_per_key {
                records
            } else {
                limit * rec_per_key
            };
        }
        limit = if limit < fanout { 1.0 } else { limit / fanout };
        limit = if limit > quick_condition_rows {
            records
        } else {
            limit * records / quick_condition_rows
        };
        let rec_per_key = rec_per_key_at(key_parts);
        let index_scan_time =
            limit / rec_per_key * rec_per_key.min(scan_time(stats, env.settings));

        if !(is_covering || (!has_ref_key && group) || index_scan_time < read_time) {
            continue;
        }
        let quick_records = match range {
            Some(r) if r.key == nr => r.rows,
            _ => records,
        };
        let better = match &best {
            None => true,
            Some((_, _, best_parts, best_records, best_covering)) => {
                if *best_covering && !is_covering {
                    false
                } else if limit <= quick_records.min(*best_records) {
                    key_parts < *best_parts
                } else {
                    quick_records < *best_records
                }
            }
        };
        if better {
            best = Some((nr, direction, key_parts, quick_records, is_covering));
        }
    }
    best.map(|(nr, direction, key_parts, ..)| (nr, direction, key_parts))
}

/// Tables referenced by an order list.
pub fn order_tables(order: &[OrderItem]) -> TableMap {
    order
        .iter()
        .fold(TableMap::EMPTY, |acc, item| acc | item.expr.used_tables())
}
