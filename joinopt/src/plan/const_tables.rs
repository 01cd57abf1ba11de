//! Tables read while optimizing.
//!
//! A table holding at most one row, or bound through a unique key by constants, is read before
//! the join starts. Its row then acts as a constant for the rest of the statement.

use datafusion_common::ScalarValue;

use crate::access::{create_ref_for_key, AccessType};
use crate::catalog::{ColumnRef, TableDef, TableStats};
use crate::error::JoinResult;
use crate::join_nest::JoinTree;
use crate::keyuse::{KeyOptimize, KeyUseCatalog};
use crate::predicate::{Predicate, RowSource, NULL_VALUE};
use crate::storage::{KeyMatch, Row, TableHandler};
use crate::table_map::{TableMap, TableNo};

/// Rows of the tables read while optimizing.
#[derive(Clone, Debug, Default)]
pub struct ConstTables {
    pub map: TableMap,
    /// In the order the tables were read.
    pub order: Vec<TableNo>,
    /// Row of each const table, `None` when the table is NULL complemented.
    rows: Vec<Option<Row>>,
    /// How each const table was read.
    pub access: Vec<Option<AccessType>>,
    /// Key of a const table read by a unique lookup.
    pub keys: Vec<Option<usize>>,
    /// A const table of an inner join has no row.
    pub impossible: bool,
}

impl ConstTables {
    pub fn new(table_count: usize) -> Self {
        Self {
            rows: vec![None; table_count],
            access: vec![None; table_count],
            keys: vec![None; table_count],
            ..Default::default()
        }
    }

    pub fn contains(&self, table: TableNo) -> bool {
        self.map.contains(table)
    }

    pub fn row(&self, table: TableNo) -> Option<&Row> {
        self.rows[table].as_ref()
    }

    fn add(&mut self, table: TableNo, row: Option<Row>, access: AccessType, key: Option<usize>) {
        self.map.insert(table);
        self.order.push(table);
        self.rows[table] = row;
        self.access[table] = Some(access);
        self.keys[table] = key;
    }
}

impl RowSource for ConstTables {
    fn value(&self, column: ColumnRef) -> &ScalarValue {
        self.rows[column.table]
            .as_ref()
            .and_then(|row| row.get(column.field))
            .unwrap_or(&NULL_VALUE)
    }
}

/// Whether `table` may be read up front: nothing but const tables has to precede it, and an
/// outer joined table must not be embedded in a nest.
fn may_be_const(tree: &JoinTree, table: TableNo, const_map: TableMap) -> bool {
    let nesting = tree.nesting(table);
    if !nesting.dependent.is_subset_of(const_map) {
        return false;
    }
    !nesting.maybe_null || tree.embedding(tree.table_node(table)).is_none()
}

/// Unique key of `table` whose parts are all bound to values of const tables.
fn const_unique_key(
    def: &TableDef,
    catalog: &KeyUseCatalog,
    table: TableNo,
    const_map: TableMap,
) -> Option<usize> {
    (0..def.keys.len()).find(|key| {
        let key_def = &def.keys[*key];
        if !key_def.unique || def.key_has_nullable_part(*key) {
            return false;
        }
        let bound = catalog
            .for_key(table, *key)
            .filter(|u| {
                u.used_tables.is_subset_of(const_map) && !u.optimize.contains(KeyOptimize::RefOrNull)
            })
            .fold(0u64, |acc, u| acc | u.keypart_map);
        let all_parts = (1u64 << key_def.parts.len()) - 1;
        bound & all_parts == all_parts
    })
}

/// Reads the const tables of a join.
pub fn find_const_tables(
    tree: &JoinTree,
    catalog: &KeyUseCatalog,
    defs: &[TableDef],
    stats: &[TableStats],
    handlers: &mut [Box<dyn TableHandler>],
) -> JoinResult<ConstTables> {
    let mut consts = ConstTables::new(defs.len());
    loop {
        let mut found = false;
        for table in 0..defs.len() {
            if consts.contains(table) || !may_be_const(tree, table, consts.map) {
                continue;
            }
            let read = if stats[table].exact && stats[table].rows <= 1 {
                Some((handlers[table].scan_first()?, AccessType::System, None))
            } else if let Some(key) = const_unique_key(&defs[table], catalog, table, consts.map) {
                let keyuses = catalog.for_key(table, key).collect::<Vec<_>>();
                let mut access =
                    create_ref_for_key(&defs[table], &keyuses, consts.map, consts.map, &consts)?;
                let row = match access.ref_descriptor_mut() {
                    Some(descriptor) => {
                        if descriptor.copy_key(&consts)? {
                            handlers[table].index_read(key, &descriptor.key_buff, KeyMatch::Exact)?
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                Some((row, AccessType::Const, Some(key)))
            } else {
                None
            };
            let Some((row, access, key)) = read else {
                continue;
            };

            let node = tree.node(tree.table_node(table));
            if node.outer_join {
                consts.add(table, row, access, key);
                // The ON condition only refers to const tables at this point.
                let matched = node.on_expr.as_ref().map_or(true, |on| on.is_true(&consts));
                if !matched {
                    consts.rows[table] = None;
                }
            } else {
                let missing = row.is_none();
                consts.add(table, row, access, key);
                if missing {
                    log::debug!("const table {} has no row", defs[table].name);
                    consts.impossible = true;
                    return Ok(consts);
                }
            }
            found = true;
        }
        if !found {
            break;
        }
    }
    Ok(consts)
}

/// Checks the conjuncts of `conds` which only refer to const tables. Returns `false` when one
/// of them fails.
pub fn check_const_conds(conds: Option<&Predicate>, consts: &ConstTables) -> bool {
    let Some(conds) = conds else {
        return true;
    };
    let conjuncts = match conds {
        Predicate::And(args) => args.iter().collect::<Vec<_>>(),
        other => vec![other],
    };
    conjuncts
        .into_iter()
        .filter(|p| p.used_tables().is_subset_of(consts.map))
        .all(|p| p.is_true(consts))
}
