//! Discovery of the indexes usable for ref access.
//!
//! Predicates of the form `key_field = value` are collected per conjunction level into key
//! fields. Disjunctions keep only the key fields present in every branch. Surviving key fields
//! are expanded into one [`KeyUse`] per matching key part, sorted and pruned so that every
//! (table, key) run starts at part 0 and has no gaps.

use enumset::{EnumSet, EnumSetType};
use itertools::Itertools;

use crate::catalog::{ColumnRef, KeyMap, TableDef, TableStats};
use crate::equality::EqualityContext;
use crate::error::JoinResult;
use crate::join_nest::{JoinNodeId, JoinTree};
use crate::predicate::{CmpOp, Expr, FieldItem, Predicate};
use crate::table_map::{TableMap, TableNo};
use crate::value::ValueClass;
use datafusion_common::ScalarValue;

#[derive(EnumSetType, Debug)]
pub enum KeyOptimize {
    /// `col IS NULL` on a NOT NULL column of an outer joined table.
    Exists,
    /// `key = value OR key IS NULL`.
    RefOrNull,
}

#[derive(Clone, Debug)]
struct KeyField {
    field: FieldItem,
    value: Expr,
    level: usize,
    optimize: EnumSet<KeyOptimize>,
    eq_func: bool,
    null_rejecting: bool,
}

/// A key part that can be bound by a value when reading a table.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyUse {
    pub table: TableNo,
    pub key: usize,
    pub keypart: usize,
    pub value: Expr,
    /// Tables referenced by `value`.
    pub used_tables: TableMap,
    pub optimize: EnumSet<KeyOptimize>,
    pub keypart_map: u64,
    /// The lookup can not match when `value` is NULL.
    pub null_rejecting: bool,
    /// Rows of the single table `value` depends on, `f64::MAX` otherwise.
    pub ref_table_rows: f64,
}

/// A non-equality predicate on a key field whose values are not constant, e.g.
/// `t1.key BETWEEN t2.a AND t2.b`.
#[derive(Clone, Debug, PartialEq)]
pub struct SargableParam {
    pub column: ColumnRef,
    pub values: Vec<Expr>,
}

/// What the catalog learned about one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableKeyInfo {
    /// Keys which some predicate starts.
    pub keys: KeyMap,
    /// Keys which a constant predicate starts.
    pub const_keys: KeyMap,
    pub key_dependent: TableMap,
    /// Keys with at least one usable entry.
    pub checked_keys: KeyMap,
    /// Per key, the parts bound to constants.
    pub const_key_parts: Vec<u64>,
    /// A `col IS NULL` on a NOT NULL column allows stopping after the first match.
    pub not_exists_optimize: bool,
}

#[derive(Clone, Debug, Default)]
pub struct KeyUseCatalog {
    pub keyuse: Vec<KeyUse>,
    pub sargables: Vec<SargableParam>,
    pub tables: Vec<TableKeyInfo>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CondKind {
    Eq,
    MultiEq,
    Between,
    Other,
}

struct KeyFieldCollector<'a> {
    defs: &'a [TableDef],
    equalities: &'a EqualityContext,
    outer_tables: TableMap,
    fields: Vec<KeyField>,
    and_level: usize,
    sargables: Vec<SargableParam>,
    tables: Vec<TableKeyInfo>,
}

impl KeyUseCatalog {
    /// Collects the key uses of the WHERE condition and of all ON conditions of `tree`.
    pub fn build(
        defs: &[TableDef],
        equalities: &EqualityContext,
        conds: Option<&Predicate>,
        tree: &JoinTree,
    ) -> JoinResult<Self> {
        let outer_tables = tree.outer_join_tables();
        let mut collector = KeyFieldCollector {
            defs,
            equalities,
            outer_tables,
            fields: vec![],
            and_level: 0,
            sargables: vec![],
            tables: defs
                .iter()
                .map(|def| TableKeyInfo {
                    const_key_parts: vec![0; def.keys.len()],
                    ..Default::default()
                })
                .collect(),
        };
        let mut keyuse = vec![];

        let normal_tables = !outer_tables & TableMap::first(defs.len());
        if let Some(conds) = conds {
            collector.add_key_fields(conds, normal_tables);
            for field in std::mem::take(&mut collector.fields) {
                if field.value.is_null_const() && !field.field.nullable {
                    collector.tables[field.field.column.table].not_exists_optimize = true;
                }
                add_key_part(defs, &mut keyuse, &field)?;
            }
        }

        for table in 0..defs.len() {
            let node = tree.node(tree.table_node(table));
            if let Some(on) = &node.on_expr {
                collector.add_key_fields(on, TableMap::of(table));
            }
        }
        for node in tree.children(tree.root()) {
            if tree.node(node).is_nest() {
                collector.add_key_fields_for_nj(tree, node);
            }
        }
        for field in std::mem::take(&mut collector.fields) {
            add_key_part(defs, &mut keyuse, &field)?;
        }

        let mut catalog = KeyUseCatalog {
            keyuse,
            sargables: collector.sargables,
            tables: collector.tables,
        };
        catalog.sort_and_prune();
        log::debug!("key use catalog holds {} entries", catalog.keyuse.len());
        Ok(catalog)
    }

    /// Sorts by (table, key, part, constants first, ref-or-null last) and drops the entries
    /// that can not take part in a lookup.
    fn sort_and_prune(&mut self) {
        self.keyuse.sort_by_key(|u| {
            (
                u.table,
                u.key,
                u.keypart,
                !u.used_tables.is_empty(),
                u.optimize.contains(KeyOptimize::RefOrNull),
            )
        });

        let mut kept: Vec<KeyUse> = Vec::with_capacity(self.keyuse.len());
        let mut found_eq_constant = false;
        for keyuse in std::mem::take(&mut self.keyuse) {
            let info = &mut self.tables[keyuse.table];
            if keyuse.used_tables.is_empty() && !keyuse.optimize.contains(KeyOptimize::RefOrNull) {
                info.const_key_parts[keyuse.key] |= keyuse.keypart_map;
            }
            match kept.last() {
                Some(prev) if prev.key == keyuse.key && prev.table == keyuse.table => {
                    // A gap, or a second value for a part already bound to a constant.
                    if prev.keypart + 1 < keyuse.keypart
                        || (prev.keypart == keyuse.keypart && found_eq_constant)
                    {
                        continue;
                    }
                }
                _ => {
                    if keyuse.keypart != 0 {
                        continue;
                    }
                }
            }
            found_eq_constant = keyuse.used_tables.is_empty();
            info.checked_keys.insert(keyuse.key);
            kept.push(keyuse);
        }
        self.keyuse = kept;
    }

    /// Estimates the rows a lookup value ranges over, ignoring the const tables.
    pub fn optimize_keyuse(&mut self, const_tables: TableMap, stats: &[TableStats]) {
        for keyuse in self.keyuse.iter_mut() {
            keyuse.ref_table_rows = f64::MAX;
            let map = keyuse.used_tables & !const_tables;
            if map.len() == 1 {
                if let Some(table) = map.iter().next() {
                    keyuse.ref_table_rows = (stats[table].rows as f64).max(100.0);
                }
            }
        }
    }

    /// Entries of `table`, ordered by key and part.
    pub fn for_table(&self, table: TableNo) -> &[KeyUse] {
        let start = self.keyuse.partition_point(|u| u.table < table);
        let end = self.keyuse.partition_point(|u| u.table <= table);
        &self.keyuse[start..end]
    }

    /// Entries of one key of `table`.
    pub fn for_key(&self, table: TableNo, key: usize) -> impl Iterator<Item = &KeyUse> {
        self.for_table(table).iter().filter(move |u| u.key == key)
    }
}

fn add_key_part(defs: &[TableDef], keyuse: &mut Vec<KeyUse>, field: &KeyField) -> JoinResult<()> {
    if !field.eq_func || field.optimize.contains(KeyOptimize::Exists) {
        return Ok(());
    }
    let column = field.field.column;
    let def = &defs[column.table];
    for (key, key_def) in def.keys.iter().enumerate() {
        for (part, part_field) in key_def.parts.iter().enumerate() {
            if *part_field != column.field {
                continue;
            }
            keyuse.try_reserve(1)?;
            keyuse.push(KeyUse {
                table: column.table,
                key,
                keypart: part,
                value: field.value.clone(),
                used_tables: field.value.used_tables(),
                optimize: field.optimize & KeyOptimize::RefOrNull,
                keypart_map: 1 << part,
                null_rejecting: field.null_rejecting,
                ref_table_rows: f64::MAX,
            });
        }
    }
    Ok(())
}

fn merge_flags(old: EnumSet<KeyOptimize>, new: EnumSet<KeyOptimize>) -> EnumSet<KeyOptimize> {
    (old & new & KeyOptimize::Exists) | ((old | new) & KeyOptimize::RefOrNull)
}

impl<'a> KeyFieldCollector<'a> {
    fn add_key_fields(&mut self, cond: &Predicate, usable_tables: TableMap) {
        match cond {
            Predicate::And(args) => {
                let start = self.fields.len();
                for arg in args {
                    self.add_key_fields(arg, usable_tables);
                }
                let level = self.and_level;
                self.fields[start..].iter_mut().for_each(|f| f.level = level);
            }
            Predicate::Or(args) => {
                let start = self.fields.len();
                self.and_level += 1;
                if let Some(first) = args.first() {
                    self.add_key_fields(first, usable_tables);
                }
                for arg in args.iter().skip(1) {
                    let branch_start = self.fields.len();
                    self.and_level += 1;
                    self.add_key_fields(arg, usable_tables);
                    self.and_level += 1;
                    self.merge_key_fields(start, branch_start, self.and_level);
                }
            }
            Predicate::Compare { op, left, right } => {
                let eq_func = *op == CmpOp::Eq;
                let kind = if eq_func { CondKind::Eq } else { CondKind::Other };
                if let Expr::Field(field) = left {
                    self.add_key_equal_fields(kind, field, eq_func, std::slice::from_ref(right), usable_tables);
                }
                if let Expr::Field(field) = right {
                    self.add_key_equal_fields(kind, field, eq_func, std::slice::from_ref(left), usable_tables);
                }
            }
            Predicate::Between { expr, low, high } => {
                if let Expr::Field(field) = expr {
                    let values = [low.clone(), high.clone()];
                    self.add_key_equal_fields(CondKind::Between, field, false, &values, usable_tables);
                }
                for bound in [low, high] {
                    if let Expr::Field(field) = bound {
                        self.add_key_equal_fields(
                            CondKind::Between,
                            field,
                            false,
                            std::slice::from_ref(expr),
                            usable_tables,
                        );
                    }
                }
            }
            Predicate::InList { expr: Expr::Field(field), list } => {
                // A single element list is an equality.
                let (kind, eq_func) = if list.len() == 1 {
                    (CondKind::Eq, true)
                } else {
                    (CondKind::Other, false)
                };
                self.add_key_equal_fields(kind, field, eq_func, list, usable_tables);
            }
            Predicate::IsNull(Expr::Field(field)) => {
                let null = [Expr::Const(ScalarValue::Null)];
                self.add_key_equal_fields(CondKind::Other, field, true, &null, usable_tables);
            }
            Predicate::IsNotNull(Expr::Field(field)) => {
                let null = [Expr::Const(ScalarValue::Null)];
                self.add_key_equal_fields(CondKind::Other, field, false, &null, usable_tables);
            }
            Predicate::MultiEq(eq) => match &eq.constant {
                Some(constant) => {
                    let value = [Expr::Const(constant.clone())];
                    for field in &eq.fields {
                        self.add_key_field(CondKind::MultiEq, field, true, &value, usable_tables);
                    }
                }
                None => {
                    for (field, other) in eq.fields.iter().cartesian_product(eq.fields.iter()) {
                        if field.column != other.column {
                            let value = [Expr::Field(other.clone())];
                            self.add_key_field(CondKind::MultiEq, field, true, &value, usable_tables);
                        }
                    }
                }
            },
            _ => {}
        }
    }

    /// ON conditions of a nest bind keys of the nest's own tables only.
    fn add_key_fields_for_nj(&mut self, tree: &JoinTree, nest: JoinNodeId) {
        let mut tables = TableMap::EMPTY;
        for member in tree.children(nest) {
            let node = tree.node(member);
            match node.table {
                None => self.add_key_fields_for_nj(tree, member),
                Some(table) if node.on_expr.is_none() => tables.insert(table),
                Some(_) => {}
            }
        }
        if let Some(on) = &tree.node(nest).on_expr {
            self.add_key_fields(on, tables);
        }
    }

    /// Adds the key field for `field` and for every field known to be equal to it.
    fn add_key_equal_fields(
        &mut self,
        kind: CondKind,
        field: &FieldItem,
        eq_func: bool,
        values: &[Expr],
        usable_tables: TableMap,
    ) {
        self.add_key_field(kind, field, eq_func, values, usable_tables);
        if let Some(set) = field.equal_set {
            let members = self.equalities.set(set).fields.clone();
            for member in members.iter().filter(|m| m.column != field.column) {
                self.add_key_field(kind, member, eq_func, values, usable_tables);
            }
        }
    }

    fn add_key_field(
        &mut self,
        kind: CondKind,
        field: &FieldItem,
        mut eq_func: bool,
        values: &[Expr],
        usable_tables: TableMap,
    ) {
        let Some(first_value) = values.first() else {
            return;
        };
        let table = field.column.table;
        let def = &self.defs[table];
        let field_def = &def.fields[field.column.field];
        let outer = self.outer_tables.contains(table);
        // `col IS NULL` on a NOT NULL column of an outer joined table.
        let exists_candidate =
            eq_func && first_value.is_null_const() && outer && !field_def.nullable;
        let mut optimize = EnumSet::empty();

        if def.part_of_key(field.column.field).is_empty() {
            if !exists_candidate {
                return;
            }
            optimize |= KeyOptimize::Exists;
        } else {
            let used_tables = values
                .iter()
                .fold(TableMap::EMPTY, |acc, v| acc | v.used_tables());
            if !values.iter().any(|v| !v.used_tables().contains(table)) {
                return;
            }
            if !usable_tables.contains(table) {
                if !exists_candidate {
                    return;
                }
                optimize |= KeyOptimize::Exists;
            } else {
                let possible_keys = def.key_start(field.column.field);
                let info = &mut self.tables[table];
                info.keys |= possible_keys;
                info.key_dependent |= used_tables;

                let is_const = values.iter().all(|v| v.used_tables().is_empty());
                if is_const {
                    info.const_keys |= possible_keys;
                } else if !eq_func {
                    self.sargables.push(SargableParam {
                        column: field.column,
                        values: values.to_vec(),
                    });
                }
                if !eq_func {
                    // `key BETWEEN c AND c` is `key = c`.
                    let degenerate_between = kind == CondKind::Between
                        && values.len() == 2
                        && values[0].same_as(&values[1]);
                    if !degenerate_between {
                        return;
                    }
                    eq_func = true;
                }
                if !value_usable_for_key(&field.data_type, first_value) {
                    return;
                }
            }
        }

        let null_rejecting = matches!(kind, CondKind::Eq | CondKind::MultiEq)
            && match first_value {
                Expr::Field(f) => f.nullable || self.outer_tables.contains(f.column.table),
                _ => false,
            };
        self.fields.push(KeyField {
            field: FieldItem {
                equal_set: None,
                ..field.clone()
            },
            value: first_value.clone(),
            level: self.and_level,
            optimize,
            eq_func,
            null_rejecting,
        });
    }

    /// Keeps the key fields added before `new_start` that every branch of a disjunction
    /// provides. Everything from `start` on is replaced by the merged fields.
    fn merge_key_fields(&mut self, start: usize, new_start: usize, and_level: usize) {
        let new_fields = self.fields.split_off(new_start);
        if start == new_start || new_fields.is_empty() {
            self.fields.truncate(start);
            return;
        }

        for new in &new_fields {
            let mut i = start;
            while i < self.fields.len() {
                let old = &mut self.fields[i];
                if old.field.column != new.field.column {
                    i += 1;
                    continue;
                }
                if !new.value.used_tables().is_empty() {
                    if old.value.same_as(&new.value) {
                        old.level = and_level;
                        old.optimize = merge_flags(old.optimize, new.optimize);
                        old.null_rejecting &= new.null_rejecting;
                    }
                } else if old.eq_func && new.eq_func && old.value.same_as(&new.value) {
                    old.level = and_level;
                    old.optimize = merge_flags(old.optimize, new.optimize);
                    old.null_rejecting &= new.null_rejecting;
                } else if old.eq_func
                    && new.eq_func
                    && (old.value.is_null_const() || new.value.is_null_const())
                {
                    // field = value OR field IS NULL
                    old.level = and_level;
                    old.optimize = EnumSet::only(KeyOptimize::RefOrNull);
                    if old.value.is_null_const() {
                        old.value = new.value.clone();
                    }
                    old.null_rejecting = false;
                } else {
                    // Two different constants: leave the field to range analysis.
                    self.fields.swap_remove(i);
                    continue;
                }
                i += 1;
            }
        }

        let merged = self.fields.split_off(start);
        self.fields
            .extend(merged.into_iter().filter(|f| f.level == and_level));
    }
}

/// Whether a key on a column of `data_type` can be looked up with `value`.
pub(crate) fn value_usable_for_key(data_type: &arrow_schema::DataType, value: &Expr) -> bool {
    let field_class = ValueClass::of_type(data_type);
    let value_class = match value {
        Expr::Const(c) if c.is_null() => return true,
        Expr::Const(c) => ValueClass::of_value(c),
        Expr::Field(f) => ValueClass::of_type(&f.data_type),
        Expr::Row(_) => return false,
    };
    // A fractional value can not be stored into an integer key part.
    match (field_class, value_class) {
        (ValueClass::Integer, ValueClass::Real) => false,
        (f, v) => f.comparable(&v),
    }
}
