//! Access methods of a join slot.

use anyhow::anyhow;
use datafusion_common::ScalarValue;
use enum_as_inner::EnumAsInner;
use enumset::EnumSet;
use smallvec::SmallVec;
use strum_macros::AsRefStr;

use crate::catalog::{ColumnRef, FieldDef, TableDef};
use crate::error::JoinResult;
use crate::keyuse::{KeyOptimize, KeyUse};
use crate::predicate::{Expr, RowSource};
use crate::storage::{encode_key_part, fits_field, ScanOrder, StorageResult, NULL_INDICATOR};
use crate::table_map::TableMap;

mod range;

pub use range::*;

/// Name of an access method as shown by explain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsRefStr)]
pub enum AccessType {
    /// A table read while optimizing.
    #[strum(serialize = "system")]
    System,
    #[strum(serialize = "const")]
    Const,
    #[strum(serialize = "eq_ref")]
    EqRef,
    #[strum(serialize = "ref")]
    Ref,
    #[strum(serialize = "ref_or_null")]
    RefOrNull,
    #[strum(serialize = "range")]
    Range,
    #[strum(serialize = "index")]
    Index,
    #[strum(serialize = "ALL")]
    All,
}

#[derive(Clone, Debug, EnumAsInner)]
pub enum Access {
    /// Unique lookup by values known before the join starts. The table is still read per outer
    /// row, since it may be the inner side of an outer join.
    Const(RefDescriptor),
    /// Unique lookup, at most one row per outer row.
    EqRef(RefDescriptor),
    Ref(RefDescriptor),
    /// `Ref` followed by a second lookup with the NULL key.
    RefOrNull(RefDescriptor),
    Range(RangeScan),
    /// Full scan of an index, in key order.
    Index { key: usize, order: ScanOrder },
    All,
}

impl Access {
    pub fn access_type(&self) -> AccessType {
        match self {
            Access::Const(_) => AccessType::Const,
            Access::EqRef(_) => AccessType::EqRef,
            Access::Ref(_) => AccessType::Ref,
            Access::RefOrNull(_) => AccessType::RefOrNull,
            Access::Range(_) => AccessType::Range,
            Access::Index { .. } => AccessType::Index,
            Access::All => AccessType::All,
        }
    }

    /// Index the access reads through.
    pub fn key(&self) -> Option<usize> {
        match self {
            Access::Const(r) | Access::EqRef(r) | Access::Ref(r) | Access::RefOrNull(r) => Some(r.key),
            Access::Range(range) => Some(range.key),
            Access::Index { key, .. } => Some(*key),
            Access::All => None,
        }
    }

    pub fn ref_descriptor(&self) -> Option<&RefDescriptor> {
        match self {
            Access::Const(r) | Access::EqRef(r) | Access::Ref(r) | Access::RefOrNull(r) => Some(r),
            _ => None,
        }
    }

    pub fn ref_descriptor_mut(&mut self) -> Option<&mut RefDescriptor> {
        match self {
            Access::Const(r) | Access::EqRef(r) | Access::Ref(r) | Access::RefOrNull(r) => Some(r),
            _ => None,
        }
    }

    pub fn order(&self) -> ScanOrder {
        match self {
            Access::Const(r) | Access::EqRef(r) | Access::Ref(r) | Access::RefOrNull(r) => r.order,
            Access::Range(range) => range.order,
            Access::Index { order, .. } => *order,
            Access::All => ScanOrder::Forward,
        }
    }
}

/// Where the value of a key part comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreKey {
    /// Computed once, when the descriptor was built.
    Const(ScalarValue),
    /// Copied from the current row of an earlier table.
    Field(ColumnRef),
    /// Evaluated against the current rows of earlier tables.
    Item(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyPartRef {
    pub store: StoreKey,
    pub field: FieldDef,
    /// Offset of the part inside the key image.
    pub offset: usize,
    /// The value the part is bound to.
    pub value: Expr,
    pub null_rejecting: bool,
}

impl KeyPartRef {
    /// Whether a row can match the part when it is looked up by `value`. Strings longer than
    /// the field are never stored.
    fn can_match(&self, value: &ScalarValue) -> bool {
        if value.is_null() {
            return self.field.nullable && !self.null_rejecting;
        }
        fits_field(&self.field, value)
    }
}

/// Runtime lookup descriptor of a ref access.
#[derive(Clone, Debug, PartialEq)]
pub struct RefDescriptor {
    pub key: usize,
    pub key_parts: usize,
    pub key_length: usize,
    pub parts: SmallVec<[KeyPartRef; 4]>,
    /// Image of the key of the current lookup.
    pub key_buff: Vec<u8>,
    /// The key part that may also match NULL.
    pub null_ref_part: Option<usize>,
    /// Bit `i` is set when key part `i` can not match a NULL value.
    pub null_rejecting: u64,
    pub order: ScanOrder,
    scratch: Vec<u8>,
}

impl RefDescriptor {
    /// Builds the key image from the current rows of earlier tables. Returns `false` if the key
    /// can not match any row because a part that rejects NULL would be NULL.
    pub fn copy_key(&mut self, src: &dyn RowSource) -> StorageResult<bool> {
        for part in &self.parts {
            let value = match &part.store {
                StoreKey::Const(value) => {
                    if !part.can_match(value) {
                        return Ok(false);
                    }
                    continue;
                }
                StoreKey::Field(column) => src.value(*column),
                StoreKey::Item(expr) => expr.eval(src),
            };
            if !part.can_match(value) {
                return Ok(false);
            }
            self.scratch.clear();
            encode_key_part(&part.field, value, &mut self.scratch)?;
            self.key_buff[part.offset..part.offset + self.scratch.len()]
                .copy_from_slice(&self.scratch);
        }
        Ok(true)
    }

    /// The current key image with the ref-or-null part set to NULL.
    pub fn null_key(&self) -> Option<Vec<u8>> {
        let part = &self.parts[self.null_ref_part?];
        let mut key = self.key_buff.clone();
        key[part.offset] = NULL_INDICATOR;
        key[part.offset + 1..part.offset + part.field.store_length()].fill(0);
        Some(key)
    }

    /// Tables the key values are read from.
    pub fn depends_on(&self) -> TableMap {
        self.parts
            .iter()
            .fold(TableMap::EMPTY, |acc, p| acc | p.value.used_tables())
    }
}

/// Builds the ref access of `def` on the key of `keyuses`.
///
/// `keyuses` are the catalog entries of one key, in catalog order. Values may reference
/// `used_tables`, the tables joined before this one; those in `const_tables` are taken from
/// `const_row` right away.
pub fn create_ref_for_key(
    def: &TableDef,
    keyuses: &[&KeyUse],
    used_tables: TableMap,
    const_tables: TableMap,
    const_row: &dyn RowSource,
) -> JoinResult<Access> {
    let key = keyuses
        .first()
        .map(|u| u.key)
        .ok_or_else(|| anyhow!("ref access of {} without key uses", def.name))?;

    // Longest prefix without gaps. Only one part may be looked up as "value or NULL".
    let mut key_parts = 0;
    let mut key_length = 0;
    let mut found_ref_or_null = EnumSet::<KeyOptimize>::empty();
    for keyuse in keyuses {
        if keyuse.used_tables.is_subset_of(used_tables)
            && keyuse.keypart == key_parts
            && (found_ref_or_null & keyuse.optimize).is_empty()
        {
            key_parts += 1;
            key_length += def.key_part_field(key, keyuse.keypart).store_length();
            found_ref_or_null |= keyuse.optimize;
        }
    }
    if key_parts == 0 {
        return Err(anyhow!("key {} of {} has no usable first part", key, def.name).into());
    }

    let mut key_buff = Vec::new();
    key_buff.try_reserve_exact(key_length)?;
    key_buff.resize(key_length, 0);

    let mut parts = SmallVec::new();
    let mut offset = 0;
    let mut null_ref_part = None;
    let mut null_rejecting = 0u64;
    let mut uses_no_tables = true;
    for i in 0..key_parts {
        let keyuse = keyuses
            .iter()
            .find(|u| u.keypart == i && u.used_tables.is_subset_of(used_tables))
            .ok_or_else(|| anyhow!("missing key part {} of {}", i, def.name))?;
        let field = def.key_part_field(key, i).clone();
        if keyuse.null_rejecting {
            null_rejecting |= 1 << i;
        }
        uses_no_tables &= keyuse.used_tables.is_empty();

        let store = if keyuse.used_tables.is_subset_of(const_tables) {
            let value = keyuse.value.eval(const_row).clone();
            let mut image = vec![];
            encode_key_part(&field, &value, &mut image)?;
            key_buff[offset..offset + image.len()].copy_from_slice(&image);
            StoreKey::Const(value)
        } else if let Expr::Field(f) = &keyuse.value {
            StoreKey::Field(f.column)
        } else {
            StoreKey::Item(keyuse.value.clone())
        };
        // Looking for NULL makes sense only if the part can hold one.
        if keyuse.optimize.contains(KeyOptimize::RefOrNull) && field.nullable {
            null_ref_part = Some(i);
        }
        let store_length = field.store_length();
        parts.push(KeyPartRef {
            store,
            field,
            offset,
            value: keyuse.value.clone(),
            null_rejecting: keyuse.null_rejecting,
        });
        offset += store_length;
    }

    let descriptor = RefDescriptor {
        key,
        key_parts,
        key_length,
        parts,
        key_buff,
        null_ref_part,
        null_rejecting,
        order: ScanOrder::Forward,
        scratch: vec![],
    };
    let key_def = &def.keys[key];
    let access = if !key_def.unique
        || def.key_has_nullable_part(key)
        || key_parts != key_def.parts.len()
        || null_ref_part.is_some()
    {
        match null_ref_part {
            Some(_) => Access::RefOrNull(descriptor),
            None => Access::Ref(descriptor),
        }
    } else if uses_no_tables {
        // `t1 LEFT JOIN t2 ON t2.key = 30`: one row at most, but t2 may still be NULL
        // complemented, so it is not a const table.
        Access::Const(descriptor)
    } else {
        Access::EqRef(descriptor)
    };
    log::trace!("{} accessed by {} on key {}", def.name, access.access_type().as_ref(), key);
    Ok(access)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;
    use enumset::EnumSet;

    use crate::access::{create_ref_for_key, Access, AccessType, StoreKey};
    use crate::catalog::{ColumnRef, FieldDef, KeyDef, TableDef};
    use crate::keyuse::{KeyOptimize, KeyUse};
    use crate::predicate::test_util::{field, int};
    use crate::predicate::{Expr, RowSource, NULL_VALUE};
    use crate::table_map::TableMap;

    struct Rows(HashMap<ColumnRef, ScalarValue>);

    impl RowSource for Rows {
        fn value(&self, column: ColumnRef) -> &ScalarValue {
            self.0.get(&column).unwrap_or(&NULL_VALUE)
        }
    }

    fn table() -> TableDef {
        TableDef::new(
            "t1",
            vec![
                FieldDef::new("id", DataType::Int64, false),
                FieldDef::new("a", DataType::Int64, true),
                FieldDef::new("b", DataType::Int64, false),
            ],
        )
        .with_key(KeyDef::unique("primary", vec![0]))
        .with_key(KeyDef::new("ab", vec![1, 2]))
    }

    fn keyuse(key: usize, keypart: usize, value: Expr) -> KeyUse {
        KeyUse {
            table: 1,
            key,
            keypart,
            used_tables: value.used_tables(),
            value,
            optimize: EnumSet::empty(),
            keypart_map: 1 << keypart,
            null_rejecting: false,
            ref_table_rows: f64::MAX,
        }
    }

    fn no_rows() -> Rows {
        Rows(HashMap::new())
    }

    #[test]
    fn test_constant_unique_lookup_is_not_a_const_table() {
        let uses = [keyuse(0, 0, int(30))];
        let access = create_ref_for_key(
            &table(),
            &uses.iter().collect::<Vec<_>>(),
            TableMap::EMPTY,
            TableMap::EMPTY,
            &no_rows(),
        )
        .unwrap();
        assert_eq!(AccessType::Const, access.access_type());
        let descriptor = access.ref_descriptor().unwrap();
        assert!(matches!(descriptor.parts[0].store, StoreKey::Const(_)));
    }

    #[test]
    fn test_unique_lookup_by_outer_field_is_eq_ref() {
        let uses = [keyuse(0, 0, field(0, 0, "a", true))];
        let mut access = create_ref_for_key(
            &table(),
            &uses.iter().collect::<Vec<_>>(),
            TableMap::of(0),
            TableMap::EMPTY,
            &no_rows(),
        )
        .unwrap();
        assert_eq!(AccessType::EqRef, access.access_type());

        let descriptor = access.ref_descriptor_mut().unwrap();
        assert_eq!(StoreKey::Field(ColumnRef::new(0, 0)), descriptor.parts[0].store);
        let outer = Rows(maplit::hashmap! { ColumnRef::new(0, 0) => ScalarValue::Int64(Some(7)) });
        assert!(descriptor.copy_key(&outer).unwrap());
        // A NOT NULL key part can not match NULL.
        assert!(!descriptor.copy_key(&no_rows()).unwrap());
    }

    #[test]
    fn test_prefix_stops_at_unavailable_part() {
        let uses = [keyuse(1, 0, int(1)), keyuse(1, 1, field(2, 0, "c", true))];
        let access = create_ref_for_key(
            &table(),
            &uses.iter().collect::<Vec<_>>(),
            TableMap::of(0),
            TableMap::EMPTY,
            &no_rows(),
        )
        .unwrap();
        let descriptor = access.ref_descriptor().unwrap();
        assert_eq!(1, descriptor.key_parts);
        assert_eq!(9, descriptor.key_length);
    }

    #[test]
    fn test_only_one_part_looks_up_null() {
        let mut first = keyuse(1, 0, field(0, 1, "a", true));
        first.optimize = EnumSet::only(KeyOptimize::RefOrNull);
        let mut second = keyuse(1, 1, field(0, 2, "b", true));
        second.optimize = EnumSet::only(KeyOptimize::RefOrNull);
        let uses = [first, second];
        let access = create_ref_for_key(
            &table(),
            &uses.iter().collect::<Vec<_>>(),
            TableMap::of(0),
            TableMap::EMPTY,
            &no_rows(),
        )
        .unwrap();
        assert_eq!(AccessType::RefOrNull, access.access_type());
        let descriptor = access.ref_descriptor().unwrap();
        assert_eq!(1, descriptor.key_parts);
        assert_eq!(Some(0), descriptor.null_ref_part);
        let null_key = descriptor.null_key().unwrap();
        assert_eq!(vec![0; 9], null_key);
    }

    #[test]
    fn test_ref_or_null_on_not_null_part_is_plain_ref() {
        let mut only = keyuse(0, 0, field(0, 0, "a", true));
        only.optimize = EnumSet::only(KeyOptimize::RefOrNull);
        let uses = [only];
        let access = create_ref_for_key(
            &table(),
            &uses.iter().collect::<Vec<_>>(),
            TableMap::of(0),
            TableMap::EMPTY,
            &no_rows(),
        )
        .unwrap();
        // The primary key is unique and NOT NULL, NULL lookups are pointless.
        assert!(matches!(access, Access::EqRef(_)));
    }
}
