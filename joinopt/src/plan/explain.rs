use itertools::Itertools;
use prettytable::Table;

use crate::access::{Access, RefDescriptor, StoreKey};
use crate::catalog::{KeyMap, TableDef};
use crate::plan::JoinPlan;

const NULL: &str = "NULL";

fn key_names(def: &TableDef, keys: KeyMap) -> String {
    if keys.is_empty() {
        return NULL.to_string();
    }
    keys.iter().map(|k| def.keys[k].name.as_str()).join(",")
}

fn ref_sources(descriptor: &RefDescriptor) -> String {
    descriptor
        .parts
        .iter()
        .map(|p| match &p.store {
            StoreKey::Const(_) => "const".to_string(),
            _ => p.value.to_string(),
        })
        .join(",")
}

/// Renders the plan like `EXPLAIN` does. `notes` are appended to the extra column of the first
/// table read by the join, e.g. `Using filesort`.
pub fn explain_plan(plan: &JoinPlan, defs: &[TableDef], notes: &[&str]) -> Table {
    let mut table = Table::new();
    table.add_row(row![
        "id",
        "table",
        "type",
        "possible_keys",
        "key",
        "key_len",
        "ref",
        "rows",
        "Extra"
    ]);
    if plan.impossible_where {
        table.add_row(row![
            "1",
            NULL,
            NULL,
            NULL,
            NULL,
            NULL,
            NULL,
            NULL,
            "Impossible WHERE noticed after reading const tables"
        ]);
        return table;
    }

    for &t in &plan.consts.order {
        let def = &defs[t];
        let access = plan.consts.access[t].as_ref().map_or(NULL, |a| a.as_ref());
        let key = plan.consts.keys[t];
        table.add_row(row![
            "1",
            def.name,
            access,
            key.map_or(NULL.to_string(), |k| def.keys[k].name.clone()),
            key.map_or(NULL.to_string(), |k| def.keys[k].name.clone()),
            key.map_or(NULL.to_string(), |k| def.key_length(k).to_string()),
            key.map_or(NULL, |_| "const"),
            "1",
            ""
        ]);
    }

    for (idx, slot) in plan.slots.iter().enumerate() {
        let def = &defs[slot.table];
        let (key, key_len, reference) = match &slot.access {
            Access::Const(r) | Access::EqRef(r) | Access::Ref(r) | Access::RefOrNull(r) => (
                def.keys[r.key].name.clone(),
                r.key_length.to_string(),
                ref_sources(r),
            ),
            Access::Range(range) => (
                def.keys[range.key].name.clone(),
                range.prefix_length.to_string(),
                NULL.to_string(),
            ),
            Access::Index { key, .. } => (
                def.keys[*key].name.clone(),
                def.key_length(*key).to_string(),
                NULL.to_string(),
            ),
            Access::All => (NULL.to_string(), NULL.to_string(), NULL.to_string()),
        };
        let mut extra = vec![];
        if slot.not_exists {
            extra.push("Not exists");
        }
        if slot.select_cond.is_some() {
            extra.push("Using where");
        }
        if slot.use_row_cache {
            extra.push("Using join buffer");
        }
        if idx == 0 {
            extra.extend_from_slice(notes);
        }
        table.add_row(row![
            "1",
            def.name,
            slot.access.access_type().as_ref(),
            key_names(def, slot.possible_keys),
            key,
            key_len,
            reference,
            format!("{:.0}", slot.records),
            extra.join("; ")
        ]);
    }
    table
}
