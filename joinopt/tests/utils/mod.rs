use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context};
use arrow_schema::DataType;
use datafusion_common::ScalarValue;
use joinopt::catalog::{ColumnRef, FieldDef, KeyDef, TableDef};
use joinopt::context::StatementContext;
use joinopt::executor::CollectingSink;
use joinopt::predicate::{Expr, FieldItem};
use joinopt::select::{execute_select, explain_select, ExecSummary, SelectQuery};
use joinopt::storage::{MemoryTable, Row, TableHandler};
use serde::Deserialize;

#[derive(Clone, Deserialize)]
pub struct FieldFixture {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
    pub length: Option<usize>,
}

#[derive(Clone, Deserialize)]
pub struct KeyFixture {
    pub name: String,
    pub parts: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Clone, Deserialize)]
pub struct TableFixture {
    pub name: String,
    pub fields: Vec<FieldFixture>,
    #[serde(default)]
    pub keys: Vec<KeyFixture>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_yaml::Value>>,
}

/// Tables of one test database, loaded from `tests/resources/<name>.yaml`.
#[derive(Deserialize)]
pub struct Database {
    pub tables: Vec<TableFixture>,
}

impl Database {
    pub fn load(name: &str) -> Self {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/resources")
            .join(format!("{}.yaml", name));
        let file = File::options()
            .read(true)
            .open(&path)
            .with_context(|| format!("Failed to open fixture file: {:?}", &path))
            .unwrap();
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to load tables from file: {:?}", &path))
            .unwrap()
    }

    /// The tables named by `tables`, numbered in that order.
    pub fn subset(&self, tables: &[&str]) -> Self {
        Self {
            tables: tables
                .iter()
                .map(|t| self.tables[self.table_no(t)].clone())
                .collect(),
        }
    }

    pub fn table_no(&self, table: &str) -> usize {
        self.tables
            .iter()
            .position(|t| t.name == table)
            .unwrap_or_else(|| panic!("No table {}", table))
    }

    /// Column reference `table.field`.
    pub fn field(&self, table: &str, field: &str) -> Expr {
        let nr = self.table_no(table);
        let fixture = &self.tables[nr];
        let idx = fixture
            .fields
            .iter()
            .position(|f| f.name == field)
            .unwrap_or_else(|| panic!("No field {}.{}", table, field));
        let def = &fixture.fields[idx];
        Expr::Field(FieldItem::new(
            ColumnRef::new(nr, idx),
            format!("{}.{}", table, field),
            def.data_type.clone(),
            def.nullable,
        ))
    }

    fn def(&self, fixture: &TableFixture) -> TableDef {
        let fields = fixture
            .fields
            .iter()
            .map(|f| {
                let def = FieldDef::new(&f.name, f.data_type.clone(), f.nullable);
                match f.length {
                    Some(length) => def.with_length(length),
                    None => def,
                }
            })
            .collect();
        let mut def = TableDef::new(&fixture.name, fields);
        for key in &fixture.keys {
            let parts = key
                .parts
                .iter()
                .map(|p| fixture.fields.iter().position(|f| &f.name == p).unwrap())
                .collect();
            def = def.with_key(if key.unique {
                KeyDef::unique(&key.name, parts)
            } else {
                KeyDef::new(&key.name, parts)
            });
        }
        def
    }

    /// Fresh handlers over the fixture rows, in table order.
    pub fn handlers(&self) -> Vec<Box<dyn TableHandler>> {
        self.tables
            .iter()
            .map(|fixture| {
                let rows = fixture
                    .rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .zip(&fixture.fields)
                            .map(|(v, f)| to_scalar(v, &f.data_type).unwrap())
                            .collect()
                    })
                    .collect();
                let table = MemoryTable::with_rows(self.def(fixture), rows).unwrap();
                Box::new(table) as Box<dyn TableHandler>
            })
            .collect()
    }
}

fn to_scalar(value: &serde_yaml::Value, data_type: &DataType) -> anyhow::Result<ScalarValue> {
    Ok(match (value, data_type) {
        (serde_yaml::Value::Null, _) => ScalarValue::try_from(data_type)?,
        (serde_yaml::Value::Number(n), DataType::Int64) => {
            ScalarValue::Int64(Some(n.as_i64().context("not an integer")?))
        }
        (serde_yaml::Value::Number(n), DataType::Float64) => {
            ScalarValue::Float64(Some(n.as_f64().context("not a number")?))
        }
        (serde_yaml::Value::String(s), DataType::Utf8) => ScalarValue::Utf8(Some(s.clone())),
        (v, t) => bail!("Unsupported fixture value {:?} of type {}", v, t),
    })
}

/// Renders a row like `1, ann, NULL`.
pub fn render(row: &Row) -> String {
    row.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn render_all(rows: &[Row]) -> Vec<String> {
    rows.iter().map(render).collect()
}

pub fn sorted(mut rows: Vec<String>) -> Vec<String> {
    rows.sort();
    rows
}

/// Runs `query` over fresh handlers of `db`.
pub fn run(db: &Database, query: SelectQuery, ctx: &StatementContext) -> (Vec<String>, ExecSummary) {
    let mut handlers = db.handlers();
    let mut result = CollectingSink::default();
    let summary = execute_select(query, &mut handlers, ctx, &mut result).unwrap();
    assert!(result.finished);
    (render_all(&result.rows), summary)
}

/// Rows of the EXPLAIN table, cells joined by `|`, header excluded.
pub fn explain(db: &Database, query: SelectQuery, ctx: &StatementContext) -> Vec<String> {
    let mut handlers = db.handlers();
    let table = explain_select(query, &mut handlers, ctx).unwrap();
    table
        .row_iter()
        .skip(1)
        .map(|row| {
            row.iter()
                .map(|cell| cell.get_content())
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect()
}
