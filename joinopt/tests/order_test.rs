mod utils;

use joinopt::context::StatementContext;
use joinopt::join_nest::JoinClause;
use joinopt::order::OrderItem;
use joinopt::select::{ExecStatus, SelectBuilder, SelectItem, SelectQuery};

use crate::utils::{explain, run, sorted, Database};

fn events() -> Database {
    Database::load("events")
}

fn select(db: &Database, fields: &[&str], order: Vec<OrderItem>) -> SelectBuilder {
    let mut builder = SelectBuilder::new(vec![JoinClause::table(0)]);
    builder
        .project(fields.iter().map(|f| SelectItem::expr(db.field("events", f))))
        .order_by(order);
    builder
}

/// First `n` columns of every row.
fn prefix(rows: &[String], n: usize) -> Vec<String> {
    rows.iter()
        .map(|r| r.split(", ").take(n).collect::<Vec<_>>().join(", "))
        .collect()
}

fn run_both(db: &Database, covered: SelectQuery, uncovered: SelectQuery) -> (Vec<String>, Vec<String>) {
    let ctx = StatementContext::default();
    let (index_rows, index_summary) = run(db, covered, &ctx);
    assert!(!index_summary.filesort_used);
    let (sorted_rows, sort_summary) = run(db, uncovered, &ctx);
    assert!(sort_summary.filesort_used);
    (index_rows, prefix(&sorted_rows, 2))
}

#[test]
fn test_covering_index_replaces_sort() {
    let db = events();
    let order = || {
        vec![
            OrderItem::asc(db.field("events", "kind")),
            OrderItem::asc(db.field("events", "score")),
        ]
    };
    let (index_rows, sorted_rows) = run_both(
        &db,
        select(&db, &["kind", "score"], order()).build(),
        select(&db, &["kind", "score", "id"], order()).build(),
    );
    assert_eq!(16, index_rows.len());
    assert_eq!(sorted_rows, index_rows);
    assert_eq!("NULL, NULL", index_rows[0]);
    assert_eq!("5, 35", index_rows[15]);
}

#[test]
fn test_backward_index_scan_replaces_descending_sort() {
    let db = events();
    let order = || {
        vec![
            OrderItem::desc(db.field("events", "kind")),
            OrderItem::desc(db.field("events", "score")),
        ]
    };
    let (index_rows, sorted_rows) = run_both(
        &db,
        select(&db, &["kind", "score"], order()).build(),
        select(&db, &["kind", "score", "id"], order()).build(),
    );
    assert_eq!(sorted_rows, index_rows);
    assert_eq!("5, 35", index_rows[0]);
    assert_eq!("NULL, NULL", index_rows[15]);
}

#[test]
fn test_mixed_directions_need_sort() {
    let db = events();
    let query = select(
        &db,
        &["kind", "score"],
        vec![
            OrderItem::asc(db.field("events", "kind")),
            OrderItem::desc(db.field("events", "score")),
        ],
    )
    .build();
    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert!(summary.filesort_used);
    assert_eq!(
        vec!["NULL, 5", "NULL, 5", "NULL, NULL", "1, 40", "1, 40", "1, 40", "1, 20"],
        rows[..7].to_vec()
    );
}

#[test]
fn test_limit_stops_index_scan() {
    let db = events();
    let query = || {
        select(&db, &["id"], vec![OrderItem::asc(db.field("events", "id"))])
            .limit(5)
            .build()
    };
    let (rows, summary) = run(&db, query(), &StatementContext::default());
    assert_eq!(vec!["1", "2", "3", "4", "5"], rows);
    assert_eq!(ExecStatus::LimitReached, summary.status);
    assert!(!summary.filesort_used);
    assert!(summary.examined_rows < 16);

    let plan = explain(&db, query(), &StatementContext::default());
    assert_eq!(1, plan.len());
    assert!(plan[0].starts_with("1|events|index|"));
    assert!(!plan[0].contains("Using filesort"));
}

#[test]
fn test_limit_after_sort() {
    let db = events();
    let query = select(
        &db,
        &["id", "kind"],
        vec![OrderItem::desc(db.field("events", "id"))],
    )
    .limit(3)
    .build();
    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert_eq!(vec!["16, NULL", "15, 1", "14, 5"], rows);
    assert_eq!(ExecStatus::LimitReached, summary.status);
    assert_eq!(3, summary.rows_sent);
}

#[test]
fn test_ties_in_order_keep_whole_result() {
    let db = events();
    let query = select(&db, &["id", "kind"], vec![OrderItem::asc(db.field("events", "kind"))])
        .limit(3)
        .build();
    let (rows, _) = run(&db, query, &StatementContext::default());
    assert_eq!(vec!["16, NULL", "3, NULL", "8, NULL"], sorted(rows));
}

#[test]
fn test_limit_zero_sends_nothing() {
    let db = events();
    let query = select(&db, &["id"], vec![]).limit(0).build();
    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert!(rows.is_empty());
    assert_eq!(0, summary.rows_sent);
}

#[test]
fn test_explain_reports_filesort() {
    let db = events();
    let query = select(&db, &["id", "score"], vec![OrderItem::asc(db.field("events", "score"))])
        .build();
    let plan = explain(&db, query, &StatementContext::default());
    assert_eq!(1, plan.len());
    assert!(plan[0].starts_with("1|events|ALL|"));
    assert!(plan[0].ends_with("Using filesort"));
}
