mod utils;

use std::collections::HashSet;

use datafusion_common::ScalarValue;
use joinopt::context::{OptimizerSettings, StatementContext};
use joinopt::join_nest::JoinClause;
use joinopt::order::OrderItem;
use joinopt::predicate::{CmpOp, Predicate};
use joinopt::select::{AggFunc, ExecStatus, SelectBuilder, SelectItem, TmpTableSummary};

use crate::utils::{explain, run, sorted, Database};

fn events() -> Database {
    Database::load("events")
}

fn from_events() -> SelectBuilder {
    SelectBuilder::new(vec![JoinClause::table(0)])
}

#[test]
fn test_group_by_covering_index() {
    let db = events();
    let kind = db.field("events", "kind");
    let query = || {
        from_events()
            .project(vec![SelectItem::expr(kind.clone()), SelectItem::count_star()])
            .group_by(vec![kind.clone()])
            .build()
    };

    let (rows, summary) = run(&db, query(), &StatementContext::default());
    assert_eq!(
        vec!["NULL, 3", "1, 4", "2, 3", "3, 4", "4, 1", "5, 1"],
        rows
    );
    assert_eq!(None, summary.tmp_table);
    assert!(!summary.filesort_used);

    let plan = explain(&db, query(), &StatementContext::default());
    assert!(plan[0].starts_with("1|events|index|"));
    assert!(!plan[0].contains("Using temporary"));
}

#[test]
fn test_group_by_through_temporary_table() {
    let db = events();
    let kind = db.field("events", "kind");
    let query = || {
        from_events()
            .project(vec![
                SelectItem::expr(kind.clone()),
                SelectItem::agg(AggFunc::Sum, db.field("events", "score")),
                SelectItem::agg(AggFunc::Max, db.field("events", "id")),
            ])
            .group_by(vec![kind.clone()])
            .build()
    };

    let (rows, summary) = run(&db, query(), &StatementContext::default());
    assert_eq!(
        vec![
            "NULL, 10, 16",
            "1, 140, 15",
            "2, 30, 13",
            "3, 55, 12",
            "4, 30, 11",
            "5, 35, 14"
        ],
        rows
    );
    assert_eq!(
        Some(TmpTableSummary {
            rows: 6,
            on_disk: false
        }),
        summary.tmp_table
    );
    assert!(summary.filesort_used);

    let plan = explain(&db, query(), &StatementContext::default());
    assert!(plan[0].ends_with("Using temporary; Using filesort"));
}

#[test]
fn test_big_result_groups_on_disk() {
    let db = events();
    let kind = db.field("events", "kind");
    let query = from_events()
        .project(vec![
            SelectItem::expr(kind.clone()),
            SelectItem::agg(AggFunc::Min, db.field("events", "id")),
        ])
        .group_by(vec![kind])
        .big_result()
        .build();

    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert_eq!(
        vec!["NULL, 3", "1, 2", "2, 5", "3, 1", "4, 11", "5, 14"],
        rows
    );
    assert!(summary.tmp_table.map_or(false, |t| t.on_disk));
}

#[test]
fn test_group_order_reversed() {
    let db = events();
    let kind = db.field("events", "kind");
    let query = from_events()
        .project(vec![SelectItem::expr(kind.clone()), SelectItem::count_star()])
        .group_by(vec![kind.clone()])
        .order_by(vec![OrderItem::desc(kind)])
        .build();

    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert_eq!(
        vec!["5, 1", "4, 1", "3, 4", "2, 3", "1, 4", "NULL, 3"],
        rows
    );
    assert!(summary.filesort_used);
}

#[test]
fn test_aggregates_without_group_by() {
    let db = events();
    let score = db.field("events", "score");
    let query = from_events()
        .project(vec![
            SelectItem::count_star(),
            SelectItem::agg(AggFunc::Count, score.clone()),
            SelectItem::agg(AggFunc::Min, score.clone()),
            SelectItem::agg(AggFunc::Max, score.clone()),
            SelectItem::agg(AggFunc::Sum, score),
        ])
        .build();

    let (rows, _) = run(&db, query, &StatementContext::default());
    assert_eq!(vec!["16, 14, 5, 40, 300"], rows);
}

#[test]
fn test_aggregates_over_no_rows() {
    let db = events();
    let score = db.field("events", "score");
    let query = from_events()
        .filter(Predicate::compare(
            CmpOp::Gt,
            db.field("events", "id"),
            ScalarValue::Int64(Some(100)),
        ))
        .project(vec![
            SelectItem::count_star(),
            SelectItem::agg(AggFunc::Max, score),
        ])
        .build();

    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert_eq!(vec!["0, NULL"], rows);
    assert_eq!(1, summary.rows_sent);
}

#[test]
fn test_distinct_rows_are_unique() {
    let db = events();
    let query = || {
        from_events()
            .project(vec![SelectItem::expr(db.field("events", "score"))])
            .distinct()
            .build()
    };

    let (rows, summary) = run(&db, query(), &StatementContext::default());
    assert_eq!(9, rows.len());
    assert_eq!(rows.len(), rows.iter().collect::<HashSet<_>>().len());
    assert_eq!(
        Some(TmpTableSummary {
            rows: 9,
            on_disk: false
        }),
        summary.tmp_table
    );

    // A heap table too small for the result moves to disk halfway.
    let ctx = StatementContext::new(OptimizerSettings {
        max_heap_table_size: 16,
        ..Default::default()
    });
    let (disk_rows, disk_summary) = run(&db, query(), &ctx);
    assert!(disk_summary.tmp_table.map_or(false, |t| t.on_disk));
    assert_eq!(sorted(rows), sorted(disk_rows));
}

#[test]
fn test_distinct_with_order_and_limit() {
    let db = events();
    let score = db.field("events", "score");
    let query = from_events()
        .project(vec![SelectItem::expr(score.clone())])
        .order_by(vec![OrderItem::desc(score)])
        .distinct()
        .limit(4)
        .build();

    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert_eq!(vec!["40", "35", "30", "25"], rows);
    assert_eq!(ExecStatus::LimitReached, summary.status);
}

#[test]
fn test_distinct_limit_stops_join() {
    let db = events();
    let query = from_events()
        .project(vec![SelectItem::expr(db.field("events", "kind"))])
        .distinct()
        .limit(2)
        .build();

    let (rows, summary) = run(&db, query, &StatementContext::default());
    assert_eq!(2, rows.len());
    assert_ne!(rows[0], rows[1]);
    assert_eq!(ExecStatus::LimitReached, summary.status);
    assert!(summary.examined_rows < 16);
}

#[test]
fn test_distinct_over_groups() {
    let db = events();
    let kind = db.field("events", "kind");
    let query = from_events()
        .project(vec![SelectItem::count_star()])
        .group_by(vec![kind])
        .distinct()
        .build();

    let (rows, _) = run(&db, query, &StatementContext::default());
    assert_eq!(vec!["3", "4", "1"], rows);
}
