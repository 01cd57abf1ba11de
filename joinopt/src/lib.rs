//! ## Background
//!
//! A join optimizer in the tradition of the MySQL family of servers. The optimizer receives the
//! tables of a SELECT statement, nested inner and outer joins between them and a WHERE
//! condition. It propagates equalities through multiple equality items, reads tables that can
//! hold at most one matching row up front, collects the index lookups the conditions allow and
//! searches the space of join orders greedily, with exhaustive search up to a configurable depth
//! [1]. Conditions are then attached to the earliest table in the chosen order that binds all
//! their columns.
//!
//! The chosen plan is executed as a nested loop. Outer joins produce NULL complemented rows
//! with the match flag protocol of [2], which also lets conditions on inner tables of an outer
//! join be checked only once a match is known.
//!
//! ## Design
//!
//! * [`join_nest`] The join tree: nested joins, outer join dependencies and ON conditions.
//! * [`equality`] Multiple equalities and constant propagation.
//! * [`keyuse`] Index lookups usable for every table.
//! * [`access`] Access methods and range scans.
//! * [`plan`] Const tables, join order search, condition placement and EXPLAIN.
//! * [`order`] Reading rows in index order instead of sorting them.
//! * [`executor`] Nested loop execution and result sinks.
//! * [`tmp_table`] Temporary tables for GROUP BY and DISTINCT.
//! * [`select`] Planning and running a whole statement.
//!
//! ## Reference
//!
//! 1. Selinger, P. Griffiths, et al. "Access path selection in a relational database management
//! system." Readings in Artificial Intelligence and Databases. Morgan Kaufmann, 1989. 511-522.
//! 2. Galindo-Legaria, C. and Rosenthal, A., 1997. Outerjoin simplification and reordering for
//! query optimization. ACM Transactions on Database Systems, 22(1), pp.43-74.

#[macro_use]
extern crate prettytable;
#[macro_use]
extern crate lazy_static;

pub mod access;
pub mod catalog;
pub mod context;
pub mod equality;
pub mod error;
pub mod executor;
pub mod join_nest;
pub mod keyuse;
pub mod order;
pub mod plan;
pub mod predicate;
pub mod select;
pub mod storage;
pub mod table_map;
pub mod tmp_table;
pub mod value;
