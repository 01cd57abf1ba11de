//! SELECT statements over a join: planning, the choice of the row sink and execution.

use std::fmt::{Display, Formatter};

use arrow_schema::DataType;
use datafusion_common::ScalarValue;
use strum_macros::AsRefStr;

use crate::catalog::{KeyMap, TableDef, TableStats};
use crate::context::{OptimizerSettings, StatementContext};
use crate::equality::{remove_eq_conds, CondResult, EqualityContext};
use crate::error::{JoinError, JoinResult};
use crate::executor::{
    DistinctSink, GroupSink, GroupUpdateSink, JoinExecutor, JoinSink, Output, ResultSink,
    RowSink, SendSink, SinkStatus,
};
use crate::join_nest::{JoinClause, JoinOperand, JoinTree};
use crate::keyuse::KeyUseCatalog;
use crate::order::{order_tables, test_if_skip_sort_order, OrderItem, SortElisionEnv};
use crate::plan::{explain_plan, make_join_plan, ConstTables, JoinPlan};
use crate::predicate::{Expr, FieldItem, Predicate};
use crate::storage::TableHandler;
use crate::table_map::TableMap;
use crate::tmp_table::{TmpTable, TmpTableLayout};
use crate::value::{as_f64, as_i128, compare_values, null_of};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, AsRefStr)]
pub enum AggFunc {
    #[strum(serialize = "COUNT")]
    Count,
    #[strum(serialize = "SUM")]
    Sum,
    #[strum(serialize = "MIN")]
    Min,
    #[strum(serialize = "MAX")]
    Max,
}

impl AggFunc {
    pub fn result_type(&self, arg: Option<&DataType>) -> DataType {
        match self {
            AggFunc::Count => DataType::Int64,
            AggFunc::Sum => match arg {
                Some(DataType::Float32 | DataType::Float64) => DataType::Float64,
                _ => DataType::Int64,
            },
            AggFunc::Min | AggFunc::Max => arg.cloned().unwrap_or(DataType::Null),
        }
    }

    /// Value over no rows.
    pub fn empty(&self, data_type: &DataType) -> ScalarValue {
        match self {
            AggFunc::Count => ScalarValue::Int64(Some(0)),
            _ => null_of(data_type),
        }
    }

    /// Value over the first row. `arg` is `None` for `COUNT(*)`.
    pub fn init(&self, arg: Option<&ScalarValue>, data_type: &DataType) -> ScalarValue {
        match (self, arg) {
            (AggFunc::Count, None) => ScalarValue::Int64(Some(1)),
            (AggFunc::Count, Some(v)) => ScalarValue::Int64(Some(i64::from(!v.is_null()))),
            (_, None) => null_of(data_type),
            (_, Some(v)) if v.is_null() => null_of(data_type),
            (AggFunc::Sum, Some(v)) => match data_type {
                DataType::Float64 => ScalarValue::Float64(as_f64(v)),
                _ => ScalarValue::Int64(as_i128(v).map(saturate)),
            },
            (AggFunc::Min | AggFunc::Max, Some(v)) => v.clone(),
        }
    }

    /// Folds one more row into `acc`. NULL arguments are skipped.
    pub fn update(&self, acc: &mut ScalarValue, arg: Option<&ScalarValue>) {
        if matches!(arg, Some(v) if v.is_null()) {
            return;
        }
        let Some(v) = arg else {
            if let (AggFunc::Count, ScalarValue::Int64(Some(n))) = (self, acc) {
                *n += 1;
            }
            return;
        };
        if acc.is_null() {
            *acc = self.init(Some(v), &acc.get_datatype());
            return;
        }
        let replace = match self {
            AggFunc::Min => compare_values(v, acc).map_or(false, |o| o.is_lt()),
            AggFunc::Max => compare_values(v, acc).map_or(false, |o| o.is_gt()),
            AggFunc::Count | AggFunc::Sum => false,
        };
        if replace {
            *acc = v.clone();
            return;
        }
        match (self, acc) {
            (AggFunc::Count, ScalarValue::Int64(Some(n))) => *n += 1,
            (AggFunc::Sum, ScalarValue::Int64(Some(n))) => {
                *n = saturate(i128::from(*n) + as_i128(v).unwrap_or(0));
            }
            (AggFunc::Sum, ScalarValue::Float64(Some(n))) => *n += as_f64(v).unwrap_or(0.0),
            _ => {}
        }
    }
}

fn saturate(v: i128) -> i64 {
    v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// One entry of the select list.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectItem {
    Expr {
        expr: Expr,
        name: String,
    },
    Agg {
        func: AggFunc,
        /// `None` for `COUNT(*)`.
        arg: Option<Expr>,
        name: String,
    },
}

impl SelectItem {
    pub fn expr<E: Into<Expr>>(expr: E) -> Self {
        let expr = expr.into();
        SelectItem::Expr {
            name: expr.to_string(),
            expr,
        }
    }

    pub fn agg<E: Into<Expr>>(func: AggFunc, arg: E) -> Self {
        let arg = arg.into();
        SelectItem::Agg {
            name: format!("{}({})", func.as_ref(), arg),
            func,
            arg: Some(arg),
        }
    }

    pub fn count_star() -> Self {
        SelectItem::Agg {
            func: AggFunc::Count,
            arg: None,
            name: "COUNT(*)".to_string(),
        }
    }

    pub fn named<S: Into<String>>(mut self, new_name: S) -> Self {
        match &mut self {
            SelectItem::Expr { name, .. } | SelectItem::Agg { name, .. } => *name = new_name.into(),
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            SelectItem::Expr { name, .. } | SelectItem::Agg { name, .. } => name,
        }
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            SelectItem::Expr { expr, .. } => Some(expr),
            SelectItem::Agg { .. } => None,
        }
    }

    pub fn is_agg(&self) -> bool {
        matches!(self, SelectItem::Agg { .. })
    }

    pub fn data_type(&self) -> DataType {
        fn type_of(expr: &Expr) -> DataType {
            match expr {
                Expr::Field(f) => f.data_type.clone(),
                Expr::Const(v) => v.get_datatype(),
                Expr::Row(_) => DataType::Null,
            }
        }
        match self {
            SelectItem::Expr { expr, .. } => type_of(expr),
            SelectItem::Agg { func, arg, .. } => func.result_type(arg.as_ref().map(type_of).as_ref()),
        }
    }
}

impl Display for SelectItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A SELECT statement over the tables of one join.
#[derive(Clone, Debug, Default)]
pub struct SelectQuery {
    pub from: Vec<JoinClause>,
    pub conds: Option<Predicate>,
    pub fields: Vec<SelectItem>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderItem>,
    pub distinct: bool,
    pub limit: Option<u64>,
    /// The result is expected to be large, temporary tables go to disk right away.
    pub big_result: bool,
}

#[derive(Default)]
pub struct SelectBuilder {
    query: SelectQuery,
}

impl SelectBuilder {
    pub fn new(from: Vec<JoinClause>) -> Self {
        Self {
            query: SelectQuery {
                from,
                ..Default::default()
            },
        }
    }

    pub fn filter(&mut self, cond: Predicate) -> &mut Self {
        self.query.conds = Some(cond);
        self
    }

    pub fn project<I: IntoIterator<Item = SelectItem>>(&mut self, items: I) -> &mut Self {
        self.query.fields.extend(items);
        self
    }

    pub fn group_by<I: IntoIterator<Item = Expr>>(&mut self, exprs: I) -> &mut Self {
        self.query.group_by.extend(exprs);
        self
    }

    pub fn order_by<I: IntoIterator<Item = OrderItem>>(&mut self, items: I) -> &mut Self {
        self.query.order_by.extend(items);
        self
    }

    pub fn distinct(&mut self) -> &mut Self {
        self.query.distinct = true;
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn big_result(&mut self) -> &mut Self {
        self.query.big_result = true;
        self
    }

    pub fn build(&mut self) -> SelectQuery {
        std::mem::take(&mut self.query)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    /// The result was cut at LIMIT.
    LimitReached,
    /// The WHERE condition is false for every row, no table was joined.
    ImpossibleWhere,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TmpTableSummary {
    pub rows: usize,
    pub on_disk: bool,
}

/// Outcome of a successful statement.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecSummary {
    pub status: ExecStatus,
    pub rows_sent: u64,
    pub examined_rows: u64,
    pub filesort_used: bool,
    pub tmp_table: Option<TmpTableSummary>,
}

/// What consumes the joined rows, before any temporary table is created.
#[derive(Debug)]
enum SinkPlan {
    Send {
        fields: Vec<Expr>,
        sort_key: Vec<Expr>,
    },
    Group {
        items: Vec<SelectItem>,
        group_by: Vec<Expr>,
        sort_key: Vec<Expr>,
    },
    Distinct {
        layout: TmpTableLayout,
        limit: Option<u64>,
    },
    GroupUpdate {
        layout: TmpTableLayout,
    },
}

impl SinkPlan {
    fn uses_tmp_table(&self) -> bool {
        matches!(self, SinkPlan::Distinct { .. } | SinkPlan::GroupUpdate { .. })
    }

    fn create(self, settings: &OptimizerSettings, big_result: bool) -> JoinResult<JoinSink> {
        Ok(match self {
            SinkPlan::Send { fields, sort_key } => SendSink { fields, sort_key }.into(),
            SinkPlan::Group {
                items,
                group_by,
                sort_key,
            } => GroupSink::new(items, group_by, sort_key).into(),
            SinkPlan::Distinct { layout, limit } => DistinctSink {
                tmp: TmpTable::create(layout, settings, big_result)?,
                limit,
            }
            .into(),
            SinkPlan::GroupUpdate { layout } => GroupUpdateSink {
                tmp: TmpTable::create(layout, settings, big_result)?,
            }
            .into(),
        })
    }
}

#[derive(Debug)]
struct SelectPlan {
    defs: Vec<TableDef>,
    join: JoinPlan,
    sink: SinkPlan,
    /// Directions of an explicit sort of the result.
    sort: Option<Vec<bool>>,
    /// Duplicates are removed from the final rows.
    dedup: bool,
    limit: Option<u64>,
    big_result: bool,
}

/// Fields of every table the statement reads.
fn used_fields(query: &SelectQuery, table_count: usize) -> Vec<Vec<usize>> {
    let mut used: Vec<Vec<usize>> = vec![vec![]; table_count];
    let mut add = |f: &FieldItem| {
        let fields = &mut used[f.column.table];
        if !fields.contains(&f.column.field) {
            fields.push(f.column.field);
        }
    };
    for item in &query.fields {
        match item {
            SelectItem::Expr { expr, .. } | SelectItem::Agg { arg: Some(expr), .. } => {
                expr.for_each_field(&mut add)
            }
            SelectItem::Agg { arg: None, .. } => {}
        }
    }
    query.group_by.iter().for_each(|e| e.for_each_field(&mut add));
    query.order_by.iter().for_each(|o| o.expr.for_each_field(&mut add));
    if let Some(cond) = &query.conds {
        cond.for_each_field(&mut add);
    }
    let mut clauses = query.from.iter().collect::<Vec<_>>();
    while let Some(clause) = clauses.pop() {
        if let Some(on) = &clause.on {
            on.for_each_field(&mut add);
        }
        if let JoinOperand::Nest(members) = &clause.operand {
            clauses.extend(members);
        }
    }
    used
}

fn directions(order: &[OrderItem]) -> Vec<bool> {
    order.iter().map(|o| o.asc).collect()
}

fn sort_exprs(order: &[OrderItem]) -> Vec<Expr> {
    order.iter().map(|o| o.expr.clone()).collect()
}

/// Optimizes the statement and picks how its rows are grouped, deduplicated and ordered.
fn plan_select(
    query: SelectQuery,
    handlers: &mut [Box<dyn TableHandler>],
    ctx: &StatementContext,
) -> JoinResult<SelectPlan> {
    let table_count = handlers.len();
    let defs = handlers.iter().map(|h| h.def().clone()).collect::<Vec<_>>();
    let stats = handlers.iter().map(|h| h.stats()).collect::<Vec<TableStats>>();
    let used = used_fields(&query, table_count);
    let SelectQuery {
        from,
        conds,
        fields,
        group_by,
        order_by,
        distinct,
        limit,
        big_result,
    } = query;

    let mut tree = JoinTree::new(from, table_count)?;
    let conds = tree.prepare(conds)?;
    let mut equalities = EqualityContext::new();
    let (conds, where_frame) = match conds {
        Some(cond) => {
            let (cond, frame) = equalities.build_equal_items(&defs, cond, None);
            (Some(cond), frame)
        }
        None => (None, None),
    };
    tree.build_equal_items(&mut equalities, &defs, where_frame);

    let mut join = match conds.map(|c| remove_eq_conds(c, tree.outer_join_tables())) {
        Some(CondResult::False) => {
            log::debug!("impossible WHERE");
            JoinPlan::impossible(
                KeyUseCatalog::default(),
                ConstTables::new(table_count),
                table_count,
            )
        }
        folded => make_join_plan(
            &tree,
            &equalities,
            folded.and_then(CondResult::into_option),
            &defs,
            &stats,
            handlers,
            ctx.settings(),
        )?,
    };

    let const_map = join.consts.map;
    let not_const = |e: &Expr| !e.used_tables().is_subset_of(const_map);
    let order = if order_by.is_empty() {
        // GROUP BY returns its groups in order.
        group_by.iter().cloned().map(OrderItem::asc).collect::<Vec<_>>()
    } else {
        order_by
    };
    let order = order
        .into_iter()
        .filter(|o| not_const(&o.expr))
        .collect::<Vec<_>>();

    let first_table = join.slots.first().map(|s| s.table);
    let covering_keys = first_table.map_or(KeyMap::EMPTY, |t| defs[t].covering_keys(&used[t]));
    let on_first_table = |items: &[OrderItem]| {
        first_table.map_or(false, |t| {
            order_tables(items).is_subset_of(TableMap::of(t) | const_map)
        })
    };
    let env = SortElisionEnv {
        defs: &defs,
        stats: &stats,
        settings: ctx.settings(),
    };

    let mut sort = None;
    let mut dedup = false;
    let implicit_group = group_by.is_empty() && fields.iter().any(SelectItem::is_agg);
    let sink = if implicit_group {
        SinkPlan::Group {
            items: fields,
            group_by: vec![],
            sort_key: vec![],
        }
    } else if !group_by.is_empty() {
        dedup = distinct;
        let group_order = group_by
            .iter()
            .filter(|e| not_const(e))
            .cloned()
            .map(OrderItem::asc)
            .collect::<Vec<_>>();
        let index_ordered = group_order.is_empty()
            || join.slots.is_empty()
            || (on_first_table(&group_order)
                && test_if_skip_sort_order(
                    &mut join,
                    &group_order,
                    None,
                    true,
                    covering_keys,
                    &env,
                )?);
        if index_ordered {
            log::debug!("grouping rows in index order");
            let in_group_order = order.len() <= group_order.len()
                && order
                    .iter()
                    .zip(&group_order)
                    .all(|(o, g)| o.asc && o.expr.same_as(&g.expr));
            let sort_key = if in_group_order {
                vec![]
            } else {
                sort = Some(directions(&order));
                sort_exprs(&order)
            };
            SinkPlan::Group {
                items: fields,
                group_by,
                sort_key,
            }
        } else {
            let layout = TmpTableLayout::build(&fields, &group_by, &order, false, ctx.settings());
            if !order.is_empty() {
                sort = Some(layout.order_keys.iter().map(|(_, asc)| *asc).collect());
            }
            SinkPlan::GroupUpdate { layout }
        }
    } else if distinct {
        let layout = TmpTableLayout::build(&fields, &[], &order, true, ctx.settings());
        if !order.is_empty() {
            sort = Some(layout.order_keys.iter().map(|(_, asc)| *asc).collect());
        }
        SinkPlan::Distinct {
            layout,
            limit: if sort.is_none() { limit } else { None },
        }
    } else {
        let index_ordered = order.is_empty()
            || join.slots.is_empty()
            || (on_first_table(&order)
                && test_if_skip_sort_order(&mut join, &order, limit, false, covering_keys, &env)?);
        let sort_key = if index_ordered {
            vec![]
        } else {
            sort = Some(directions(&order));
            sort_exprs(&order)
        };
        SinkPlan::Send {
            fields: fields.iter().filter_map(SelectItem::as_expr).cloned().collect(),
            sort_key,
        }
    };
    log::debug!(
        "result through {:?} sink, {}",
        sink,
        if sort.is_some() { "sorted" } else { "unsorted" }
    );

    Ok(SelectPlan {
        defs,
        join,
        sink,
        sort,
        dedup,
        limit,
        big_result,
    })
}

/// Runs a SELECT statement, sending its rows to `result`.
///
/// `handlers` hold one table each, in the numbering the query refers to. On success `result`
/// is finished, on failure it is aborted.
pub fn execute_select(
    query: SelectQuery,
    handlers: &mut [Box<dyn TableHandler>],
    ctx: &StatementContext,
    result: &mut dyn ResultSink,
) -> JoinResult<ExecSummary> {
    match run_select(query, handlers, ctx, result) {
        Ok(summary) => {
            result.finish().map_err(JoinError::Sink)?;
            log::info!(
                "statement {:?}: {} rows sent, {} rows examined",
                summary.status,
                summary.rows_sent,
                summary.examined_rows
            );
            Ok(summary)
        }
        Err(e) => {
            log::info!("statement failed: {}", e);
            result.abort();
            Err(e)
        }
    }
}

fn run_select(
    query: SelectQuery,
    handlers: &mut [Box<dyn TableHandler>],
    ctx: &StatementContext,
    result: &mut dyn ResultSink,
) -> JoinResult<ExecSummary> {
    let mut select = plan_select(query, handlers, ctx)?;
    let mut sink = select.sink.create(ctx.settings(), select.big_result)?;
    let mut out = Output::new(result, select.limit);
    if let Some(directions) = select.sort.take() {
        out = out.with_sort(directions);
    }
    if select.dedup {
        out = out.with_dedup();
    }

    let (status, examined_rows) = if select.join.impossible_where {
        (ExecStatus::ImpossibleWhere, 0)
    } else {
        let mut executor = JoinExecutor::new(&mut select.join, handlers, ctx);
        let status = match executor.run(&mut sink, &mut out)? {
            SinkStatus::LimitReached => ExecStatus::LimitReached,
            SinkStatus::Continue => ExecStatus::Completed,
        };
        (status, executor.examined_rows())
    };
    sink.end_of_records(&mut out)?;
    out.flush()?;

    let status = match status {
        ExecStatus::Completed if out.limit_reached() => ExecStatus::LimitReached,
        status => status,
    };
    Ok(ExecSummary {
        status,
        rows_sent: out.rows_sent(),
        examined_rows,
        filesort_used: out.filesort_used(),
        tmp_table: sink.tmp_table().map(|tmp| TmpTableSummary {
            rows: tmp.len(),
            on_disk: tmp.is_on_disk(),
        }),
    })
}

/// Plans a SELECT statement without running it and renders the plan as an EXPLAIN table.
pub fn explain_select(
    query: SelectQuery,
    handlers: &mut [Box<dyn TableHandler>],
    ctx: &StatementContext,
) -> JoinResult<prettytable::Table> {
    let select = plan_select(query, handlers, ctx)?;
    let mut notes = vec![];
    if select.sink.uses_tmp_table() {
        notes.push("Using temporary");
    }
    if select.sort.is_some() {
        notes.push("Using filesort");
    }
    Ok(explain_plan(&select.join, &select.defs, &notes))
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::join_nest::JoinClause;
    use crate::order::OrderItem;
    use crate::predicate::test_util::{field, int};
    use crate::predicate::Predicate;
    use crate::select::{AggFunc, SelectBuilder, SelectItem};

    #[test]
    fn test_aggregates_skip_nulls() {
        let values = [Some(4), None, Some(-2), Some(9)].map(ScalarValue::Int64);
        let mut results = vec![];
        for func in [AggFunc::Count, AggFunc::Sum, AggFunc::Min, AggFunc::Max] {
            let data_type = func.result_type(Some(&DataType::Int64));
            let mut acc = func.init(Some(&values[0]), &data_type);
            for v in &values[1..] {
                func.update(&mut acc, Some(v));
            }
            results.push(acc);
        }
        assert_eq!(
            vec![
                ScalarValue::Int64(Some(3)),
                ScalarValue::Int64(Some(11)),
                ScalarValue::Int64(Some(-2)),
                ScalarValue::Int64(Some(9)),
            ],
            results
        );

        let mut count_star = AggFunc::Count.init(None, &DataType::Int64);
        AggFunc::Count.update(&mut count_star, None);
        assert_eq!(ScalarValue::Int64(Some(2)), count_star);
    }

    #[test]
    fn test_sum_starts_at_first_non_null() {
        let mut acc = AggFunc::Sum.init(Some(&ScalarValue::Float32(None)), &DataType::Float64);
        assert!(acc.is_null());
        AggFunc::Sum.update(&mut acc, Some(&ScalarValue::Float32(Some(1.5))));
        AggFunc::Sum.update(&mut acc, Some(&ScalarValue::Float32(Some(2.0))));
        assert_eq!(ScalarValue::Float64(Some(3.5)), acc);
        assert_eq!(
            DataType::Float64,
            AggFunc::Sum.result_type(Some(&DataType::Float32))
        );
    }

    #[test]
    fn test_builder() {
        let query = SelectBuilder::new(vec![JoinClause::table(0)])
            .filter(Predicate::eq(field(0, 0, "a", false), int(1)))
            .project(vec![
                SelectItem::expr(field(0, 1, "b", true)),
                SelectItem::agg(AggFunc::Max, field(0, 2, "c", true)).named("m"),
            ])
            .order_by(vec![OrderItem::desc(field(0, 1, "b", true))])
            .distinct()
            .limit(10)
            .build();
        assert_eq!(
            vec!["t0.b", "m"],
            query.fields.iter().map(|f| f.name()).collect::<Vec<_>>()
        );
        assert_eq!("MAX(t0.c)", SelectItem::agg(AggFunc::Max, field(0, 2, "c", true)).name());
        assert!(query.distinct);
        assert_eq!(Some(10), query.limit);
        assert!(query.conds.is_some());
    }
}
