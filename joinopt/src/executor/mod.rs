//! Nested-loop join executor.
//!
//! The executor walks the slots of a [`JoinPlan`] as an explicit state machine instead of
//! recursing per slot. Every slot has a [`SlotReader`] holding its cursor; the row of every
//! table lives in [`JoinRows`], which the pushed down conditions are evaluated against.
//!
//! Outer joins follow the match flag protocol: the first inner slot of an outer join owns a
//! `found` flag, cleared whenever the join is restarted for a new outer row and set once the
//! last inner slot produced a row satisfying every activated condition. An exhausted first inner
//! slot without a match produces one NULL complemented row instead.

use datafusion_common::ScalarValue;

use crate::catalog::ColumnRef;
use crate::context::StatementContext;
use crate::error::{JoinError, JoinResult};
use crate::plan::{JoinPlan, JoinTab};
use crate::predicate::{Guard, RowSource, NULL_VALUE};
use crate::storage::{Row, TableHandler};
use crate::value::null_of;

mod read;
mod sink;

pub use sink::*;

use read::SlotReader;

/// Current rows of all tables of the join, with the outer join flags of the slots.
#[derive(Debug)]
pub struct JoinRows {
    /// By table number, `None` for a NULL complemented table or one not read yet.
    rows: Vec<Option<Row>>,
    /// By table number, the typed NULLs read in place of a missing row.
    null_rows: Vec<Row>,
    /// By slot.
    found: Vec<bool>,
    not_null_compl: Vec<bool>,
}

impl JoinRows {
    fn new(plan: &JoinPlan, handlers: &[Box<dyn TableHandler>]) -> Self {
        let table_count = plan.table_position.len();
        let rows = (0..table_count)
            .map(|t| plan.consts.row(t).cloned())
            .collect();
        let null_rows = handlers
            .iter()
            .map(|h| h.def().fields.iter().map(|f| null_of(&f.data_type)).collect())
            .collect();
        Self {
            rows,
            null_rows,
            found: vec![false; plan.slots.len()],
            not_null_compl: vec![true; plan.slots.len()],
        }
    }
}

impl RowSource for JoinRows {
    fn value(&self, column: ColumnRef) -> &ScalarValue {
        let row = match &self.rows[column.table] {
            Some(row) => row,
            None => &self.null_rows[column.table],
        };
        row.get(column.field).unwrap_or(&NULL_VALUE)
    }

    fn guard_open(&self, guard: Guard) -> bool {
        match guard {
            Guard::Found(slot) => self.found[slot],
            Guard::NotNullComplemented(slot) => self.not_null_compl[slot],
        }
    }
}

/// Where control goes once the slots from some position on are exhausted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Caller {
    Top,
    /// A row of the slot matched, its next row is read.
    Match(usize),
    /// The NULL complemented row of the outer join starting at the slot was joined, the outer
    /// join is done for the current outer row.
    NullComplemented(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LoopState {
    ReadFirst(usize),
    ReadNext(usize),
    /// Joins the current partial row with the slots from the argument on. Past the last slot
    /// the row goes to the sink.
    Advance(usize),
    NullComplete(usize),
    /// The slot has no further rows for the current rows of the slots before it.
    Backtrack(usize),
    Done(SinkStatus),
}

pub struct JoinExecutor<'a> {
    slots: &'a mut [JoinTab],
    handlers: &'a mut [Box<dyn TableHandler>],
    ctx: &'a StatementContext,
    readers: Vec<SlotReader>,
    joined: JoinRows,
    /// Set on the last inner slot of an outer join: first inner slot of the innermost outer
    /// join still waiting for a match.
    first_unmatched: Vec<Option<usize>>,
    caller: Vec<Caller>,
    /// Lowest slot whose current row is still valid. A condition activated by a match that
    /// rejects the row of an earlier slot moves it back there.
    return_tab: usize,
    examined_rows: u64,
}

impl<'a> JoinExecutor<'a> {
    pub fn new(
        plan: &'a mut JoinPlan,
        handlers: &'a mut [Box<dyn TableHandler>],
        ctx: &'a StatementContext,
    ) -> Self {
        let joined = JoinRows::new(plan, handlers);
        let slot_count = plan.slots.len();
        Self {
            slots: plan.slots.as_mut_slice(),
            handlers,
            ctx,
            readers: (0..slot_count).map(|_| SlotReader::default()).collect(),
            joined,
            first_unmatched: vec![None; slot_count],
            caller: vec![Caller::Top; slot_count + 1],
            return_tab: 0,
            examined_rows: 0,
        }
    }

    /// Rows read from the slots and checked against their conditions.
    pub fn examined_rows(&self) -> u64 {
        self.examined_rows
    }

    /// Runs the join, handing every joined row to `sink`.
    pub fn run<S: RowSink>(
        &mut self,
        sink: &mut S,
        out: &mut Output<'_>,
    ) -> JoinResult<SinkStatus> {
        let slot_count = self.slots.len();
        let mut state = LoopState::Advance(0);
        loop {
            state = match state {
                LoopState::Advance(i) if i == slot_count => {
                    if self.ctx.is_killed() {
                        return Err(JoinError::Cancelled);
                    }
                    match sink.send_row(&self.joined, out)? {
                        SinkStatus::LimitReached => LoopState::Done(SinkStatus::LimitReached),
                        SinkStatus::Continue => LoopState::Backtrack(i),
                    }
                }
                LoopState::Advance(i) => LoopState::ReadFirst(i),
                LoopState::ReadFirst(i) => {
                    self.return_tab = i;
                    if let Some(last) = self.slots[i].last_inner {
                        self.joined.found[i] = false;
                        self.joined.not_null_compl[i] = true;
                        self.first_unmatched[last] = Some(i);
                    }
                    let table = self.slots[i].table;
                    let row = self.readers[i].read_first(
                        &mut self.slots[i],
                        self.handlers[table].as_mut(),
                        &self.joined,
                        self.ctx,
                    )?;
                    self.evaluate(i, row)
                }
                LoopState::ReadNext(i) => {
                    if self.return_tab < i {
                        LoopState::Backtrack(i)
                    } else {
                        let table = self.slots[i].table;
                        let row = self.readers[i].read_next(
                            &mut self.slots[i],
                            self.handlers[table].as_mut(),
                            self.ctx,
                        )?;
                        self.evaluate(i, row)
                    }
                }
                LoopState::NullComplete(i) => self.null_complete(i),
                LoopState::Backtrack(i) => match self.caller[i] {
                    Caller::Top => LoopState::Done(SinkStatus::Continue),
                    Caller::Match(k) => LoopState::ReadNext(k),
                    Caller::NullComplemented(k) => LoopState::Backtrack(k),
                },
                LoopState::Done(status) => return Ok(status),
            };
        }
    }

    fn cond_holds(&self, slot: usize) -> bool {
        self.slots[slot]
            .select_cond
            .as_ref()
            .map_or(true, |cond| cond.is_true(&self.joined))
    }

    /// Nothing more to read from slot `i`.
    fn exhausted(&self, i: usize) -> LoopState {
        if self.slots[i].last_inner.is_some() && !self.joined.found[i] {
            LoopState::NullComplete(i)
        } else {
            LoopState::Backtrack(i)
        }
    }

    /// Checks the row just read from slot `i` and decides where to go next.
    fn evaluate(&mut self, i: usize, row: Option<Row>) -> LoopState {
        let Some(row) = row else {
            return self.exhausted(i);
        };
        self.joined.rows[self.slots[i].table] = Some(row);

        if !self.cond_holds(i) {
            self.examined_rows += 1;
            return LoopState::ReadNext(i);
        }
        let mut found = true;
        while let (Some(first), true) = (self.first_unmatched[i], found) {
            // A match for the outer join starting at `first`: activate the conditions guarded
            // by its flag and check them again.
            self.joined.found[first] = true;
            for tab in first..=i {
                if self.slots[tab].not_exists {
                    return self.exhausted(i);
                }
                if !self.cond_holds(tab) {
                    if tab == i {
                        found = false;
                    } else {
                        self.return_tab = tab;
                        return LoopState::Backtrack(i);
                    }
                }
            }
            self.first_unmatched[i] = self.slots[first]
                .first_upper
                .filter(|upper| self.slots[*upper].last_inner == Some(i));
        }
        self.examined_rows += 1;

        if found {
            self.caller[i + 1] = Caller::Match(i);
            LoopState::Advance(i + 1)
        } else {
            LoopState::ReadNext(i)
        }
    }

    /// Joins the NULL complemented row of the outer join whose first inner slot is `i`.
    fn null_complete(&mut self, i: usize) -> LoopState {
        let last = self.slots[i].last_inner.unwrap_or(i);
        for j in i..=last {
            self.joined.found[j] = true;
            self.joined.not_null_compl[j] = false;
            self.joined.rows[self.slots[j].table] = None;
            if !self.cond_holds(j) {
                return LoopState::Backtrack(i);
            }
        }

        // The NULL complemented row may be the first match of embedding outer joins.
        self.first_unmatched[last] = Some(i);
        while let Some(unmatched) = self.first_unmatched[last] {
            let upper = self.slots[unmatched]
                .first_upper
                .filter(|upper| self.slots[*upper].last_inner == Some(last));
            self.first_unmatched[last] = upper;
            let Some(upper) = upper else {
                break;
            };
            self.joined.found[upper] = true;
            for tab in upper..=last {
                if !self.cond_holds(tab) {
                    self.return_tab = tab;
                    return LoopState::Backtrack(i);
                }
            }
        }

        self.caller[last + 1] = Caller::NullComplemented(i);
        LoopState::Advance(last + 1)
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::access::Access;
    use crate::catalog::{FieldDef, KeyMap, TableDef};
    use crate::context::{CancellationToken, StatementContext};
    use crate::executor::{CollectingSink, JoinExecutor, Output, SendSink, SinkStatus};
    use crate::join_nest::{JoinClause, JoinTree};
    use crate::plan::{Cost, ConstTables, JoinPlan, JoinTab};
    use crate::plan::{add_found_match_trig_cond, make_outerjoin_info};
    use crate::predicate::test_util::field;
    use crate::predicate::{Guard, Predicate};
    use crate::storage::{MemoryTable, TableHandler};

    fn slot(table: usize) -> JoinTab {
        JoinTab {
            table,
            access: Access::All,
            records: 1.0,
            read_time: Cost::default(),
            select_cond: None,
            first_inner: None,
            last_inner: None,
            first_upper: None,
            not_exists: false,
            use_row_cache: false,
            possible_keys: KeyMap::EMPTY,
        }
    }

    fn handler(name: &str, values: &[Option<i64>]) -> Box<dyn TableHandler> {
        let def = TableDef::new(name, vec![FieldDef::new("a", DataType::Int64, true)]);
        let rows = values.iter().map(|v| vec![ScalarValue::Int64(*v)]).collect();
        Box::new(MemoryTable::with_rows(def, rows).unwrap())
    }

    fn plan(slots: Vec<JoinTab>) -> JoinPlan {
        let n = slots.len();
        JoinPlan {
            catalog: Default::default(),
            consts: ConstTables::new(n),
            slots,
            table_position: (0..n).collect(),
            ranges: vec![None; n],
            cost: Cost::default(),
            impossible_where: false,
        }
    }

    fn run(
        plan: &mut JoinPlan,
        handlers: &mut [Box<dyn TableHandler>],
        ctx: &StatementContext,
        limit: Option<u64>,
    ) -> (Vec<Vec<ScalarValue>>, SinkStatus, u64) {
        let n = plan.table_position.len();
        let mut sink = SendSink {
            fields: (0..n).map(|t| field(t, 0, "a", true)).collect(),
            sort_key: vec![],
        };
        let mut result = CollectingSink::default();
        let mut out = Output::new(&mut result, limit);
        let mut executor = JoinExecutor::new(plan, handlers, ctx);
        let status = executor.run(&mut sink, &mut out).unwrap();
        let examined = executor.examined_rows();
        (result.rows, status, examined)
    }

    fn int(v: Option<i64>) -> ScalarValue {
        ScalarValue::Int64(v)
    }

    /// `t0 LEFT JOIN t1 ON t0.a = t1.a WHERE t1.a IS NULL`, the anti join.
    #[test]
    fn test_left_join_null_complement_and_where_guard() {
        let mut tree = JoinTree::new(
            vec![
                JoinClause::table(0),
                JoinClause::table(1).left_join_on(Predicate::eq(
                    field(0, 0, "a", true),
                    field(1, 0, "a", true),
                )),
            ],
            2,
        )
        .unwrap();
        tree.prepare(None).unwrap();
        let mut slots = vec![slot(0), slot(1)];
        make_outerjoin_info(&mut slots, &tree);
        let on = Predicate::guarded(
            Guard::NotNullComplemented(1),
            Predicate::eq(field(0, 0, "a", true), field(1, 0, "a", true)),
        );
        let where_cond = add_found_match_trig_cond(
            &slots,
            Some(1),
            Predicate::IsNull(field(1, 0, "a", true)),
            None,
        );
        slots[1].add_cond(Predicate::and(vec![on, where_cond]));

        let mut plan = plan(slots);
        let mut handlers = vec![
            handler("t0", &[Some(1), Some(2), Some(3)]),
            handler("t1", &[Some(2), Some(2)]),
        ];
        let (rows, status, _) = run(&mut plan, &mut handlers, &StatementContext::default(), None);
        assert_eq!(SinkStatus::Continue, status);
        assert_eq!(
            vec![vec![int(Some(1)), int(None)], vec![int(Some(3)), int(None)]],
            rows
        );
    }

    #[test]
    fn test_limit_stops_the_join() {
        let mut plan = plan(vec![slot(0), slot(1)]);
        let mut handlers = vec![
            handler("t0", &[Some(1), Some(2), Some(3)]),
            handler("t1", &[Some(1), Some(2)]),
        ];
        let (rows, status, examined) =
            run(&mut plan, &mut handlers, &StatementContext::default(), Some(3));
        assert_eq!(SinkStatus::LimitReached, status);
        assert_eq!(3, rows.len());
        assert_eq!(5, examined);
    }

    #[test]
    fn test_inner_join_with_empty_table() {
        let mut plan = plan(vec![slot(0), slot(1)]);
        let mut handlers = vec![handler("t0", &[Some(1)]), handler("t1", &[])];
        let (rows, status, _) = run(&mut plan, &mut handlers, &StatementContext::default(), None);
        assert_eq!(SinkStatus::Continue, status);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_cancelled_statement() {
        let token = CancellationToken::default();
        token.cancel();
        let ctx = StatementContext::default().with_cancellation(token);
        let mut plan = plan(vec![slot(0)]);
        let mut handlers = vec![handler("t0", &[Some(1)])];
        let mut sink = SendSink {
            fields: vec![],
            sort_key: vec![],
        };
        let mut result = CollectingSink::default();
        let mut out = Output::new(&mut result, None);
        let err = JoinExecutor::new(&mut plan, &mut handlers, &ctx)
            .run(&mut sink, &mut out)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
