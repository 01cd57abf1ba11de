//! End of the join pipeline: what happens to every joined row.

use std::collections::HashSet;

use enum_dispatch::enum_dispatch;

use crate::error::{JoinError, JoinResult};
use crate::predicate::{Expr, RowSource};
use crate::select::SelectItem;
use crate::storage::Row;
use crate::tmp_table::TmpTable;
use crate::value::{group_eq, null_of, sort_cmp};

/// Receiver of the result rows of a statement.
pub trait ResultSink {
    fn send_row(&mut self, row: Row) -> anyhow::Result<()>;

    /// All rows were sent.
    fn finish(&mut self) -> anyhow::Result<()>;

    /// The statement failed, rows sent so far are not a complete result.
    fn abort(&mut self);
}

/// Result sink keeping everything in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub rows: Vec<Row>,
    pub finished: bool,
    pub aborted: bool,
}

impl ResultSink for CollectingSink {
    fn send_row(&mut self, row: Row) -> anyhow::Result<()> {
        self.rows.push(row);
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    Continue,
    /// Enough rows were produced, the join can stop.
    LimitReached,
}

/// Final stage of the result: sorting, LIMIT and delivery to the [`ResultSink`].
pub struct Output<'a> {
    result: &'a mut dyn ResultSink,
    limit: Option<u64>,
    /// Directions of the sort key, rows are spooled and sorted on flush.
    sort: Option<Vec<bool>>,
    spool: Vec<(Row, Row)>,
    /// Rows already sent, when duplicates must be removed here.
    seen: Option<HashSet<Row>>,
    rows_sent: u64,
    limit_reached: bool,
}

impl<'a> Output<'a> {
    pub fn new(result: &'a mut dyn ResultSink, limit: Option<u64>) -> Self {
        Self {
            result,
            limit,
            sort: None,
            spool: vec![],
            seen: None,
            rows_sent: 0,
            limit_reached: false,
        }
    }

    /// Sorts the rows by their sort key before sending them.
    pub fn with_sort(mut self, directions: Vec<bool>) -> Self {
        self.sort = Some(directions);
        self
    }

    /// Sends every distinct row once.
    pub fn with_dedup(mut self) -> Self {
        self.seen = Some(HashSet::new());
        self
    }

    pub fn rows_sent(&self) -> u64 {
        self.rows_sent
    }

    pub fn filesort_used(&self) -> bool {
        self.sort.is_some()
    }

    /// Rows were held back because of LIMIT.
    pub fn limit_reached(&self) -> bool {
        self.limit_reached
    }

    pub fn is_full(&self) -> bool {
        self.limit.map_or(false, |l| self.rows_sent >= l)
    }

    pub fn emit(&mut self, row: Row, sort_key: Row) -> JoinResult<SinkStatus> {
        if let Some(seen) = &mut self.seen {
            if !seen.insert(row.clone()) {
                return Ok(SinkStatus::Continue);
            }
        }
        if self.sort.is_some() {
            self.spool.try_reserve(1)?;
            self.spool.push((sort_key, row));
            return Ok(SinkStatus::Continue);
        }
        self.send(row)
    }

    fn send(&mut self, row: Row) -> JoinResult<SinkStatus> {
        if self.is_full() {
            self.limit_reached = true;
            return Ok(SinkStatus::LimitReached);
        }
        self.result.send_row(row).map_err(JoinError::Sink)?;
        self.rows_sent += 1;
        if self.is_full() {
            self.limit_reached = true;
            return Ok(SinkStatus::LimitReached);
        }
        Ok(SinkStatus::Continue)
    }

    /// Sends the spooled rows in sort order.
    pub fn flush(&mut self) -> JoinResult<()> {
        let Some(directions) = &self.sort else {
            return Ok(());
        };
        let mut spool = std::mem::take(&mut self.spool);
        spool.sort_by(|(a, _), (b, _)| {
            a.iter()
                .zip(b)
                .zip(directions)
                .map(|((x, y), asc)| {
                    let ord = sort_cmp(x, y);
                    if *asc {
                        ord
                    } else {
                        ord.reverse()
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        log::debug!("sorted {} rows", spool.len());
        let total = spool.len() as u64;
        for (_, row) in spool {
            if self.send(row)? == SinkStatus::LimitReached {
                break;
            }
        }
        self.limit_reached = self.limit.map_or(false, |l| total > l);
        Ok(())
    }
}

/// Consumer of joined rows.
#[enum_dispatch]
pub enum JoinSink {
    SendSink,
    GroupSink,
    DistinctSink,
    GroupUpdateSink,
}

#[enum_dispatch(JoinSink)]
pub trait RowSink {
    /// Takes the current joined row.
    fn send_row(&mut self, src: &dyn RowSource, out: &mut Output<'_>)
        -> JoinResult<SinkStatus>;

    /// The join produced all its rows.
    fn end_of_records(&mut self, out: &mut Output<'_>) -> JoinResult<()>;

    /// The temporary table rows went through.
    fn tmp_table(&self) -> Option<&TmpTable> {
        None
    }
}

fn eval_all(exprs: &[Expr], src: &dyn RowSource) -> Row {
    exprs.iter().map(|e| e.eval(src).clone()).collect()
}

/// Sends every joined row to the output.
#[derive(Debug)]
pub struct SendSink {
    pub fields: Vec<Expr>,
    pub sort_key: Vec<Expr>,
}

impl RowSink for SendSink {
    fn send_row(
        &mut self,
        src: &dyn RowSource,
        out: &mut Output<'_>,
    ) -> JoinResult<SinkStatus> {
        out.emit(eval_all(&self.fields, src), eval_all(&self.sort_key, src))
    }

    fn end_of_records(&mut self, _out: &mut Output<'_>) -> JoinResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Group {
    key: Row,
    values: Row,
    sort_key: Row,
}

/// Aggregates rows arriving in group order, emitting a group when the next one starts.
///
/// Without GROUP BY all rows are one group, which is emitted even when the join had no rows.
#[derive(Debug)]
pub struct GroupSink {
    items: Vec<SelectItem>,
    group_by: Vec<Expr>,
    sort_key: Vec<Expr>,
    current: Option<Group>,
}

impl GroupSink {
    pub fn new(items: Vec<SelectItem>, group_by: Vec<Expr>, sort_key: Vec<Expr>) -> Self {
        Self {
            items,
            group_by,
            sort_key,
            current: None,
        }
    }

    fn start(&self, src: &dyn RowSource, key: Row) -> Group {
        let values = self
            .items
            .iter()
            .map(|item| match item {
                SelectItem::Expr { expr, .. } => expr.eval(src).clone(),
                SelectItem::Agg { func, arg, .. } => func.init(
                    arg.as_ref().map(|a| a.eval(src)),
                    &item.data_type(),
                ),
            })
            .collect();
        Group {
            key,
            values,
            sort_key: eval_all(&self.sort_key, src),
        }
    }

    fn update(&mut self, src: &dyn RowSource) {
        let Some(group) = &mut self.current else {
            return;
        };
        for (item, value) in self.items.iter().zip(group.values.iter_mut()) {
            if let SelectItem::Agg { func, arg, .. } = item {
                func.update(value, arg.as_ref().map(|a| a.eval(src)));
            }
        }
    }
}

impl RowSink for GroupSink {
    fn send_row(
        &mut self,
        src: &dyn RowSource,
        out: &mut Output<'_>,
    ) -> JoinResult<SinkStatus> {
        let key = eval_all(&self.group_by, src);
        if let Some(group) = &self.current {
            if group.key.iter().zip(&key).all(|(a, b)| group_eq(a, b)) {
                self.update(src);
                return Ok(SinkStatus::Continue);
            }
        }
        let next = self.start(src, key);
        match self.current.replace(next) {
            Some(done) => out.emit(done.values, done.sort_key),
            None => Ok(SinkStatus::Continue),
        }
    }

    fn end_of_records(&mut self, out: &mut Output<'_>) -> JoinResult<()> {
        match self.current.take() {
            Some(done) => {
                out.emit(done.values, done.sort_key)?;
            }
            None if self.group_by.is_empty() => {
                let values = self
                    .items
                    .iter()
                    .map(|item| match item {
                        SelectItem::Agg { func, .. } => func.empty(&item.data_type()),
                        SelectItem::Expr { .. } => null_of(&item.data_type()),
                    })
                    .collect();
                let sort_key = vec![crate::predicate::NULL_VALUE.clone(); self.sort_key.len()];
                out.emit(values, sort_key)?;
            }
            None => {}
        }
        Ok(())
    }
}

/// Removes duplicate rows through the unique key of a temporary table.
#[derive(Debug)]
pub struct DistinctSink {
    pub tmp: TmpTable,
    /// Rows are needed only up to LIMIT, there is no ORDER BY.
    pub limit: Option<u64>,
}

impl RowSink for DistinctSink {
    fn send_row(
        &mut self,
        src: &dyn RowSource,
        _out: &mut Output<'_>,
    ) -> JoinResult<SinkStatus> {
        let row = self.tmp.layout().init_row(src);
        self.tmp.write_row(row)?;
        match self.limit {
            Some(limit) if self.tmp.len() as u64 >= limit => Ok(SinkStatus::LimitReached),
            _ => Ok(SinkStatus::Continue),
        }
    }

    fn end_of_records(&mut self, out: &mut Output<'_>) -> JoinResult<()> {
        send_tmp_rows(&mut self.tmp, out)
    }

    fn tmp_table(&self) -> Option<&TmpTable> {
        Some(&self.tmp)
    }
}

/// Groups rows arriving in any order inside a temporary table keyed by the GROUP BY fields.
#[derive(Debug)]
pub struct GroupUpdateSink {
    pub tmp: TmpTable,
}

impl RowSink for GroupUpdateSink {
    fn send_row(
        &mut self,
        src: &dyn RowSource,
        _out: &mut Output<'_>,
    ) -> JoinResult<SinkStatus> {
        self.tmp.update_group(src)?;
        Ok(SinkStatus::Continue)
    }

    fn end_of_records(&mut self, out: &mut Output<'_>) -> JoinResult<()> {
        send_tmp_rows(&mut self.tmp, out)
    }

    fn tmp_table(&self) -> Option<&TmpTable> {
        Some(&self.tmp)
    }
}

fn send_tmp_rows(tmp: &mut TmpTable, out: &mut Output<'_>) -> JoinResult<()> {
    for row in tmp.rows()? {
        let layout = tmp.layout();
        if out.emit(layout.finish(&row), layout.sort_key(&row))? == SinkStatus::LimitReached {
            break;
        }
    }
    Ok(())
}
