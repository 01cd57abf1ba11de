//! Row readers of the join slots, one per access method.

use crate::access::{Access, RangeScan};
use crate::context::{JoinBufferReservation, StatementContext};
use crate::error::{JoinError, JoinResult};
use crate::plan::JoinTab;
use crate::predicate::RowSource;
use crate::storage::{KeyMatch, Row, ScanOrder, TableHandler};

/// Rows of a full scan kept between rescans of the same slot.
#[derive(Debug)]
struct RowCache {
    rows: Vec<Row>,
    /// The last scan ran to the end, `rows` is the whole table.
    complete: bool,
    reservation: JoinBufferReservation,
}

#[derive(Debug, Default)]
enum ReadState {
    #[default]
    Idle,
    Ref {
        key: Vec<u8>,
        order: ScanOrder,
    },
    RefOrNull {
        key: Vec<u8>,
        null_key: Option<Vec<u8>>,
    },
    Range {
        range: usize,
    },
    Index {
        order: ScanOrder,
    },
    Scan,
    Cached {
        pos: usize,
    },
    Done,
}

/// Cursor state of one join slot.
#[derive(Debug, Default)]
pub(crate) struct SlotReader {
    state: ReadState,
    /// Result of a unique lookup, reused while the key stays the same.
    last_lookup: Option<(Vec<u8>, Option<Row>)>,
    cache: Option<RowCache>,
    /// The table outgrew `join_buffer_size`, rows are read from the handler.
    cache_disabled: bool,
}

fn check_killed(ctx: &StatementContext) -> JoinResult<()> {
    if ctx.is_killed() {
        return Err(JoinError::Cancelled);
    }
    Ok(())
}

impl SlotReader {
    /// Positions on the first row of `tab` for the current rows of the preceding slots.
    pub(crate) fn read_first(
        &mut self,
        tab: &mut JoinTab,
        handler: &mut dyn TableHandler,
        src: &dyn RowSource,
        ctx: &StatementContext,
    ) -> JoinResult<Option<Row>> {
        check_killed(ctx)?;
        self.state = ReadState::Done;
        match &mut tab.access {
            Access::Const(descriptor) => {
                if let Some((_, row)) = &self.last_lookup {
                    return Ok(row.clone());
                }
                let row = if descriptor.copy_key(src)? {
                    handler.index_read(descriptor.key, &descriptor.key_buff, KeyMatch::Exact)?
                } else {
                    None
                };
                self.last_lookup = Some((descriptor.key_buff.clone(), row.clone()));
                Ok(row)
            }
            Access::EqRef(descriptor) => {
                if !descriptor.copy_key(src)? {
                    return Ok(None);
                }
                if let Some((key, row)) = &self.last_lookup {
                    if *key == descriptor.key_buff {
                        return Ok(row.clone());
                    }
                }
                let row =
                    handler.index_read(descriptor.key, &descriptor.key_buff, KeyMatch::Exact)?;
                self.last_lookup = Some((descriptor.key_buff.clone(), row.clone()));
                Ok(row)
            }
            Access::Ref(descriptor) => {
                if !descriptor.copy_key(src)? {
                    return Ok(None);
                }
                let mode = match descriptor.order {
                    ScanOrder::Forward => KeyMatch::Exact,
                    ScanOrder::Backward => KeyMatch::PrefixLast,
                };
                let row = handler.index_read(descriptor.key, &descriptor.key_buff, mode)?;
                self.state = ReadState::Ref {
                    key: descriptor.key_buff.clone(),
                    order: descriptor.order,
                };
                Ok(row)
            }
            Access::RefOrNull(descriptor) => {
                if !descriptor.copy_key(src)? {
                    return Ok(None);
                }
                let key = descriptor.key_buff.clone();
                let null_key = descriptor.null_key().filter(|n| *n != key);
                let row = handler.index_read(descriptor.key, &key, KeyMatch::Exact)?;
                self.state = ReadState::RefOrNull { key, null_key };
                match row {
                    Some(row) => Ok(Some(row)),
                    None => self.next_null_key(descriptor.key, handler),
                }
            }
            Access::Range(scan) => {
                self.state = ReadState::Range { range: 0 };
                self.position_range(scan, handler)
            }
            Access::Index { key, order } => {
                self.state = ReadState::Index { order: *order };
                Ok(handler.index_first(*key, *order)?)
            }
            Access::All => {
                if let Some(cache) = &self.cache {
                    if cache.complete {
                        self.state = ReadState::Cached { pos: 0 };
                        return Ok(cache.rows.first().cloned());
                    }
                }
                self.state = ReadState::Scan;
                if tab.use_row_cache && !self.cache_disabled {
                    let reservation = ctx.join_buffers().reserve(0);
                    self.cache = Some(RowCache {
                        rows: vec![],
                        complete: false,
                        reservation,
                    });
                }
                let row = handler.scan_first()?;
                self.remember(row, tab, handler, ctx)
            }
        }
    }

    /// Next row of `tab` for the same rows of the preceding slots.
    pub(crate) fn read_next(
        &mut self,
        tab: &mut JoinTab,
        handler: &mut dyn TableHandler,
        ctx: &StatementContext,
    ) -> JoinResult<Option<Row>> {
        check_killed(ctx)?;
        match &mut self.state {
            ReadState::Idle | ReadState::Done => Ok(None),
            ReadState::Ref { key, order } => Ok(match order {
                ScanOrder::Forward => handler.index_next_same(key)?,
                ScanOrder::Backward => handler.index_prev_same(key)?,
            }),
            ReadState::RefOrNull { key, .. } => {
                if let Some(row) = handler.index_next_same(key)? {
                    return Ok(Some(row));
                }
                let index = tab.access.key().unwrap_or_default();
                self.next_null_key(index, handler)
            }
            ReadState::Range { .. } => {
                let Access::Range(scan) = &tab.access else {
                    return Ok(None);
                };
                let row = match scan.order {
                    ScanOrder::Forward => handler.index_next()?,
                    ScanOrder::Backward => handler.index_prev()?,
                };
                self.check_range(row, scan, handler)
            }
            ReadState::Index { order } => Ok(match order {
                ScanOrder::Forward => handler.index_next()?,
                ScanOrder::Backward => handler.index_prev()?,
            }),
            ReadState::Scan => {
                let row = handler.scan_next()?;
                self.remember(row, tab, handler, ctx)
            }
            ReadState::Cached { pos } => {
                *pos += 1;
                let pos = *pos;
                Ok(self
                    .cache
                    .as_ref()
                    .and_then(|cache| cache.rows.get(pos).cloned()))
            }
        }
    }

    /// Switches a ref-or-null read over to the NULL key, once.
    fn next_null_key(
        &mut self,
        index: usize,
        handler: &mut dyn TableHandler,
    ) -> JoinResult<Option<Row>> {
        let ReadState::RefOrNull { key, null_key } = &mut self.state else {
            return Ok(None);
        };
        let Some(null_key) = null_key.take() else {
            self.state = ReadState::Done;
            return Ok(None);
        };
        let row = handler.index_read(index, &null_key, KeyMatch::Exact)?;
        *key = null_key;
        Ok(row)
    }

    /// Positions on the first row of the current range, moving on to later ranges while
    /// a range has no rows.
    fn position_range(
        &mut self,
        scan: &RangeScan,
        handler: &mut dyn TableHandler,
    ) -> JoinResult<Option<Row>> {
        let ReadState::Range { range } = self.state else {
            return Ok(None);
        };
        let Some(current) = range_at(scan, range) else {
            self.state = ReadState::Done;
            return Ok(None);
        };
        let row = match (scan.order, &current.low, &current.high) {
            (ScanOrder::Forward, Some(low), _) => {
                handler.index_read(scan.key, &low.image, KeyMatch::KeyOrNext)?
            }
            (ScanOrder::Backward, _, Some(high)) => {
                handler.index_read(scan.key, &high.image, KeyMatch::KeyOrPrev)?
            }
            (order, _, _) => handler.index_first(scan.key, order)?,
        };
        self.check_range(row, scan, handler)
    }

    /// Filters `row` against the current range: rows before the range start are skipped, a row
    /// past its end moves the scan to the next range.
    fn check_range(
        &mut self,
        mut row: Option<Row>,
        scan: &RangeScan,
        handler: &mut dyn TableHandler,
    ) -> JoinResult<Option<Row>> {
        loop {
            let ReadState::Range { range } = self.state else {
                return Ok(None);
            };
            let Some(current) = range_at(scan, range) else {
                self.state = ReadState::Done;
                return Ok(None);
            };
            if row.is_none() {
                self.state = ReadState::Range { range: range + 1 };
                return self.position_range(scan, handler);
            }
            let key = handler.current_key()?;
            let prefix = &key[..scan.prefix_length.min(key.len())];
            let (inside, not_yet) = match scan.order {
                ScanOrder::Forward => (current.below_high(prefix), !current.above_low(prefix)),
                ScanOrder::Backward => (current.above_low(prefix), !current.below_high(prefix)),
            };
            if !inside {
                self.state = ReadState::Range { range: range + 1 };
                return self.position_range(scan, handler);
            }
            if !not_yet {
                return Ok(row);
            }
            row = match scan.order {
                ScanOrder::Forward => handler.index_next()?,
                ScanOrder::Backward => handler.index_prev()?,
            };
        }
    }

    /// Adds a scanned row to the row cache, dropping the cache once it outgrows its budget.
    fn remember(
        &mut self,
        row: Option<Row>,
        tab: &JoinTab,
        handler: &dyn TableHandler,
        ctx: &StatementContext,
    ) -> JoinResult<Option<Row>> {
        let Some(cache) = &mut self.cache else {
            return Ok(row);
        };
        match &row {
            Some(r) => {
                let reclength = handler.def().reclength();
                if cache.reservation.bytes() + reclength > ctx.settings().join_buffer_size {
                    log::debug!(
                        "row cache of table {} exceeds join_buffer_size, rescanning",
                        handler.def().name
                    );
                    self.cache = None;
                    self.cache_disabled = true;
                    return Ok(row);
                }
                cache.rows.try_reserve(1)?;
                cache.rows.push(r.clone());
                cache.reservation.grow(reclength);
            }
            None => {
                cache.complete = true;
                log::trace!(
                    "cached {} rows of slot for table {}",
                    cache.rows.len(),
                    tab.table
                );
            }
        }
        Ok(row)
    }
}

/// Range number `n` in reading order.
fn range_at(scan: &RangeScan, n: usize) -> Option<&crate::access::KeyRange> {
    match scan.order {
        ScanOrder::Forward => scan.ranges.get(n),
        ScanOrder::Backward => scan
            .ranges
            .len()
            .checked_sub(n + 1)
            .and_then(|i| scan.ranges.get(i)),
    }
}
