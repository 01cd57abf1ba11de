//! Per-statement context handed down the optimizer and executor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

lazy_static! {
    /// Bytes currently held by row caches of all running statements.
    static ref JOIN_BUFFER_USAGE: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
}

/// Session variables consulted by the optimizer and executor.
#[derive(Clone, Debug)]
pub struct OptimizerSettings {
    /// Row budget of an in-memory temporary table, in bytes.
    pub max_heap_table_size: usize,
    /// Upper bound of a per-table row cache, in bytes.
    pub join_buffer_size: usize,
    /// Depth of the exhaustive part of the plan search. `0` picks a value from the table count.
    pub optimizer_search_depth: usize,
    /// Always put temporary tables on disk.
    pub big_tables: bool,
    /// Longest key a temporary table index may have before falling back to a hash constraint.
    pub max_key_length: usize,
    /// Join tables in the order they appear in the query.
    pub straight_join: bool,
    pub io_block_size: usize,
    /// Directory of disk temporary tables.
    pub tmpdir: PathBuf,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_heap_table_size: 16 * 1024 * 1024,
            join_buffer_size: 128 * 1024,
            optimizer_search_depth: 62,
            big_tables: false,
            max_key_length: 1000,
            straight_join: false,
            io_block_size: 4096,
            tmpdir: std::env::temp_dir(),
        }
    }
}

/// Cooperative cancellation flag, polled by the executor.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to a join buffer byte counter, by default the process wide one.
#[derive(Clone, Debug)]
pub struct JoinBufferCounter(Arc<AtomicUsize>);

impl JoinBufferCounter {
    pub fn global() -> Self {
        Self(JOIN_BUFFER_USAGE.clone())
    }

    /// A counter not shared with other statements.
    pub fn isolated() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    pub fn in_use(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Charges `bytes` to the counter until the returned reservation is dropped.
    pub fn reserve(&self, bytes: usize) -> JoinBufferReservation {
        self.0.fetch_add(bytes, Ordering::SeqCst);
        JoinBufferReservation {
            counter: self.0.clone(),
            bytes,
        }
    }
}

impl Default for JoinBufferCounter {
    fn default() -> Self {
        Self::global()
    }
}

#[derive(Debug)]
pub struct JoinBufferReservation {
    counter: Arc<AtomicUsize>,
    bytes: usize,
}

impl JoinBufferReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn grow(&mut self, bytes: usize) {
        self.counter.fetch_add(bytes, Ordering::SeqCst);
        self.bytes += bytes;
    }
}

impl Drop for JoinBufferReservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Everything a statement needs from its session.
#[derive(Clone, Debug, Default)]
pub struct StatementContext {
    settings: OptimizerSettings,
    cancellation: CancellationToken,
    join_buffers: JoinBufferCounter,
}

impl StatementContext {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_join_buffers(mut self, counter: JoinBufferCounter) -> Self {
        self.join_buffers = counter;
        self
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn join_buffers(&self) -> &JoinBufferCounter {
        &self.join_buffers
    }

    pub fn is_killed(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{CancellationToken, JoinBufferCounter};

    #[test]
    fn test_reservation_released_on_drop() {
        let counter = JoinBufferCounter::isolated();
        {
            let mut reservation = counter.reserve(100);
            reservation.grow(28);
            assert_eq!(128, counter.in_use());
        }
        assert_eq!(0, counter.in_use());
    }

    #[test]
    fn test_cancellation_is_shared() {
        let token = CancellationToken::default();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
