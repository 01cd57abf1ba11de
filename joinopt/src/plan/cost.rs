//! Cost model of the join search.

use derive_more::{Add, AddAssign, Sub, SubAssign, Sum};

use crate::catalog::TableStats;
use crate::context::OptimizerSettings;

pub const INF: Cost = Cost(f64::INFINITY);

/// Rows compared in the time of one random read.
pub const TIME_FOR_COMPARE: f64 = 5.0;

#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Add, Sub, Sum, AddAssign, SubAssign, Default)]
pub struct Cost(f64);

impl From<f64> for Cost {
    fn from(c: f64) -> Self {
        Cost(c)
    }
}

impl Cost {
    pub fn value(&self) -> f64 {
        self.0
    }
}

/// Block reads of a full table scan.
pub fn scan_time(stats: &TableStats, settings: &OptimizerSettings) -> f64 {
    let data_length = stats.rows as f64 * stats.mean_rec_len.max(1) as f64;
    data_length / settings.io_block_size.max(1) as f64 + 2.0
}

/// Upper bound of the reads of a ref access, a third of the rows but never over three full
/// scans.
pub fn worst_seeks(stats: &TableStats, settings: &OptimizerSettings) -> f64 {
    (stats.rows as f64 / 10.0).min(scan_time(stats, settings) * 3.0)
}

/// Reads of a range scan returning `rows` rows.
pub fn range_read_time(rows: f64) -> f64 {
    rows + 1.0
}

/// Cost of rescanning a table for every row of the partial join in front of it.
///
/// A table whose rows fit into the join buffer is scanned once and then read from the row
/// cache.
pub fn full_scan_time(stats: &TableStats, settings: &OptimizerSettings, record_count: f64) -> f64 {
    let scan = scan_time(stats, settings);
    let table_bytes = stats.rows as f64 * stats.mean_rec_len.max(1) as f64;
    if record_count <= 1.0 || table_bytes <= settings.join_buffer_size as f64 {
        scan
    } else {
        scan * record_count
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::TableStats;
    use crate::context::OptimizerSettings;
    use crate::plan::cost::{full_scan_time, scan_time, Cost, INF};

    #[test]
    fn test_cached_scan_is_read_once() {
        let settings = OptimizerSettings::default();
        let small = TableStats {
            rows: 100,
            mean_rec_len: 40,
            ..Default::default()
        };
        assert_eq!(scan_time(&small, &settings), full_scan_time(&small, &settings, 50.0));

        let big = TableStats {
            rows: 1_000_000,
            mean_rec_len: 40,
            ..Default::default()
        };
        assert_eq!(
            scan_time(&big, &settings) * 50.0,
            full_scan_time(&big, &settings, 50.0)
        );
    }

    #[test]
    fn test_cost_arithmetic() {
        let total: Cost = vec![Cost::from(1.5), Cost::from(2.5)].into_iter().sum();
        assert_eq!(Cost::from(4.0), total);
        assert!(total < INF);
    }
}
