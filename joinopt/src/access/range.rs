use std::cmp::Ordering;

use datafusion_common::ScalarValue;

use crate::catalog::{FieldDef, TableDef, TableStats};
use crate::keyuse::value_usable_for_key;
use crate::predicate::{CmpOp, Expr, Predicate};
use crate::storage::{encode_key_part, ScanOrder};
use crate::table_map::TableNo;

/// One end of a key interval, as a key image of the first key part.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeBound {
    pub image: Vec<u8>,
    pub inclusive: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyRange {
    pub low: Option<RangeBound>,
    pub high: Option<RangeBound>,
}

impl KeyRange {
    pub fn point(image: Vec<u8>) -> Self {
        Self {
            low: Some(RangeBound {
                image: image.clone(),
                inclusive: true,
            }),
            high: Some(RangeBound {
                image,
                inclusive: true,
            }),
        }
    }

    pub fn is_point(&self) -> bool {
        match (&self.low, &self.high) {
            (Some(l), Some(h)) => l.inclusive && h.inclusive && l.image == h.image,
            _ => false,
        }
    }

    /// Whether a key image prefix is not below the low end.
    pub fn above_low(&self, prefix: &[u8]) -> bool {
        match &self.low {
            None => true,
            Some(b) => match prefix.cmp(&b.image) {
                Ordering::Greater => true,
                Ordering::Equal => b.inclusive,
                Ordering::Less => false,
            },
        }
    }

    /// Whether a key image prefix is not above the high end.
    pub fn below_high(&self, prefix: &[u8]) -> bool {
        match &self.high {
            None => true,
            Some(b) => match prefix.cmp(&b.image) {
                Ordering::Less => true,
                Ordering::Equal => b.inclusive,
                Ordering::Greater => false,
            },
        }
    }

    pub fn contains(&self, prefix: &[u8]) -> bool {
        self.above_low(prefix) && self.below_high(prefix)
    }
}

/// Scan of one index over constant ranges of its first key part.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeScan {
    pub key: usize,
    /// Disjoint ranges in key order. Empty when no row can match.
    pub ranges: Vec<KeyRange>,
    /// Width of the first key part inside key images.
    pub prefix_length: usize,
    pub order: ScanOrder,
    /// Estimated rows the scan returns.
    pub rows: f64,
}

impl RangeScan {
    /// A scan over several ranges, which is read in key order only.
    pub fn is_composite(&self) -> bool {
        self.ranges.len() > 1
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Constraints collected on the first part of one key.
struct PartBounds<'a> {
    field: &'a FieldDef,
    low: Option<RangeBound>,
    high: Option<RangeBound>,
    points: Option<Vec<Vec<u8>>>,
    impossible: bool,
    used: bool,
}

impl<'a> PartBounds<'a> {
    fn new(field: &'a FieldDef) -> Self {
        Self {
            field,
            low: None,
            high: None,
            points: None,
            impossible: false,
            used: false,
        }
    }

    fn image(&self, value: &ScalarValue) -> Option<Vec<u8>> {
        let mut image = vec![];
        encode_key_part(self.field, value, &mut image).ok()?;
        Some(image)
    }

    fn constant<'e>(&self, expr: &'e Expr) -> Option<&'e ScalarValue> {
        match expr {
            Expr::Const(value) if value_usable_for_key(&self.field.data_type, expr) => Some(value),
            _ => None,
        }
    }

    fn add_low(&mut self, value: &ScalarValue, inclusive: bool) {
        if value.is_null() {
            self.impossible = true;
            return;
        }
        if let Some(image) = self.image(value) {
            self.used = true;
            let replace = match &self.low {
                None => true,
                Some(old) => match image.cmp(&old.image) {
                    Ordering::Greater => true,
                    Ordering::Equal => !inclusive,
                    Ordering::Less => false,
                },
            };
            if replace {
                self.low = Some(RangeBound { image, inclusive });
            }
        }
    }

    fn add_high(&mut self, value: &ScalarValue, inclusive: bool) {
        if value.is_null() {
            self.impossible = true;
            return;
        }
        if let Some(image) = self.image(value) {
            self.used = true;
            let replace = match &self.high {
                None => true,
                Some(old) => match image.cmp(&old.image) {
                    Ordering::Less => true,
                    Ordering::Equal => !inclusive,
                    Ordering::Greater => false,
                },
            };
            if replace {
                self.high = Some(RangeBound { image, inclusive });
            }
        }
    }

    fn add_points(&mut self, mut images: Vec<Vec<u8>>) {
        self.used = true;
        images.sort();
        images.dedup();
        self.points = Some(match self.points.take() {
            None => images,
            Some(old) => old.into_iter().filter(|p| images.contains(p)).collect(),
        });
    }

    fn add_compare(&mut self, op: CmpOp, value: &ScalarValue) {
        match op {
            CmpOp::Eq if value.is_null() => self.impossible = true,
            CmpOp::Eq => {
                if let Some(image) = self.image(value) {
                    self.add_points(vec![image]);
                }
            }
            CmpOp::Lt => self.add_high(value, false),
            CmpOp::Le => self.add_high(value, true),
            CmpOp::Gt => self.add_low(value, false),
            CmpOp::Ge => self.add_low(value, true),
            CmpOp::Ne => {}
        }
    }

    fn is_key_field(&self, expr: &Expr, table: TableNo, field_nr: usize) -> bool {
        matches!(expr, Expr::Field(f) if f.column.table == table && f.column.field == field_nr)
    }

    fn add_conjunct(&mut self, pred: &Predicate, table: TableNo, field_nr: usize) {
        match pred {
            Predicate::Compare { op, left, right } => {
                if self.is_key_field(left, table, field_nr) {
                    if let Some(value) = self.constant(right) {
                        self.add_compare(*op, value);
                    }
                } else if self.is_key_field(right, table, field_nr) {
                    if let Some(value) = self.constant(left) {
                        self.add_compare(op.swap(), value);
                    }
                }
            }
            Predicate::MultiEq(eq) => {
                let member = eq
                    .fields
                    .iter()
                    .any(|f| f.column.table == table && f.column.field == field_nr);
                if let (true, Some(value)) = (member, &eq.constant) {
                    let value = Expr::Const(value.clone());
                    if let Some(value) = self.constant(&value) {
                        self.add_compare(CmpOp::Eq, value);
                    }
                }
            }
            Predicate::Between { expr, low, high } if self.is_key_field(expr, table, field_nr) => {
                if let (Some(low), Some(high)) = (self.constant(low), self.constant(high)) {
                    self.add_low(low, true);
                    self.add_high(high, true);
                }
            }
            Predicate::InList { expr, list } if self.is_key_field(expr, table, field_nr) => {
                let mut images = Vec::with_capacity(list.len());
                for item in list {
                    match self.constant(item) {
                        // NULL never matches an IN list entry.
                        Some(value) if value.is_null() => {}
                        Some(value) => match self.image(value) {
                            Some(image) => images.push(image),
                            None => return,
                        },
                        None => return,
                    }
                }
                self.add_points(images);
            }
            Predicate::IsNull(expr) if self.is_key_field(expr, table, field_nr) => {
                if !self.field.nullable {
                    self.impossible = true;
                } else if let Some(image) = self.image(&ScalarValue::Null) {
                    self.add_points(vec![image]);
                }
            }
            Predicate::And(args) => {
                for arg in args {
                    self.add_conjunct(arg, table, field_nr);
                }
            }
            Predicate::Const(false) => self.impossible = true,
            _ => {}
        }
    }

    fn into_ranges(mut self) -> Option<Vec<KeyRange>> {
        if self.impossible {
            return Some(vec![]);
        }
        if !self.used {
            return None;
        }
        if self.field.nullable && self.low.is_none() && self.points.is_none() {
            // Any comparison with a constant rejects NULL, which sorts first.
            self.low = self.image(&ScalarValue::Null).map(|image| RangeBound {
                image,
                inclusive: false,
            });
        }
        let interval = KeyRange {
            low: self.low,
            high: self.high,
        };
        match self.points {
            Some(points) => Some(
                points
                    .into_iter()
                    .filter(|p| interval.contains(p))
                    .map(KeyRange::point)
                    .collect(),
            ),
            None => {
                let empty = match (&interval.low, &interval.high) {
                    (Some(l), Some(h)) => match l.image.cmp(&h.image) {
                        Ordering::Greater => true,
                        Ordering::Equal => !(l.inclusive && h.inclusive),
                        Ordering::Less => false,
                    },
                    _ => false,
                };
                Some(if empty { vec![] } else { vec![interval] })
            }
        }
    }
}

/// Range scan of `key` from constant comparisons on its first key part found among the
/// conjuncts of `cond`.
pub fn get_key_range(
    table: TableNo,
    def: &TableDef,
    stats: &TableStats,
    key: usize,
    cond: &Predicate,
) -> Option<RangeScan> {
    let field_nr = *def.keys.get(key)?.parts.first()?;
    let field = &def.fields[field_nr];
    let mut bounds = PartBounds::new(field);
    bounds.add_conjunct(cond, table, field_nr);
    let ranges = bounds.into_ranges()?;

    let table_rows = stats.rows.max(1) as f64;
    let per_point = stats
        .records_per_key(key, 1)
        .unwrap_or_else(|| (table_rows / 10.0).max(1.0));
    let rows = ranges
        .iter()
        .map(|r| {
            if r.is_point() {
                per_point
            } else {
                (table_rows / 3.0).max(1.0)
            }
        })
        .sum::<f64>()
        .min(table_rows);
    Some(RangeScan {
        key,
        ranges,
        prefix_length: field.store_length(),
        order: ScanOrder::Forward,
        rows,
    })
}

/// The range scan over the keys of `def` returning the fewest rows.
pub fn best_range_scan(
    table: TableNo,
    def: &TableDef,
    stats: &TableStats,
    cond: &Predicate,
) -> Option<RangeScan> {
    (0..def.keys.len())
        .filter_map(|key| get_key_range(table, def, stats, key, cond))
        .min_by(|a, b| a.rows.partial_cmp(&b.rows).unwrap_or(Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::access::{best_range_scan, get_key_range};
    use crate::catalog::{FieldDef, KeyDef, TableDef, TableStats};
    use crate::predicate::test_util::{field, int};
    use crate::predicate::{CmpOp, Expr, Predicate};
    use crate::storage::encode_key_part;

    fn table() -> TableDef {
        TableDef::new(
            "t1",
            vec![
                FieldDef::new("a", DataType::Int64, false),
                FieldDef::new("b", DataType::Int64, true),
            ],
        )
        .with_key(KeyDef::unique("primary", vec![0]))
        .with_key(KeyDef::new("b", vec![1]))
    }

    fn stats() -> TableStats {
        TableStats {
            rows: 90,
            mean_rec_len: 16,
            rec_per_key: vec![vec![1.0], vec![9.0]],
            exact: true,
        }
    }

    #[test]
    fn test_interval_bounds_are_intersected() {
        let cond = Predicate::and(vec![
            Predicate::compare(CmpOp::Gt, field(1, 0, "a", false), int(3)),
            Predicate::compare(CmpOp::Ge, field(1, 0, "a", false), int(5)),
            Predicate::compare(CmpOp::Lt, int(9), field(1, 0, "a", false)),
            Predicate::compare(CmpOp::Le, field(1, 0, "a", false), int(20)),
        ]);
        let scan = get_key_range(1, &table(), &stats(), 0, &cond).unwrap();
        assert_eq!(1, scan.ranges.len());
        let range = &scan.ranges[0];
        // 9 < a AND a <= 20
        let mut nine = vec![];
        encode_key_part(&table().fields[0], &ScalarValue::Int64(Some(9)), &mut nine).unwrap();
        assert_eq!(nine, range.low.as_ref().unwrap().image);
        assert!(!range.low.as_ref().unwrap().inclusive);
        assert!(range.high.as_ref().unwrap().inclusive);
        assert_eq!(30.0, scan.rows);
    }

    #[test]
    fn test_contradicting_bounds_give_no_ranges() {
        let cond = Predicate::and(vec![
            Predicate::compare(CmpOp::Gt, field(1, 0, "a", false), int(5)),
            Predicate::compare(CmpOp::Lt, field(1, 0, "a", false), int(5)),
        ]);
        let scan = get_key_range(1, &table(), &stats(), 0, &cond).unwrap();
        assert!(scan.is_empty());
        assert_eq!(0.0, scan.rows);
    }

    #[test]
    fn test_in_list_gives_sorted_points() {
        let cond = Predicate::InList {
            expr: field(1, 1, "b", true),
            list: vec![int(7), int(2), Expr::Const(ScalarValue::Null), int(7)],
        };
        let scan = best_range_scan(1, &table(), &stats(), &cond).unwrap();
        assert_eq!(1, scan.key);
        assert!(scan.is_composite());
        assert_eq!(2, scan.ranges.len());
        assert!(scan.ranges.iter().all(|r| r.is_point()));
        assert!(scan.ranges[0].low.as_ref().unwrap().image < scan.ranges[1].low.as_ref().unwrap().image);
        assert_eq!(18.0, scan.rows);
    }

    #[test]
    fn test_unrelated_conditions_give_no_scan() {
        let cond = Predicate::and(vec![
            Predicate::compare(CmpOp::Ne, field(1, 0, "a", false), int(5)),
            Predicate::compare(CmpOp::Lt, field(1, 0, "a", false), field(2, 0, "a", false)),
            Predicate::compare(CmpOp::Lt, field(1, 0, "a", false), Expr::Const(ScalarValue::Float64(Some(2.5)))),
        ]);
        assert!(best_range_scan(1, &table(), &stats(), &cond).is_none());
    }

    #[test]
    fn test_nullable_part_skips_nulls() {
        let cond = Predicate::compare(CmpOp::Lt, field(1, 1, "b", true), int(4));
        let scan = get_key_range(1, &table(), &stats(), 1, &cond).unwrap();
        let range = &scan.ranges[0];
        assert!(!range.contains(&[0; 9]));
        assert!(!range.low.as_ref().unwrap().inclusive);
    }
}
