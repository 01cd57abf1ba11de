//! Three valued evaluation of predicates against the current partial join.

use std::cmp::Ordering;

use datafusion_common::ScalarValue;

use crate::catalog::ColumnRef;
use crate::predicate::{CmpOp, Expr, Guard, MultiEqual, Predicate};
use crate::value::compare_values;

pub static NULL_VALUE: ScalarValue = ScalarValue::Null;

/// Supplies field values and guard states while a predicate is evaluated.
pub trait RowSource {
    /// Current value of `column`; NULL for a NULL complemented table.
    fn value(&self, column: ColumnRef) -> &ScalarValue;

    /// Whether predicates wrapped by `guard` are currently checked.
    fn guard_open(&self, _guard: Guard) -> bool {
        true
    }
}

impl Expr {
    pub fn eval<'a>(&'a self, src: &'a dyn RowSource) -> &'a ScalarValue {
        match self {
            Expr::Field(f) => src.value(f.column),
            Expr::Const(v) => v,
            Expr::Row(_) => &NULL_VALUE,
        }
    }
}

fn cmp_holds(op: CmpOp, ord: Ordering) -> bool {
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    }
}

/// Conjunction in three valued logic.
fn and3<I: IntoIterator<Item = Option<bool>>>(items: I) -> Option<bool> {
    let mut result = Some(true);
    for item in items {
        match item {
            Some(false) => return Some(false),
            None => result = None,
            Some(true) => {}
        }
    }
    result
}

fn or3<I: IntoIterator<Item = Option<bool>>>(items: I) -> Option<bool> {
    let mut result = Some(false);
    for item in items {
        match item {
            Some(true) => return Some(true),
            None => result = None,
            Some(false) => {}
        }
    }
    result
}

fn compare_exprs(op: CmpOp, left: &Expr, right: &Expr, src: &dyn RowSource) -> Option<bool> {
    match (left, right) {
        (Expr::Row(l), Expr::Row(r)) if l.len() == r.len() => {
            let pairs = l.iter().zip(r).map(|(a, b)| compare_exprs(CmpOp::Eq, a, b, src));
            match op {
                CmpOp::Eq => and3(pairs),
                CmpOp::Ne => and3(pairs).map(|eq| !eq),
                _ => compare_rows(op, l, r, src),
            }
        }
        _ => compare_values(left.eval(src), right.eval(src)).map(|ord| cmp_holds(op, ord)),
    }
}

/// Lexicographic `<`, `<=`, `>`, `>=` of two rows of the same width. The first pair that is
/// not equal decides; a NULL met before it makes the result unknown.
fn compare_rows(op: CmpOp, left: &[Expr], right: &[Expr], src: &dyn RowSource) -> Option<bool> {
    for (a, b) in left.iter().zip(right) {
        match (a, b) {
            (Expr::Row(_), Expr::Row(_)) => match compare_exprs(CmpOp::Eq, a, b, src)? {
                true => continue,
                false => return compare_exprs(op, a, b, src),
            },
            _ => match compare_values(a.eval(src), b.eval(src))? {
                Ordering::Equal => continue,
                ord => return Some(cmp_holds(op, ord)),
            },
        }
    }
    Some(cmp_holds(op, Ordering::Equal))
}

impl MultiEqual {
    pub fn eval(&self, src: &dyn RowSource) -> Option<bool> {
        if self.cond_false {
            return Some(false);
        }
        let mut values = self.fields.iter().map(|f| src.value(f.column));
        let first = match &self.constant {
            Some(c) => Some(c),
            None => values.next(),
        };
        let Some(first) = first else {
            return Some(true);
        };
        let mut result = if first.is_null() { None } else { Some(true) };
        for value in values {
            match compare_values(first, value) {
                Some(Ordering::Equal) => {}
                Some(_) => return Some(false),
                None => result = None,
            }
        }
        result
    }
}

impl Predicate {
    pub fn eval(&self, src: &dyn RowSource) -> Option<bool> {
        match self {
            Predicate::Compare { op, left, right } => compare_exprs(*op, left, right, src),
            Predicate::And(args) => and3(args.iter().map(|p| p.eval(src))),
            Predicate::Or(args) => or3(args.iter().map(|p| p.eval(src))),
            Predicate::MultiEq(eq) => eq.eval(src),
            Predicate::IsNull(e) => Some(e.eval(src).is_null()),
            Predicate::IsNotNull(e) => Some(!e.eval(src).is_null()),
            Predicate::Between { expr, low, high } => and3([
                compare_exprs(CmpOp::Ge, expr, low, src),
                compare_exprs(CmpOp::Le, expr, high, src),
            ]),
            Predicate::InList { expr, list } => {
                or3(list.iter().map(|e| compare_exprs(CmpOp::Eq, expr, e, src)))
            }
            Predicate::Const(b) => Some(*b),
            Predicate::Guarded { guard, pred } => {
                if src.guard_open(*guard) {
                    pred.eval(src)
                } else {
                    Some(true)
                }
            }
        }
    }

    /// Whether the predicate holds; UNKNOWN counts as false.
    pub fn is_true(&self, src: &dyn RowSource) -> bool {
        self.eval(src) == Some(true)
    }
}
