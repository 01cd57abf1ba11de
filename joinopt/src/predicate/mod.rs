//! Predicate trees over the fields of the joined tables.

use std::fmt::{Display, Formatter};

use arrow_schema::DataType;
use datafusion_common::ScalarValue;
use enum_as_inner::EnumAsInner;
use itertools::Itertools;

use crate::catalog::ColumnRef;
use crate::table_map::TableMap;

mod eval;
mod explain;

pub use eval::*;
pub use explain::*;

/// Identifier of a multiple equality inside an [`crate::equality::EqualityContext`].
pub type EqualSetId = usize;

/// Reference to a column of a query table.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldItem {
    pub column: ColumnRef,
    /// Qualified name, used for display only.
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Multiple equality covering this field at the level the reference appears in.
    pub equal_set: Option<EqualSetId>,
}

impl FieldItem {
    pub fn new<S: Into<String>>(
        column: ColumnRef,
        name: S,
        data_type: DataType,
        nullable: bool,
    ) -> Self {
        Self {
            column,
            name: name.into(),
            data_type,
            nullable,
            equal_set: None,
        }
    }

    pub fn table_map(&self) -> TableMap {
        TableMap::of(self.column.table)
    }
}

#[derive(Clone, Debug, PartialEq, EnumAsInner)]
pub enum Expr {
    Field(FieldItem),
    Const(ScalarValue),
    Row(Vec<Expr>),
}

impl Expr {
    pub fn used_tables(&self) -> TableMap {
        match self {
            Expr::Field(f) => f.table_map(),
            Expr::Const(_) => TableMap::EMPTY,
            Expr::Row(items) => items
                .iter()
                .fold(TableMap::EMPTY, |acc, e| acc | e.used_tables()),
        }
    }

    /// Whether the value does not depend on any table.
    pub fn is_const(&self) -> bool {
        self.used_tables().is_empty()
    }

    pub fn is_null_const(&self) -> bool {
        matches!(self, Expr::Const(v) if v.is_null())
    }

    pub fn maybe_null(&self) -> bool {
        match self {
            Expr::Field(f) => f.nullable,
            Expr::Const(v) => v.is_null(),
            Expr::Row(_) => false,
        }
    }

    pub fn for_each_field_mut<F: FnMut(&mut FieldItem)>(&mut self, f: &mut F) {
        match self {
            Expr::Field(field) => f(field),
            Expr::Const(_) => {}
            Expr::Row(items) => items.iter_mut().for_each(|e| e.for_each_field_mut(f)),
        }
    }

    pub fn for_each_field<F: FnMut(&FieldItem)>(&self, f: &mut F) {
        match self {
            Expr::Field(field) => f(field),
            Expr::Const(_) => {}
            Expr::Row(items) => items.iter().for_each(|e| e.for_each_field(f)),
        }
    }

    /// Whether both sides are the same field or the same constant.
    pub fn same_as(&self, other: &Expr) -> bool {
        match (self, other) {
            (Expr::Field(a), Expr::Field(b)) => a.column == b.column,
            (Expr::Const(a), Expr::Const(b)) => a == b,
            (Expr::Row(a), Expr::Row(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => false,
        }
    }
}

impl From<FieldItem> for Expr {
    fn from(f: FieldItem) -> Self {
        Expr::Field(f)
    }
}

impl From<ScalarValue> for Expr {
    fn from(v: ScalarValue) -> Self {
        Expr::Const(v)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Operator to use after swapping the operands.
    pub fn swap(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// A set of fields known to be equal to each other, and possibly to a constant.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiEqual {
    pub id: EqualSetId,
    pub fields: Vec<FieldItem>,
    pub constant: Option<ScalarValue>,
    /// Set when two different constants were equated with the members.
    pub cond_false: bool,
}

impl MultiEqual {
    pub fn used_tables(&self) -> TableMap {
        self.fields
            .iter()
            .fold(TableMap::EMPTY, |acc, f| acc | f.table_map())
    }

    pub fn contains(&self, column: ColumnRef) -> bool {
        self.fields.iter().any(|f| f.column == column)
    }
}

/// Runtime switch of a pushed down predicate, owned by a join slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Guard {
    /// Open once the outer join whose first inner slot is the argument found a match.
    Found(usize),
    /// Open unless the slot's outer join is producing a NULL complemented row.
    NotNullComplemented(usize),
}

#[derive(Clone, Debug, PartialEq, EnumAsInner)]
pub enum Predicate {
    Compare {
        op: CmpOp,
        left: Expr,
        right: Expr,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    MultiEq(MultiEqual),
    IsNull(Expr),
    IsNotNull(Expr),
    Between {
        expr: Expr,
        low: Expr,
        high: Expr,
    },
    InList {
        expr: Expr,
        list: Vec<Expr>,
    },
    Const(bool),
    Guarded {
        guard: Guard,
        pred: Box<Predicate>,
    },
}

impl Predicate {
    pub fn compare<L: Into<Expr>, R: Into<Expr>>(op: CmpOp, left: L, right: R) -> Self {
        Predicate::Compare {
            op,
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn eq<L: Into<Expr>, R: Into<Expr>>(left: L, right: R) -> Self {
        Self::compare(CmpOp::Eq, left, right)
    }

    /// Conjunction of `args`, flattening nested conjunctions.
    pub fn and(args: Vec<Predicate>) -> Self {
        let mut flat = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::Const(true),
            1 => flat.pop().unwrap_or(Predicate::Const(true)),
            _ => Predicate::And(flat),
        }
    }

    pub fn or(args: Vec<Predicate>) -> Self {
        let mut flat = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Predicate::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::Const(false),
            1 => flat.pop().unwrap_or(Predicate::Const(false)),
            _ => Predicate::Or(flat),
        }
    }

    pub fn guarded(guard: Guard, pred: Predicate) -> Self {
        Predicate::Guarded {
            guard,
            pred: Box::new(pred),
        }
    }

    pub fn used_tables(&self) -> TableMap {
        match self {
            Predicate::Compare { left, right, .. } => left.used_tables() | right.used_tables(),
            Predicate::And(args) | Predicate::Or(args) => args
                .iter()
                .fold(TableMap::EMPTY, |acc, p| acc | p.used_tables()),
            Predicate::MultiEq(eq) => eq.used_tables(),
            Predicate::IsNull(e) | Predicate::IsNotNull(e) => e.used_tables(),
            Predicate::Between { expr, low, high } => {
                expr.used_tables() | low.used_tables() | high.used_tables()
            }
            Predicate::InList { expr, list } => list
                .iter()
                .fold(expr.used_tables(), |acc, e| acc | e.used_tables()),
            Predicate::Const(_) => TableMap::EMPTY,
            Predicate::Guarded { pred, .. } => pred.used_tables(),
        }
    }

    /// Tables for which a NULL complemented row makes the predicate not true.
    pub fn not_null_tables(&self) -> TableMap {
        fn fields(expr: &Expr) -> TableMap {
            let mut map = TableMap::EMPTY;
            expr.for_each_field(&mut |f| map.insert(f.column.table));
            map
        }
        match self {
            Predicate::Compare { left, right, .. } => fields(left) | fields(right),
            Predicate::And(args) => args
                .iter()
                .fold(TableMap::EMPTY, |acc, p| acc | p.not_null_tables()),
            Predicate::Or(args) => args
                .iter()
                .map(|p| p.not_null_tables())
                .reduce(|acc, m| acc & m)
                .unwrap_or(TableMap::EMPTY),
            Predicate::MultiEq(eq) => eq.used_tables(),
            Predicate::IsNotNull(e) => fields(e),
            Predicate::Between { expr, low, high } => fields(expr) | fields(low) | fields(high),
            Predicate::InList { expr, .. } => fields(expr),
            Predicate::IsNull(_) | Predicate::Const(_) | Predicate::Guarded { .. } => {
                TableMap::EMPTY
            }
        }
    }

    pub fn for_each_field_mut<F: FnMut(&mut FieldItem)>(&mut self, f: &mut F) {
        match self {
            Predicate::Compare { left, right, .. } => {
                left.for_each_field_mut(f);
                right.for_each_field_mut(f);
            }
            Predicate::And(args) | Predicate::Or(args) => {
                args.iter_mut().for_each(|p| p.for_each_field_mut(f))
            }
            Predicate::MultiEq(eq) => eq.fields.iter_mut().for_each(|field| f(field)),
            Predicate::IsNull(e) | Predicate::IsNotNull(e) => e.for_each_field_mut(f),
            Predicate::Between { expr, low, high } => {
                expr.for_each_field_mut(f);
                low.for_each_field_mut(f);
                high.for_each_field_mut(f);
            }
            Predicate::InList { expr, list } => {
                expr.for_each_field_mut(f);
                list.iter_mut().for_each(|e| e.for_each_field_mut(f));
            }
            Predicate::Const(_) => {}
            Predicate::Guarded { pred, .. } => pred.for_each_field_mut(f),
        }
    }

    pub fn for_each_field<F: FnMut(&FieldItem)>(&self, f: &mut F) {
        match self {
            Predicate::Compare { left, right, .. } => {
                left.for_each_field(f);
                right.for_each_field(f);
            }
            Predicate::And(args) | Predicate::Or(args) => args.iter().for_each(|p| p.for_each_field(f)),
            Predicate::MultiEq(eq) => eq.fields.iter().for_each(|field| f(field)),
            Predicate::IsNull(e) | Predicate::IsNotNull(e) => e.for_each_field(f),
            Predicate::Between { expr, low, high } => {
                expr.for_each_field(f);
                low.for_each_field(f);
                high.for_each_field(f);
            }
            Predicate::InList { expr, list } => {
                expr.for_each_field(f);
                list.iter().for_each(|e| e.for_each_field(f));
            }
            Predicate::Const(_) => {}
            Predicate::Guarded { pred, .. } => pred.for_each_field(f),
        }
    }

    /// Top level conjuncts.
    pub fn into_conjuncts(self) -> Vec<Predicate> {
        match self {
            Predicate::And(args) => args,
            Predicate::Const(true) => vec![],
            other => vec![other],
        }
    }
}

/// Conjunction of two optional conditions.
pub fn and_conds(left: Option<Predicate>, right: Option<Predicate>) -> Option<Predicate> {
    match (left, right) {
        (Some(l), Some(r)) => Some(Predicate::and(vec![l, r])),
        (l, None) => l,
        (None, r) => r,
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Field(field) => write!(f, "{}", field.name),
            Expr::Const(ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s))) => {
                write!(f, "'{}'", s)
            }
            Expr::Const(v) if v.is_null() => write!(f, "NULL"),
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Row(items) => write!(f, "({})", items.iter().join(", ")),
        }
    }
}

impl Display for Guard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Guard::Found(slot) => write!(f, "found(#{})", slot),
            Guard::NotNullComplemented(slot) => write!(f, "not_null_compl(#{})", slot),
        }
    }
}

impl Display for MultiEqual {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "multiple equal(")?;
        if let Some(c) = &self.constant {
            write!(f, "{}, ", Expr::Const(c.clone()))?;
        }
        write!(f, "{})", self.fields.iter().map(|x| &x.name).join(", "))
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Compare { op, left, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            Predicate::And(args) => write!(f, "({})", args.iter().join(" AND ")),
            Predicate::Or(args) => write!(f, "({})", args.iter().join(" OR ")),
            Predicate::MultiEq(eq) => write!(f, "{}", eq),
            Predicate::IsNull(e) => write!(f, "{} IS NULL", e),
            Predicate::IsNotNull(e) => write!(f, "{} IS NOT NULL", e),
            Predicate::Between { expr, low, high } => {
                write!(f, "{} BETWEEN {} AND {}", expr, low, high)
            }
            Predicate::InList { expr, list } => write!(f, "{} IN ({})", expr, list.iter().join(", ")),
            Predicate::Const(true) => write!(f, "TRUE"),
            Predicate::Const(false) => write!(f, "FALSE"),
            Predicate::Guarded { guard, pred } => write!(f, "trigcond({}, {})", guard, pred),
        }
    }
}
