//! Multiple equality propagation.
//!
//! Chains of simple equalities `a = b`, `b = c`, `c = 5` found at one conjunction level are
//! replaced by a single [`MultiEqual`] `=(5, a, b, c)`. Every conjunction level owns a frame of
//! multiple equalities and links to the frame of the enclosing level, so an equality deeper in
//! the tree extends a copy of an inherited set instead of starting a new one. Field references
//! left in other predicates are linked to the set covering them at their level.

use itertools::Itertools;

use crate::catalog::{FieldDef, TableDef};
use crate::catalog::ColumnRef;
use crate::predicate::{CmpOp, EqualSetId, Expr, FieldItem, MultiEqual, Predicate, RowSource, NULL_VALUE};
use crate::table_map::TableMap;
use crate::value::{values_equal, ValueClass};
use datafusion_common::ScalarValue;

pub type FrameId = usize;

#[derive(Clone, Debug, Default)]
struct EqualFrame {
    parent: Option<FrameId>,
    sets: Vec<EqualSetId>,
}

/// Arena of multiple equalities and the conjunction levels owning them.
#[derive(Clone, Debug, Default)]
pub struct EqualityContext {
    frames: Vec<EqualFrame>,
    sets: Vec<MultiEqual>,
    set_frame: Vec<FrameId>,
}

/// Outcome of constant folding a condition.
#[derive(Clone, Debug, PartialEq)]
pub enum CondResult {
    True,
    False,
    Cond(Predicate),
}

impl CondResult {
    pub fn into_option(self) -> Option<Predicate> {
        match self {
            CondResult::True => None,
            CondResult::False => Some(Predicate::Const(false)),
            CondResult::Cond(p) => Some(p),
        }
    }
}

struct NoRow;

impl RowSource for NoRow {
    fn value(&self, _column: ColumnRef) -> &ScalarValue {
        &NULL_VALUE
    }
}

impl EqualityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: EqualSetId) -> &MultiEqual {
        &self.sets[id]
    }

    /// Multiple equalities built at the level of `frame`.
    pub fn frame_sets(&self, frame: FrameId) -> impl Iterator<Item = &MultiEqual> {
        self.frames[frame].sets.iter().map(move |id| &self.sets[*id])
    }

    /// Rewrites `cond` so that simple equalities are replaced by multiple equalities.
    ///
    /// `inherited` is the frame of the enclosing condition, e.g. the WHERE clause for an ON
    /// expression. Returns the rewritten condition together with the frame of its top level,
    /// which nested conditions should inherit.
    pub fn build_equal_items(
        &mut self,
        defs: &[TableDef],
        cond: Predicate,
        inherited: Option<FrameId>,
    ) -> (Predicate, Option<FrameId>) {
        let frames_before = self.frames.len();
        let rewritten = self.build_for_cond(defs, cond, inherited);
        // The first frame created by the call is the one of the top level, when there is one.
        let top = match &rewritten {
            Predicate::And(_) | Predicate::MultiEq(_) if self.frames.len() > frames_before => {
                Some(frames_before)
            }
            _ => inherited,
        };
        log::debug!("condition after equality propagation: {}", rewritten);
        (rewritten, top)
    }

    fn new_frame(&mut self, parent: Option<FrameId>) -> FrameId {
        self.frames.push(EqualFrame {
            parent,
            sets: vec![],
        });
        self.frames.len() - 1
    }

    fn new_set(&mut self, frame: FrameId, fields: Vec<FieldItem>, constant: Option<ScalarValue>) -> EqualSetId {
        let id = self.sets.len();
        let cond_false = constant.as_ref().map_or(false, |c| c.is_null());
        self.sets.push(MultiEqual {
            id,
            fields,
            constant,
            cond_false,
        });
        self.set_frame.push(frame);
        self.frames[frame].sets.push(id);
        id
    }

    /// Set containing `column`, searched from `frame` upwards. The flag tells whether it was
    /// found in an upper level.
    fn find_item_equal(&self, frame: FrameId, column: ColumnRef) -> Option<(EqualSetId, bool)> {
        let mut current = Some(frame);
        while let Some(f) = current {
            if let Some(id) = self.frames[f]
                .sets
                .iter()
                .find(|id| self.sets[**id].contains(column))
            {
                return Some((*id, f != frame));
            }
            current = self.frames[f].parent;
        }
        None
    }

    /// Finds the set covering `column` and makes sure it belongs to `frame`.
    fn current_level_set(&mut self, frame: FrameId, column: ColumnRef) -> Option<EqualSetId> {
        let (id, inherited) = self.find_item_equal(frame, column)?;
        if !inherited {
            return Some(id);
        }
        let copy = self.sets[id].clone();
        let new_id = self.new_set(frame, copy.fields, copy.constant);
        self.sets[new_id].cond_false |= copy.cond_false;
        Some(new_id)
    }

    fn add_const(&mut self, id: EqualSetId, value: &ScalarValue) {
        let set = &mut self.sets[id];
        match &set.constant {
            None => {
                set.cond_false |= value.is_null();
                set.constant = Some(value.clone());
            }
            Some(existing) => {
                if values_equal(existing, value) != Some(true) {
                    set.cond_false = true;
                }
            }
        }
    }

    fn merge_sets(&mut self, frame: FrameId, into: EqualSetId, from: EqualSetId) {
        let source = self.sets[from].clone();
        self.sets[into].fields.extend(source.fields);
        if let Some(c) = &source.constant {
            self.add_const(into, c);
        }
        self.sets[into].cond_false |= source.cond_false;
        self.frames[frame].sets.retain(|id| *id != from);
    }

    fn check_simple_equality(&mut self, defs: &[TableDef], left: &Expr, right: &Expr, frame: FrameId) -> bool {
        match (left, right) {
            (Expr::Field(l), Expr::Field(r)) => {
                if !field_def(defs, l).eq_def(field_def(defs, r)) {
                    return false;
                }
                let left_found = self.find_item_equal(frame, l.column);
                let right_found = self.find_item_equal(frame, r.column);
                // NULL = NULL is not true, so f = f stays unless f is known to be equal to something.
                if l.column == r.column {
                    return !(l.nullable && left_found.is_none());
                }
                if left_found.is_some() && left_found.map(|f| f.0) == right_found.map(|f| f.0) {
                    return true;
                }

                let left_set = left_found.and_then(|_| self.current_level_set(frame, l.column));
                let right_set = right_found.and_then(|_| self.current_level_set(frame, r.column));
                match (left_set, right_set) {
                    (Some(ls), Some(rs)) => self.merge_sets(frame, ls, rs),
                    (Some(ls), None) => self.sets[ls].fields.push(member(r)),
                    (None, Some(rs)) => self.sets[rs].fields.push(member(l)),
                    (None, None) => {
                        self.new_set(frame, vec![member(l), member(r)], None);
                    }
                }
                true
            }
            (Expr::Field(f), Expr::Const(c)) | (Expr::Const(c), Expr::Field(f)) => {
                let class = ValueClass::of_type(&f.data_type);
                if !c.is_null() && class != ValueClass::of_value(c) {
                    return false;
                }
                match self.current_level_set(frame, f.column) {
                    Some(id) => self.add_const(id, c),
                    None => {
                        self.new_set(frame, vec![member(f)], Some(c.clone()));
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Splits a row equality into element equalities. Elements that cannot join a multiple
    /// equality are collected in `eq_list` as plain comparisons.
    fn check_row_equality(
        &mut self,
        defs: &[TableDef],
        left: &[Expr],
        right: &[Expr],
        frame: FrameId,
        eq_list: &mut Vec<Predicate>,
    ) {
        for (l, r) in left.iter().zip(right) {
            match (l, r) {
                (Expr::Row(li), Expr::Row(ri)) if li.len() == ri.len() => {
                    self.check_row_equality(defs, li, ri, frame, eq_list)
                }
                _ => {
                    if !self.check_simple_equality(defs, l, r, frame) {
                        eq_list.push(Predicate::eq(l.clone(), r.clone()));
                    }
                }
            }
        }
    }

    fn check_equality(
        &mut self,
        defs: &[TableDef],
        pred: &Predicate,
        frame: FrameId,
        eq_list: &mut Vec<Predicate>,
    ) -> bool {
        match pred {
            Predicate::Compare {
                op: CmpOp::Eq,
                left: Expr::Row(l),
                right: Expr::Row(r),
            } if l.len() == r.len() => {
                self.check_row_equality(defs, l, r, frame, eq_list);
                true
            }
            Predicate::Compare {
                op: CmpOp::Eq,
                left,
                right,
            } => self.check_simple_equality(defs, left, right, frame),
            _ => false,
        }
    }

    fn frame_predicates(&self, frame: FrameId) -> Vec<Predicate> {
        self.frame_sets(frame)
            .map(|set| Predicate::MultiEq(set.clone()))
            .collect()
    }

    fn frame_is_false(&self, frame: FrameId) -> bool {
        self.frame_sets(frame).any(|set| set.cond_false)
    }

    fn build_for_cond(&mut self, defs: &[TableDef], cond: Predicate, inherited: Option<FrameId>) -> Predicate {
        match cond {
            Predicate::And(args) => {
                let frame = self.new_frame(inherited);
                let mut eq_list = vec![];
                let mut rest = vec![];
                for arg in args {
                    if !self.check_equality(defs, &arg, frame, &mut eq_list) {
                        rest.push(arg);
                    }
                }
                if self.frame_is_false(frame) {
                    return Predicate::Const(false);
                }

                let mut new_args = rest
                    .into_iter()
                    .map(|arg| self.build_for_cond(defs, arg, Some(frame)))
                    .collect_vec();
                new_args.extend(eq_list);
                new_args.extend(self.frame_predicates(frame));
                Predicate::and(new_args)
            }
            Predicate::Or(args) => Predicate::or(
                args.into_iter()
                    .map(|arg| self.build_for_cond(defs, arg, inherited))
                    .collect(),
            ),
            other => {
                // A standalone equality, e.g. a branch of a disjunction.
                if matches!(other, Predicate::Compare { op: CmpOp::Eq, .. }) {
                    let frame = self.new_frame(inherited);
                    let mut eq_list = vec![];
                    if self.check_equality(defs, &other, frame, &mut eq_list) {
                        if self.frame_is_false(frame) {
                            return Predicate::Const(false);
                        }
                        eq_list.extend(self.frame_predicates(frame));
                        return Predicate::and(eq_list);
                    }
                }
                let mut other = other;
                if let Some(frame) = inherited {
                    self.propagate_fields(&mut other, frame);
                }
                other
            }
        }
    }

    /// Links field references of `pred` to the multiple equalities visible from `frame`, and
    /// substitutes the constant of a set for non-string fields.
    fn propagate_fields(&self, pred: &mut Predicate, frame: FrameId) {
        let propagate = |e: &mut Expr| self.propagate_expr(e, frame);
        match pred {
            Predicate::Compare { left, right, .. } => {
                propagate(left);
                propagate(right);
            }
            Predicate::IsNull(e) | Predicate::IsNotNull(e) => propagate(e),
            Predicate::Between { expr, low, high } => {
                propagate(expr);
                propagate(low);
                propagate(high);
            }
            Predicate::InList { expr, list } => {
                propagate(expr);
                list.iter_mut().for_each(propagate);
            }
            Predicate::And(args) | Predicate::Or(args) => {
                args.iter_mut().for_each(|p| self.propagate_fields(p, frame))
            }
            Predicate::Guarded { pred, .. } => self.propagate_fields(pred, frame),
            Predicate::MultiEq(_) | Predicate::Const(_) => {}
        }
    }

    fn propagate_expr(&self, expr: &mut Expr, frame: FrameId) {
        match expr {
            Expr::Field(field) => {
                if let Some((id, _)) = self.find_item_equal(frame, field.column) {
                    let set = &self.sets[id];
                    match &set.constant {
                        Some(c) if substitutable(field, c) => *expr = Expr::Const(c.clone()),
                        _ => field.equal_set = Some(id),
                    }
                }
            }
            Expr::Row(items) => items.iter_mut().for_each(|e| self.propagate_expr(e, frame)),
            Expr::Const(_) => {}
        }
    }

    /// Replaces multiple equalities by simple equalities against the member read first,
    /// and other field references by that member or the set's constant.
    ///
    /// `table_position[t]` is the position of table `t` in the join order.
    pub fn substitute_for_best_equal_field(&self, cond: Predicate, table_position: &[usize]) -> Predicate {
        match cond {
            Predicate::And(args) => Predicate::and(
                args.into_iter()
                    .map(|p| self.substitute_for_best_equal_field(p, table_position))
                    .collect(),
            ),
            Predicate::Or(args) => Predicate::or(
                args.into_iter()
                    .map(|p| self.substitute_for_best_equal_field(p, table_position))
                    .collect(),
            ),
            Predicate::MultiEq(eq) => self.eliminate_item_equal(&eq, table_position),
            Predicate::Guarded { guard, pred } => Predicate::guarded(
                guard,
                self.substitute_for_best_equal_field(*pred, table_position),
            ),
            mut other => {
                other.for_each_field_mut(&mut |field| {
                    self.replace_equal_field(field, table_position)
                });
                other
            }
        }
    }

    fn replace_equal_field(&self, field: &mut FieldItem, table_position: &[usize]) {
        let Some(id) = field.equal_set else {
            return;
        };
        let best = self.sets[id]
            .fields
            .iter()
            .min_by_key(|f| table_position[f.column.table]);
        if let Some(best) = best {
            if table_position[best.column.table] < table_position[field.column.table] {
                field.column = best.column;
                field.name = best.name.clone();
                field.nullable = best.nullable;
            }
        }
    }

    fn eliminate_item_equal(&self, eq: &MultiEqual, table_position: &[usize]) -> Predicate {
        if eq.cond_false {
            return Predicate::Const(false);
        }
        let fields = eq
            .fields
            .iter()
            .sorted_by_key(|f| table_position[f.column.table])
            .collect_vec();
        let upper_frame = self
            .set_frame
            .get(eq.id)
            .and_then(|frame| self.frames[*frame].parent);
        let upper_of = |f: &FieldItem| {
            upper_frame.and_then(|frame| self.find_item_equal(frame, f.column).map(|(id, _)| id))
        };

        let mut equalities = vec![];
        let start = usize::from(eq.constant.is_none());
        for (i, field) in fields.iter().enumerate().skip(start) {
            // Equalities already implied by a set of the enclosing level are not repeated.
            let produce = match upper_of(field) {
                None => true,
                Some(upper) => {
                    if eq.constant.is_some() && self.sets[upper].constant.is_some() {
                        false
                    } else {
                        !fields[..i].iter().any(|g| upper_of(g) == Some(upper))
                    }
                }
            };
            if !produce {
                continue;
            }
            let head = match &eq.constant {
                Some(c) => Expr::Const(c.clone()),
                None => Expr::Field((*fields[0]).clone()),
            };
            equalities.push(match eq.constant {
                Some(_) => Predicate::eq(Expr::Field((*field).clone()), head),
                None => Predicate::eq(head, Expr::Field((*field).clone())),
            });
        }
        Predicate::and(equalities)
    }
}

fn field_def<'a>(defs: &'a [TableDef], field: &FieldItem) -> &'a FieldDef {
    &defs[field.column.table].fields[field.column.field]
}

fn member(field: &FieldItem) -> FieldItem {
    FieldItem {
        equal_set: None,
        ..field.clone()
    }
}

fn substitutable(field: &FieldItem, constant: &ScalarValue) -> bool {
    let class = ValueClass::of_type(&field.data_type);
    class != ValueClass::String && class == ValueClass::of_value(constant)
}

/// Folds constant parts of a condition.
///
/// `outer_tables` are the inner tables of outer joins, whose fields can be NULL even when
/// declared NOT NULL.
pub fn remove_eq_conds(cond: Predicate, outer_tables: TableMap) -> CondResult {
    match cond {
        Predicate::And(args) => {
            let mut kept = vec![];
            for arg in args {
                match remove_eq_conds(arg, outer_tables) {
                    CondResult::False => return CondResult::False,
                    CondResult::True => {}
                    CondResult::Cond(p) => kept.push(p),
                }
            }
            match kept.len() {
                0 => CondResult::True,
                _ => CondResult::Cond(Predicate::and(kept)),
            }
        }
        Predicate::Or(args) => {
            let mut kept = vec![];
            for arg in args {
                match remove_eq_conds(arg, outer_tables) {
                    CondResult::True => return CondResult::True,
                    CondResult::False => {}
                    CondResult::Cond(p) => kept.push(p),
                }
            }
            match kept.len() {
                0 => CondResult::False,
                _ => CondResult::Cond(Predicate::or(kept)),
            }
        }
        Predicate::Const(true) => CondResult::True,
        Predicate::Const(false) => CondResult::False,
        Predicate::MultiEq(eq) if eq.cond_false => CondResult::False,
        Predicate::IsNull(Expr::Field(f))
            if !f.nullable && !outer_tables.contains(f.column.table) =>
        {
            CondResult::False
        }
        Predicate::IsNotNull(Expr::Field(f))
            if !f.nullable && !outer_tables.contains(f.column.table) =>
        {
            CondResult::True
        }
        Predicate::Guarded { .. } => CondResult::Cond(cond),
        other if other.used_tables().is_empty() && !matches!(other, Predicate::MultiEq(_)) => {
            if other.is_true(&NoRow) {
                CondResult::True
            } else {
                CondResult::False
            }
        }
        other => CondResult::Cond(other),
    }
}
