use arrow_schema::DataType;
use datafusion_common::ScalarValue;

use crate::catalog::FieldDef;
use crate::context::OptimizerSettings;
use crate::order::OrderItem;
use crate::predicate::{Expr, RowSource};
use crate::select::{AggFunc, SelectItem};
use crate::storage::{encode_key_part, Row, StorageResult};

/// How a column of a temporary table gets its value.
#[derive(Clone, Debug, PartialEq)]
pub enum TmpColumn {
    /// Copy of an expression over the joined row, taken from the first row of a group.
    Copy(Expr),
    /// Aggregate maintained while rows of a group arrive.
    Agg { func: AggFunc, arg: Option<Expr> },
}

/// Field layout of a temporary table.
///
/// Grouping fields come first, then the select list, then hidden fields needed to order the
/// result. The key is the grouping fields, or for DISTINCT all visible fields.
#[derive(Clone, Debug)]
pub struct TmpTableLayout {
    pub fields: Vec<FieldDef>,
    pub columns: Vec<TmpColumn>,
    /// Fields forming the unique key, empty for a table without key.
    pub key_fields: Vec<usize>,
    /// Select list fields, in select order.
    pub output: Vec<usize>,
    /// Fields and directions the result is sorted by.
    pub order_keys: Vec<(usize, bool)>,
    /// The key is too long or holds blobs: rows are found by a hash of the key values and
    /// compared in full.
    pub unique_constraint: bool,
    pub key_length: usize,
    pub null_bitmap_length: usize,
}

fn expr_type(expr: &Expr) -> DataType {
    match expr {
        Expr::Field(f) => f.data_type.clone(),
        Expr::Const(v) => v.get_datatype(),
        Expr::Row(_) => DataType::Null,
    }
}

impl TmpTableLayout {
    pub fn build(
        items: &[SelectItem],
        group_by: &[Expr],
        order_by: &[OrderItem],
        distinct: bool,
        settings: &OptimizerSettings,
    ) -> Self {
        let mut layout = Self {
            fields: vec![],
            columns: vec![],
            key_fields: vec![],
            output: vec![],
            order_keys: vec![],
            unique_constraint: false,
            key_length: 0,
            null_bitmap_length: 0,
        };

        for expr in group_by {
            let idx = layout.push_copy(expr);
            layout.key_fields.push(idx);
        }
        for item in items {
            let idx = match item {
                SelectItem::Expr { expr, name } => {
                    let idx = layout.push_column(TmpColumn::Copy(expr.clone()), name, expr_type(expr));
                    layout.fields[idx].nullable = true;
                    idx
                }
                SelectItem::Agg { func, arg, name } => {
                    let data_type = func.result_type(arg.as_ref().map(expr_type).as_ref());
                    let idx = layout.push_column(
                        TmpColumn::Agg {
                            func: *func,
                            arg: arg.clone(),
                        },
                        name,
                        data_type,
                    );
                    layout.fields[idx].nullable = *func != AggFunc::Count;
                    idx
                }
            };
            layout.output.push(idx);
        }
        if distinct && group_by.is_empty() {
            layout.key_fields = layout.output.clone();
        }
        for item in order_by {
            let idx = layout
                .columns
                .iter()
                .position(|c| matches!(c, TmpColumn::Copy(e) if e.same_as(&item.expr)))
                .unwrap_or_else(|| layout.push_copy(&item.expr));
            layout.order_keys.push((idx, item.asc));
        }

        layout.key_length = layout
            .key_fields
            .iter()
            .map(|f| layout.fields[*f].store_length())
            .sum();
        let has_blobs = layout.key_fields.iter().any(|f| layout.fields[*f].is_blob());
        layout.unique_constraint = has_blobs || layout.key_length > settings.max_key_length;
        let nullable = layout.fields.iter().filter(|f| f.nullable).count();
        layout.null_bitmap_length = (nullable + 7) / 8;
        layout
    }

    fn push_column(&mut self, column: TmpColumn, name: &str, data_type: DataType) -> usize {
        self.fields.push(FieldDef::new(name, data_type, true));
        self.columns.push(column);
        self.fields.len() - 1
    }

    fn push_copy(&mut self, expr: &Expr) -> usize {
        self.push_column(TmpColumn::Copy(expr.clone()), &expr.to_string(), expr_type(expr))
    }

    pub fn has_key(&self) -> bool {
        !self.key_fields.is_empty()
    }

    /// Whether some field can not be held by an in-memory table.
    pub fn has_blobs(&self) -> bool {
        self.fields.iter().any(|f| f.is_blob())
    }

    pub fn reclength(&self) -> usize {
        self.null_bitmap_length + self.fields.iter().map(|f| f.pack_length()).sum::<usize>()
    }

    /// A new row from the current joined row, aggregates started with it.
    pub fn init_row(&self, src: &dyn RowSource) -> Row {
        self.columns
            .iter()
            .zip(&self.fields)
            .map(|(column, field)| match column {
                TmpColumn::Copy(expr) => expr.eval(src).clone(),
                TmpColumn::Agg { func, arg } => {
                    func.init(arg.as_ref().map(|a| a.eval(src)), &field.data_type)
                }
            })
            .collect()
    }

    /// Folds the current joined row into the aggregates of `row`.
    pub fn update_row(&self, row: &mut Row, src: &dyn RowSource) {
        for (column, value) in self.columns.iter().zip(row.iter_mut()) {
            if let TmpColumn::Agg { func, arg } = column {
                func.update(value, arg.as_ref().map(|a| a.eval(src)));
            }
        }
    }

    /// Image of the key of `row`.
    pub fn key_image(&self, row: &Row) -> StorageResult<Vec<u8>> {
        if self.unique_constraint {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};

            let mut hasher = DefaultHasher::new();
            for f in &self.key_fields {
                // NULLs of every type are one group.
                let value = &row[*f];
                value.is_null().hash(&mut hasher);
                if !value.is_null() {
                    value.hash(&mut hasher);
                }
            }
            return Ok(hasher.finish().to_be_bytes().to_vec());
        }
        let mut image = Vec::with_capacity(self.key_length);
        for f in &self.key_fields {
            encode_key_part(&self.fields[*f], &row[*f], &mut image)?;
        }
        Ok(image)
    }

    /// Whether two rows have the same key values.
    pub fn same_key(&self, a: &Row, b: &Row) -> bool {
        self.key_fields
            .iter()
            .all(|f| crate::value::group_eq(&a[*f], &b[*f]))
    }

    /// The select list values of a stored row.
    pub fn finish(&self, row: &Row) -> Row {
        self.output.iter().map(|f| row[*f].clone()).collect()
    }

    pub fn sort_key(&self, row: &Row) -> Row {
        self.order_keys.iter().map(|(f, _)| row[*f].clone()).collect()
    }

    /// Value of a field of a table with no rows.
    pub fn empty_value(&self, field: usize) -> ScalarValue {
        match &self.columns[field] {
            TmpColumn::Agg { func, .. } => func.empty(&self.fields[field].data_type),
            TmpColumn::Copy(_) => crate::value::null_of(&self.fields[field].data_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::context::OptimizerSettings;
    use crate::order::OrderItem;
    use crate::predicate::test_util::field;
    use crate::predicate::{Expr, FieldItem};
    use crate::catalog::ColumnRef;
    use crate::select::{AggFunc, SelectItem};
    use crate::tmp_table::{TmpColumn, TmpTableLayout};

    #[test]
    fn test_group_layout() {
        let items = vec![
            SelectItem::expr(field(0, 1, "b", true)),
            SelectItem::count_star(),
            SelectItem::agg(AggFunc::Sum, field(0, 2, "c", true)),
        ];
        let layout = TmpTableLayout::build(
            &items,
            &[field(0, 0, "a", false)],
            &[OrderItem::desc(field(0, 1, "b", true))],
            false,
            &OptimizerSettings::default(),
        );
        assert_eq!(vec![0], layout.key_fields);
        assert_eq!(vec![1, 2, 3], layout.output);
        // ORDER BY b reuses the select list field.
        assert_eq!(vec![(1, false)], layout.order_keys);
        assert_eq!(9, layout.key_length);
        assert!(!layout.unique_constraint);
        assert!(!layout.fields[2].nullable);
        assert_eq!(DataType::Int64, layout.fields[3].data_type);
        assert_eq!(
            TmpColumn::Agg {
                func: AggFunc::Count,
                arg: None
            },
            layout.columns[2]
        );
    }

    #[test]
    fn test_distinct_with_long_key_uses_unique_constraint() {
        let text = Expr::Field(FieldItem::new(ColumnRef::new(0, 0), "t0.s", DataType::Utf8, true));
        let items = vec![SelectItem::expr(text), SelectItem::expr(field(0, 1, "b", true))];
        let settings = OptimizerSettings {
            max_key_length: 16,
            ..Default::default()
        };
        let layout = TmpTableLayout::build(&items, &[], &[OrderItem::asc(field(0, 2, "c", true))], true, &settings);
        assert_eq!(vec![0, 1], layout.key_fields);
        assert_eq!(vec![(2, true)], layout.order_keys);
        assert_eq!(33 + 9, layout.key_length);
        assert!(layout.unique_constraint);
    }

    #[test]
    fn test_hashed_key_groups_nulls_of_any_type() {
        let text = Expr::Field(FieldItem::new(ColumnRef::new(0, 0), "t0.s", DataType::Utf8, true));
        let items = vec![SelectItem::expr(text), SelectItem::expr(field(0, 1, "b", true))];
        let settings = OptimizerSettings {
            max_key_length: 16,
            ..Default::default()
        };
        let layout = TmpTableLayout::build(&items, &[], &[], true, &settings);
        assert!(layout.unique_constraint);

        let s = ScalarValue::Utf8(Some("x".to_string()));
        let typed = vec![s.clone(), ScalarValue::Int64(None)];
        let untyped = vec![s.clone(), ScalarValue::Null];
        let other = vec![s, ScalarValue::Int64(Some(0))];
        assert_eq!(layout.key_image(&typed).unwrap(), layout.key_image(&untyped).unwrap());
        assert_ne!(layout.key_image(&typed).unwrap(), layout.key_image(&other).unwrap());
    }
}
