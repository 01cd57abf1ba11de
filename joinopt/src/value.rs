//! Comparison and conversion of [`ScalarValue`]s across numeric widths.

use std::cmp::Ordering;

use arrow_schema::DataType;
use datafusion_common::ScalarValue;

/// Broad comparison class of a value or a column type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueClass {
    Integer,
    Real,
    String,
    Binary,
    Boolean,
    Other,
}

impl ValueClass {
    pub fn of_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date32
            | DataType::Date64 => ValueClass::Integer,
            DataType::Float32 | DataType::Float64 => ValueClass::Real,
            DataType::Utf8 | DataType::LargeUtf8 => ValueClass::String,
            DataType::Binary | DataType::LargeBinary => ValueClass::Binary,
            DataType::Boolean => ValueClass::Boolean,
            _ => ValueClass::Other,
        }
    }

    pub fn of_value(value: &ScalarValue) -> Self {
        Self::of_type(&value.get_datatype())
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueClass::Integer | ValueClass::Real)
    }

    /// Whether values of the two classes can be compared with each other.
    pub fn comparable(&self, other: &ValueClass) -> bool {
        self == other || (self.is_numeric() && other.is_numeric())
    }
}

pub fn as_i128(value: &ScalarValue) -> Option<i128> {
    match value {
        ScalarValue::Int8(Some(v)) => Some(*v as i128),
        ScalarValue::Int16(Some(v)) => Some(*v as i128),
        ScalarValue::Int32(Some(v)) => Some(*v as i128),
        ScalarValue::Int64(Some(v)) => Some(*v as i128),
        ScalarValue::UInt8(Some(v)) => Some(*v as i128),
        ScalarValue::UInt16(Some(v)) => Some(*v as i128),
        ScalarValue::UInt32(Some(v)) => Some(*v as i128),
        ScalarValue::UInt64(Some(v)) => Some(*v as i128),
        ScalarValue::Date32(Some(v)) => Some(*v as i128),
        ScalarValue::Date64(Some(v)) => Some(*v as i128),
        ScalarValue::Boolean(Some(v)) => Some(*v as i128),
        _ => None,
    }
}

pub fn as_f64(value: &ScalarValue) -> Option<f64> {
    match value {
        ScalarValue::Float32(Some(v)) => Some(*v as f64),
        ScalarValue::Float64(Some(v)) => Some(*v),
        other => as_i128(other).map(|v| v as f64),
    }
}

pub fn as_str(value: &ScalarValue) -> Option<&str> {
    match value {
        ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) => Some(v.as_str()),
        _ => None,
    }
}

pub fn as_bytes(value: &ScalarValue) -> Option<&[u8]> {
    match value {
        ScalarValue::Binary(Some(v)) | ScalarValue::LargeBinary(Some(v)) => Some(v.as_slice()),
        ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) => Some(v.as_bytes()),
        _ => None,
    }
}

/// SQL comparison: `None` when either side is NULL or the values are not comparable.
pub fn compare_values(left: &ScalarValue, right: &ScalarValue) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    let (lc, rc) = (ValueClass::of_value(left), ValueClass::of_value(right));
    match (lc, rc) {
        (ValueClass::Integer, ValueClass::Integer) | (ValueClass::Boolean, ValueClass::Boolean) => {
            Some(as_i128(left)?.cmp(&as_i128(right)?))
        }
        (l, r) if l.is_numeric() && r.is_numeric() => as_f64(left)?.partial_cmp(&as_f64(right)?),
        (ValueClass::String, ValueClass::String) => Some(as_str(left)?.cmp(as_str(right)?)),
        (ValueClass::Binary, ValueClass::Binary) => Some(as_bytes(left)?.cmp(as_bytes(right)?)),
        _ => left.partial_cmp(right),
    }
}

pub fn values_equal(left: &ScalarValue, right: &ScalarValue) -> Option<bool> {
    compare_values(left, right).map(|o| o == Ordering::Equal)
}

/// Total order used by sorting: NULL first, then SQL order; incomparable values tie.
pub fn sort_cmp(left: &ScalarValue, right: &ScalarValue) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
    }
}

/// Whether two values are the same for grouping and DISTINCT: NULLs are equal to each other.
pub fn group_eq(left: &ScalarValue, right: &ScalarValue) -> bool {
    match (left.is_null(), right.is_null()) {
        (true, true) => true,
        (false, false) => values_equal(left, right).unwrap_or(false),
        _ => false,
    }
}

pub fn null_of(data_type: &DataType) -> ScalarValue {
    ScalarValue::try_from(data_type).unwrap_or(ScalarValue::Null)
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use datafusion_common::ScalarValue;

    use crate::value::{compare_values, group_eq, sort_cmp};

    #[test]
    fn test_compare_across_widths() {
        assert_eq!(
            Some(Ordering::Less),
            compare_values(&ScalarValue::Int32(Some(3)), &ScalarValue::Int64(Some(4)))
        );
        assert_eq!(
            Some(Ordering::Equal),
            compare_values(&ScalarValue::Int64(Some(2)), &ScalarValue::Float64(Some(2.0)))
        );
        assert_eq!(
            None,
            compare_values(&ScalarValue::Int64(None), &ScalarValue::Int64(Some(4)))
        );
    }

    #[test]
    fn test_null_ordering() {
        assert_eq!(
            Ordering::Less,
            sort_cmp(&ScalarValue::Int64(None), &ScalarValue::Int64(Some(-5)))
        );
        assert!(group_eq(&ScalarValue::Utf8(None), &ScalarValue::Utf8(None)));
        assert!(!group_eq(&ScalarValue::Utf8(None), &ScalarValue::from("")));
    }
}
