//! Order preserving key images.
//!
//! Every key part has a fixed width: a null indicator byte for nullable fields (`0` for NULL,
//! `1` otherwise) followed by [`FieldDef::pack_length`] value bytes. Comparing two images byte
//! by byte gives the index order with NULLs first, and a prefix of key parts is a byte prefix
//! of the image.

use arrow_schema::DataType;
use datafusion_common::ScalarValue;

use crate::catalog::{FieldDef, TableDef};
use crate::storage::{Row, StorageError, StorageResult};
use crate::value::{as_bytes, as_f64, as_i128};

pub const NULL_INDICATOR: u8 = 0;
pub const VALUE_INDICATOR: u8 = 1;

/// Appends the image of `value` stored in a key part over `field`.
pub fn encode_key_part(
    field: &FieldDef,
    value: &ScalarValue,
    out: &mut Vec<u8>,
) -> StorageResult<()> {
    let width = field.pack_length();
    if value.is_null() {
        if field.nullable {
            out.push(NULL_INDICATOR);
        }
        out.resize(out.len() + width, 0);
        return Ok(());
    }
    if field.nullable {
        out.push(VALUE_INDICATOR);
    }

    let unsupported = || StorageError::UnsupportedKeyValue {
        value: value.to_string(),
        data_type: field.data_type.to_string(),
    };
    match &field.data_type {
        DataType::Float32 | DataType::Float64 => {
            let v = as_f64(value).ok_or_else(unsupported)?;
            if width == 4 {
                out.extend_from_slice(&order_f32(v as f32).to_be_bytes());
            } else {
                put_fixed(out, &order_f64(v).to_be_bytes(), width);
            }
        }
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            let v = as_i128(value).ok_or_else(unsupported)?.max(0) as u128;
            put_fixed(out, &v.to_be_bytes(), width);
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Binary | DataType::LargeBinary => {
            let bytes = as_bytes(value).ok_or_else(unsupported)?;
            let take = bytes.len().min(width);
            out.extend_from_slice(&bytes[..take]);
            out.resize(out.len() + width - take, 0);
        }
        _ => {
            let v = as_i128(value).ok_or_else(unsupported)?;
            let bits = (width * 8) as u32;
            let (min, max) = (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1);
            let biased = (v.clamp(min, max) - min) as u128;
            put_fixed(out, &biased.to_be_bytes(), width);
        }
    }
    Ok(())
}

/// Whether `value` is stored in `field` without truncation.
pub fn fits_field(field: &FieldDef, value: &ScalarValue) -> bool {
    as_bytes(value).map_or(true, |bytes| bytes.len() <= field.pack_length())
}

/// Image of the first `parts` key parts of `key`, taken from a table row.
pub fn encode_row_key(def: &TableDef, key: usize, parts: usize, row: &Row) -> StorageResult<Vec<u8>> {
    let mut out = Vec::with_capacity(def.key_prefix_length(key, parts));
    for field_nr in &def.keys[key].parts[..parts] {
        encode_key_part(&def.fields[*field_nr], &row[*field_nr], &mut out)?;
    }
    Ok(out)
}

fn put_fixed(out: &mut Vec<u8>, be_bytes: &[u8], width: usize) {
    let skip = be_bytes.len().saturating_sub(width);
    out.resize(out.len() + width.saturating_sub(be_bytes.len()), 0);
    out.extend_from_slice(&be_bytes[skip..]);
}

fn order_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn order_f32(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits >> 31 == 1 {
        !bits
    } else {
        bits | (1 << 31)
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use datafusion_common::ScalarValue;

    use crate::catalog::FieldDef;
    use crate::storage::encode_key_part;

    fn image(field: &FieldDef, value: ScalarValue) -> Vec<u8> {
        let mut out = vec![];
        encode_key_part(field, &value, &mut out).unwrap();
        out
    }

    #[test]
    fn test_integer_order() {
        let f = FieldDef::new("a", DataType::Int32, true);
        let values = [None, Some(-300), Some(-1), Some(0), Some(7), Some(1 << 20)];
        let images: Vec<_> = values
            .iter()
            .map(|v| image(&f, ScalarValue::Int32(*v)))
            .collect();
        assert!(images.windows(2).all(|w| w[0] < w[1]));
        assert!(images.iter().all(|i| i.len() == 5));
    }

    #[test]
    fn test_float_order() {
        let f = FieldDef::new("a", DataType::Float64, false);
        let a = image(&f, ScalarValue::Float64(Some(-2.5)));
        let b = image(&f, ScalarValue::Float64(Some(-0.5)));
        let c = image(&f, ScalarValue::Float64(Some(3.0)));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_string_is_padded() {
        let f = FieldDef::new("s", DataType::Utf8, false).with_length(4);
        assert_eq!(b"ab\0\0".to_vec(), image(&f, ScalarValue::from("ab")));
        assert_eq!(b"abcd".to_vec(), image(&f, ScalarValue::from("abcdef")));
    }
}
