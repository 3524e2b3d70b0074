//! MySQL binary JSON decoding
//!
//! JSON columns are stored in the binlog in MySQL's binary format: a type
//! byte followed by the value. Objects and arrays come in a small (2 byte
//! offsets) and a large (4 byte offsets) layout; small scalars are stored
//! inline in the value entry.
//!
//! | type | value              |
//! |------|--------------------|
//! | 0x00 | small object       |
//! | 0x01 | large object       |
//! | 0x02 | small array        |
//! | 0x03 | large array        |
//! | 0x04 | literal            |
//! | 0x05 | int16              |
//! | 0x06 | uint16             |
//! | 0x07 | int32              |
//! | 0x08 | uint32             |
//! | 0x09 | int64              |
//! | 0x0a | uint64             |
//! | 0x0b | double             |
//! | 0x0c | utf8 string        |
//! | 0x0f | opaque             |

use crate::common::{CanalError, Result};
use serde_json::Value;

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

/// Decode a binary JSON column value.
///
/// Some servers store plain UTF-8 JSON text (e.g. after partial updates are
/// disabled), so a failed binary decode falls back to parsing text.
pub fn decode_json(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    match parse_typed(data[0], &data[1..]) {
        Ok(v) => Ok(v),
        Err(_) => match serde_json::from_slice(data) {
            Ok(v) => Ok(v),
            Err(_) => Ok(Value::String(String::from_utf8_lossy(data).into_owned())),
        },
    }
}

fn truncated(what: &str) -> CanalError {
    CanalError::protocol(format!("truncated JSON {}", what))
}

fn read_uint(data: &[u8], offset: usize, width: usize) -> Result<u64> {
    let bytes = data
        .get(offset..offset + width)
        .ok_or_else(|| truncated("integer"))?;
    Ok(bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn parse_typed(type_byte: u8, data: &[u8]) -> Result<Value> {
    match type_byte {
        SMALL_OBJECT => parse_container(data, false, true),
        LARGE_OBJECT => parse_container(data, true, true),
        SMALL_ARRAY => parse_container(data, false, false),
        LARGE_ARRAY => parse_container(data, true, false),
        LITERAL => Ok(literal(u64::from(*data.first().unwrap_or(&0)))),
        INT16 => Ok(Value::from(read_uint(data, 0, 2)? as u16 as i16)),
        UINT16 => Ok(Value::from(read_uint(data, 0, 2)? as u16)),
        INT32 => Ok(Value::from(read_uint(data, 0, 4)? as u32 as i32)),
        UINT32 => Ok(Value::from(read_uint(data, 0, 4)? as u32)),
        INT64 => Ok(Value::from(read_uint(data, 0, 8)? as i64)),
        UINT64 => Ok(Value::from(read_uint(data, 0, 8)?)),
        DOUBLE => {
            let bits = read_uint(data, 0, 8)?;
            Ok(serde_json::Number::from_f64(f64::from_bits(bits))
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        STRING => {
            let (len, prefix) = read_variable_length(data)?;
            let bytes = data
                .get(prefix..prefix + len)
                .ok_or_else(|| truncated("string"))?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => {
            // field type byte, then a length-prefixed payload
            let rest = data.get(1..).ok_or_else(|| truncated("opaque"))?;
            let (len, prefix) = read_variable_length(rest)?;
            let bytes = rest
                .get(prefix..prefix + len)
                .ok_or_else(|| truncated("opaque"))?;
            Ok(match std::str::from_utf8(bytes) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => Value::String(hex::encode(bytes)),
            })
        }
        other => Err(CanalError::protocol(format!(
            "unknown JSON value type 0x{:02x}",
            other
        ))),
    }
}

fn literal(code: u64) -> Value {
    match code {
        0x01 => Value::Bool(true),
        0x02 => Value::Bool(false),
        _ => Value::Null,
    }
}

/// Objects and arrays share a layout: element count, byte size, (key
/// entries for objects), value entries, then the keys and values themselves.
fn parse_container(data: &[u8], large: bool, is_object: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_uint(data, 0, offset_size)? as usize;
    let header_size = offset_size * 2;

    let key_entry_size = offset_size + 2;
    let value_entry_size = offset_size + 1;
    let value_entries_start = if is_object {
        header_size.saturating_add(count.saturating_mul(key_entry_size))
    } else {
        header_size
    };

    // the count is untrusted; all entries must fit before allocating
    let entries_end = value_entries_start.saturating_add(count.saturating_mul(value_entry_size));
    if entries_end > data.len() {
        return Err(truncated("container entries"));
    }

    let mut values = Vec::with_capacity(count.min(data.len() / value_entry_size));
    for i in 0..count {
        let entry = value_entries_start + i * value_entry_size;
        let value_type = *data.get(entry).ok_or_else(|| truncated("value entry"))?;
        values.push(resolve_value(data, value_type, entry + 1, large)?);
    }

    if !is_object {
        return Ok(Value::Array(values));
    }

    let mut map = serde_json::Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let entry = header_size + i * key_entry_size;
        let key_offset = read_uint(data, entry, offset_size)? as usize;
        let key_len = read_uint(data, entry + offset_size, 2)? as usize;
        let key = data
            .get(key_offset..key_offset + key_len)
            .ok_or_else(|| truncated("key"))?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(Value::Object(map))
}

/// Inline scalars live in the offset field; everything else is referenced by
/// an offset relative to the start of the containing object or array.
fn resolve_value(data: &[u8], type_byte: u8, field: usize, large: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    match type_byte {
        LITERAL => return Ok(literal(read_uint(data, field, 2)?)),
        INT16 => return Ok(Value::from(read_uint(data, field, 2)? as u16 as i16)),
        UINT16 => return Ok(Value::from(read_uint(data, field, 2)? as u16)),
        INT32 if large => return Ok(Value::from(read_uint(data, field, 4)? as u32 as i32)),
        UINT32 if large => return Ok(Value::from(read_uint(data, field, 4)? as u32)),
        _ => {}
    }

    let offset = read_uint(data, field, offset_size)? as usize;
    let value = data.get(offset..).ok_or_else(|| truncated("value offset"))?;
    parse_typed(type_byte, value)
}

/// Lengths use 7 bits per byte, high bit set on all but the last byte.
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for (i, b) in data.iter().take(5).enumerate() {
        length |= usize::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(truncated("variable-length integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literals() {
        assert_eq!(decode_json(&[0x04, 0x00]).unwrap(), Value::Null);
        assert_eq!(decode_json(&[0x04, 0x01]).unwrap(), json!(true));
        assert_eq!(decode_json(&[0x04, 0x02]).unwrap(), json!(false));
        assert_eq!(decode_json(&[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_scalars() {
        assert_eq!(decode_json(&[0x05, 0xFE, 0xFF]).unwrap(), json!(-2));
        assert_eq!(decode_json(&[0x06, 42, 0]).unwrap(), json!(42));

        let mut data = vec![0x0b];
        data.extend_from_slice(&3.125f64.to_le_bytes());
        assert_eq!(decode_json(&data).unwrap(), json!(3.125));

        let mut data = vec![0x0c, 5];
        data.extend_from_slice(b"hello");
        assert_eq!(decode_json(&data).unwrap(), json!("hello"));
    }

    #[test]
    fn test_small_object() {
        // {"a": 1, "bc": "x"}
        // header: count=2, size
        // key entries at 4: (offset u16, len u16) x2
        // value entries at 12: (type u8, offset u16) x2
        // keys at 18: "a" "bc", string value at 21: len 1 "x"
        let mut data = vec![0x00];
        let body: Vec<u8> = vec![
            2, 0, 23, 0, // count, size
            18, 0, 1, 0, // key "a"
            19, 0, 2, 0, // key "bc"
            0x05, 1, 0, // int16 inline 1
            0x0c, 21, 0, // string at 21
            b'a', b'b', b'c', // keys
            1, b'x', // string
        ];
        data.extend_from_slice(&body);
        assert_eq!(decode_json(&data).unwrap(), json!({"a": 1, "bc": "x"}));
    }

    #[test]
    fn test_small_array() {
        // [true, 7]
        let data = vec![0x02, 2, 0, 10, 0, 0x04, 1, 0, 0x05, 7, 0];
        assert_eq!(decode_json(&data).unwrap(), json!([true, 7]));
    }

    #[test]
    fn test_oversized_element_count_is_rejected() {
        // large array claiming u32::MAX elements in 8 bytes
        let body = [0xFF, 0xFF, 0xFF, 0xFF, 8, 0, 0, 0];
        let err = parse_container(&body, true, false).unwrap_err();
        assert!(matches!(err, CanalError::Protocol(_)), "{:?}", err);
        assert!(parse_container(&body, true, true).is_err());

        let mut data = vec![LARGE_ARRAY];
        data.extend_from_slice(&body);
        assert!(matches!(decode_json(&data).unwrap(), Value::String(_)));
    }

    #[test]
    fn test_plain_text_fallback() {
        let data = b"{\"key\": \"value\"}";
        assert_eq!(decode_json(data).unwrap(), json!({"key": "value"}));
    }

    #[test]
    fn test_variable_length() {
        assert_eq!(read_variable_length(&[0x05]).unwrap(), (5, 1));
        assert_eq!(read_variable_length(&[0x80 | 0x01, 0x01]).unwrap(), (129, 2));
        assert!(read_variable_length(&[0x80]).is_err());
    }
}
