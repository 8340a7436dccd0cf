//! Tagged scalar encoding.
//!
//! A serialized value is a tag byte followed by a type-specific payload:
//!
//! ```text
//! null      -> tag 0,  no payload
//! bool      -> tag 1,  1 byte (0/1)
//! i64       -> tag 5,  8 bytes LE
//! f64       -> tag 7,  8 bytes (IEEE-754 bit pattern, LE)
//! text      -> tag 8,  len:u32 LE || utf8 bytes
//! binary    -> tag 9,  len:u32 LE || raw bytes
//! timestamp -> tag 10, 8 bytes LE
//! json      -> tag 11, len:u32 LE || utf8 JSON text
//! ```
//!
//! The sparse tag values are part of the on-disk format and must not be
//! renumbered.

use crate::error::StorageError;
use crate::types::Value;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 5;
const TAG_FLOAT: u8 = 7;
const TAG_TEXT: u8 = 8;
const TAG_BINARY: u8 = 9;
const TAG_TIMESTAMP: u8 = 10;
const TAG_JSON: u8 = 11;

/// Append the serialized form of `value` to `out`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            push_bytes(out, s.as_bytes());
        }
        Value::Binary(b) => {
            out.push(TAG_BINARY);
            push_bytes(out, b);
        }
        Value::Timestamp(t) => {
            out.push(TAG_TIMESTAMP);
            out.extend_from_slice(&t.to_le_bytes());
        }
        Value::Json(j) => {
            out.push(TAG_JSON);
            // serde_json never fails on a Value tree.
            let text = serde_json::to_vec(j).unwrap_or_default();
            push_bytes(out, &text);
        }
    }
}

/// Decode one value from `buf` starting at `*offset`, advancing the offset
/// past the consumed bytes.
pub fn decode_value(buf: &[u8], offset: &mut usize) -> Result<Value, StorageError> {
    let tag = *buf
        .get(*offset)
        .ok_or_else(|| truncated("value tag", *offset))?;
    *offset += 1;

    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => {
            let b = *buf
                .get(*offset)
                .ok_or_else(|| truncated("bool payload", *offset))?;
            *offset += 1;
            Ok(Value::Bool(b != 0))
        }
        TAG_INT => Ok(Value::Int(i64::from_le_bytes(take8(buf, offset)?))),
        TAG_FLOAT => Ok(Value::Float(f64::from_le_bytes(take8(buf, offset)?))),
        TAG_TEXT => {
            let bytes = take_prefixed(buf, offset)?;
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|e| StorageError::CorruptedPage(format!("invalid utf8 in text: {e}")))?;
            Ok(Value::Text(text))
        }
        TAG_BINARY => Ok(Value::Binary(take_prefixed(buf, offset)?.to_vec())),
        TAG_TIMESTAMP => Ok(Value::Timestamp(u64::from_le_bytes(take8(buf, offset)?))),
        TAG_JSON => {
            let bytes = take_prefixed(buf, offset)?;
            let json = serde_json::from_slice(bytes)
                .map_err(|e| StorageError::CorruptedPage(format!("invalid json payload: {e}")))?;
            Ok(Value::Json(json))
        }
        other => Err(StorageError::CorruptedPage(format!(
            "invalid value tag: {other}"
        ))),
    }
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take8(buf: &[u8], offset: &mut usize) -> Result<[u8; 8], StorageError> {
    let end = *offset + 8;
    let slice = buf
        .get(*offset..end)
        .ok_or_else(|| truncated("8-byte payload", *offset))?;
    *offset = end;
    Ok(slice.try_into().unwrap())
}

fn take_prefixed<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8], StorageError> {
    let end = *offset + 4;
    let len_bytes = buf
        .get(*offset..end)
        .ok_or_else(|| truncated("length prefix", *offset))?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    *offset = end;
    let end = *offset + len;
    let slice = buf
        .get(*offset..end)
        .ok_or_else(|| truncated("length-prefixed payload", *offset))?;
    *offset = end;
    Ok(slice)
}

fn truncated(what: &str, offset: usize) -> StorageError {
    StorageError::CorruptedPage(format!("truncated {what} at offset {offset}"))
}
