//! Tuple record format.
//!
//! ```text
//! [0..8]   row_id: u64 LE
//! [8..16]  txn_id: u64 LE
//! [16..24] timestamp: u64 LE
//! [24]     deleted: u8 (0/1)
//! [25..29] column_count: u32 LE
//! then column_count times:
//!          name_len: u32 LE || name utf8 bytes || value encoding
//! ```
//!
//! Columns are encoded in map order (the column map is a `BTreeMap`), so
//! encoding is deterministic for a given tuple.

use std::collections::BTreeMap;

use crate::error::StorageError;
use crate::types::Tuple;

use super::value::{decode_value, encode_value};

/// Byte offset of the tombstone flag within an encoded tuple.
///
/// Flipping this single byte toggles `deleted` without changing the record
/// length, which is what keeps in-page tombstoning free-space neutral.
pub const TUPLE_DELETED_OFFSET: usize = 24;

/// Serialize a tuple into its record form.
pub fn encode_tuple(tuple: &Tuple) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&tuple.row_id.to_le_bytes());
    out.extend_from_slice(&tuple.txn_id.to_le_bytes());
    out.extend_from_slice(&tuple.timestamp.to_le_bytes());
    out.push(u8::from(tuple.deleted));
    out.extend_from_slice(&(tuple.columns.len() as u32).to_le_bytes());
    for (name, value) in &tuple.columns {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        encode_value(value, &mut out);
    }
    out
}

/// Deserialize a tuple record. The whole buffer must be consumed.
pub fn decode_tuple(buf: &[u8]) -> Result<Tuple, StorageError> {
    if buf.len() < 29 {
        return Err(StorageError::CorruptedPage(format!(
            "tuple record too short: {} bytes",
            buf.len()
        )));
    }

    let row_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let txn_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let timestamp = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let deleted = buf[TUPLE_DELETED_OFFSET] != 0;
    let column_count = u32::from_le_bytes(buf[25..29].try_into().unwrap());

    let mut offset = 29;
    let mut columns = BTreeMap::new();
    for _ in 0..column_count {
        let end = offset + 4;
        let len_bytes = buf
            .get(offset..end)
            .ok_or_else(|| truncated("column name length", offset))?;
        let name_len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        offset = end;

        let end = offset + name_len;
        let name_bytes = buf
            .get(offset..end)
            .ok_or_else(|| truncated("column name", offset))?;
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|e| {
            StorageError::CorruptedPage(format!("invalid utf8 in column name: {e}"))
        })?;
        offset = end;

        let value = decode_value(buf, &mut offset)?;
        columns.insert(name, value);
    }

    if offset != buf.len() {
        return Err(StorageError::CorruptedPage(format!(
            "trailing bytes after tuple: {} of {}",
            buf.len() - offset,
            buf.len()
        )));
    }

    Ok(Tuple {
        row_id,
        txn_id,
        timestamp,
        deleted,
        columns,
    })
}

fn truncated(what: &str, offset: usize) -> StorageError {
    StorageError::CorruptedPage(format!("truncated {what} at offset {offset}"))
}
