//! WAL record frames.
//!
//! On disk each record is a frame:
//!
//! ```text
//! lsn: u64 LE || type: u8 || txn_id: u64 LE || length: u32 LE || payload
//! ```

use crate::error::WalError;
use crate::types::{Lsn, TxnId};

/// Fixed bytes before a frame's payload.
pub const FRAME_HEADER_SIZE: usize = 8 + 1 + 8 + 4;

/// Discriminant values for WAL record types stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    Insert = 4,
    Update = 5,
    Delete = 6,
    Checkpoint = 7,
}

impl WalRecordType {
    pub fn from_u8(value: u8) -> Result<Self, WalError> {
        match value {
            1 => Ok(WalRecordType::Begin),
            2 => Ok(WalRecordType::Commit),
            3 => Ok(WalRecordType::Abort),
            4 => Ok(WalRecordType::Insert),
            5 => Ok(WalRecordType::Update),
            6 => Ok(WalRecordType::Delete),
            7 => Ok(WalRecordType::Checkpoint),
            other => Err(WalError::CorruptedRecord(format!(
                "invalid record type discriminant: {other}"
            ))),
        }
    }
}

/// A single write-ahead log record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub record_type: WalRecordType,
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Total frame size on disk.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Append the on-disk frame for this record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.push(self.record_type as u8);
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }
}

/// Decode the next frame from `buf` at `*offset`, advancing the offset.
///
/// Returns `Ok(None)` at a clean end of stream *or* at a torn tail (a
/// partial frame left by a crash mid-append); a torn tail is indistinguishable
/// from the log simply ending there, and recovery treats both as the end.
/// A structurally complete frame with an invalid type byte is real
/// corruption and errors.
pub fn decode_next(buf: &[u8], offset: &mut usize) -> Result<Option<WalRecord>, WalError> {
    let remaining = buf.len() - *offset;
    if remaining < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let base = *offset;
    let lsn = u64::from_le_bytes(buf[base..base + 8].try_into().unwrap());
    let type_byte = buf[base + 8];
    let txn_id = u64::from_le_bytes(buf[base + 9..base + 17].try_into().unwrap());
    let length = u32::from_le_bytes(buf[base + 17..base + 21].try_into().unwrap()) as usize;

    if remaining < FRAME_HEADER_SIZE + length {
        // Torn tail: the header landed but the payload did not.
        return Ok(None);
    }

    let record_type = WalRecordType::from_u8(type_byte)?;
    let payload = buf[base + 21..base + 21 + length].to_vec();
    *offset = base + FRAME_HEADER_SIZE + length;

    Ok(Some(WalRecord {
        record_type,
        lsn,
        txn_id,
        payload,
    }))
}
