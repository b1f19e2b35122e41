//! Binary format of WAL records
//!
//! Every record is a fixed header followed by its payload:
//! RecordHeader (32 bytes) + key_len(u16) + value_len(u32) + kind(u8) + padding(u8) + key_bytes + value_bytes
//!
//! The header's CRC32C covers the whole payload, so a flipped bit anywhere in
//! the key or value is caught at replay time.

use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};

/// Magic bytes that open every record: "SPOL" in ASCII
pub const MAGIC_ARRAY: [u8; 4] = [0x53, 0x50, 0x4F, 0x4C];

/// Hard ceiling on key size, fixed by the u16 length field
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Hard ceiling on value size (128MB)
pub const MAX_VALUE_SIZE: usize = 128 * 1024 * 1024;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Fixed part of the payload ahead of the key bytes
const PAYLOAD_PREFIX: usize = 8;

/// What a WAL record does to the table on replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordKind::Put),
            2 => Some(RecordKind::Delete),
            _ => None,
        }
    }
}

/// Fixed-size header for each WAL record
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "SPOL"
///   [4..8]   length:   u32    - payload length in bytes
///   [8..12]  checksum: u32    - CRC32C of payload bytes
///   [12]     kind:     u8     - record kind
///   [13..32] reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Magic bytes for record identification and resync after corruption
    pub magic: [u8; 4],
    /// Total length of the payload (excluding this header)
    pub length: u32,
    /// CRC32C checksum of the payload bytes
    pub checksum: u32,
    /// Record kind (Put=1 or Delete=2)
    pub kind: u8,
}

impl RecordHeader {
    pub fn new(length: u32, checksum: u32, kind: RecordKind) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            kind: kind as u8,
        }
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.kind;
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            kind: bytes[12],
        }
    }
}

/// A decoded WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub kind: RecordKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Encode one record. Sizes are checked against the format ceilings before
/// anything is allocated.
pub fn encode_record(key: &[u8], value: &[u8], kind: RecordKind) -> EngineResult<Vec<u8>> {
    if key.len() > MAX_KEY_SIZE {
        return Err(EngineError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(EngineError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value".to_string(),
        });
    }

    let payload_size = PAYLOAD_PREFIX + key.len() + value.len();
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.extend_from_slice(&[0u8; HEADER_SIZE]);
    buffer.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.push(kind as u8);
    buffer.push(0);
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    let checksum = crc32c::crc32c(&buffer[HEADER_SIZE..]);
    let header = RecordHeader::new(payload_size as u32, checksum, kind);
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    Ok(buffer)
}

/// Decode one record from the start of `data`. `path` is only used for error context.
pub fn decode_record(data: &[u8], path: &std::path::Path) -> EngineResult<WalRecord> {
    let at = || PathBuf::from(path);

    let header_bytes: &[u8; HEADER_SIZE] = data
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| EngineError::WalCorrupted {
            path: at(),
            offset: 0,
            reason: format!("Record too short: {} bytes, need at least {}", data.len(), HEADER_SIZE),
        })?;
    let header = RecordHeader::from_bytes(header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(EngineError::NoMagicFound {
            path: at(),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(EngineError::TornWrite {
            path: at(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }
    let payload = &data[HEADER_SIZE..payload_end];

    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(EngineError::ChecksumMismatch {
            path: at(),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    if payload.len() < PAYLOAD_PREFIX {
        return Err(EngineError::WalCorrupted {
            path: at(),
            offset: HEADER_SIZE as u64,
            reason: "Payload too short for length fields".to_string(),
        });
    }

    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let kind = RecordKind::from_byte(payload[6]).ok_or_else(|| EngineError::WalCorrupted {
        path: at(),
        offset: (HEADER_SIZE + 6) as u64,
        reason: format!("Invalid record kind: {}", payload[6]),
    })?;

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;
    if payload.len() < value_end {
        return Err(EngineError::WalCorrupted {
            path: at(),
            offset: HEADER_SIZE as u64,
            reason: format!(
                "Payload too short: need {} bytes for key({}) + value({})",
                value_end, key_len, value_len
            ),
        });
    }

    Ok(WalRecord {
        kind,
        key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
    })
}
