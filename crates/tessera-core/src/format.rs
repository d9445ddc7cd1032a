//! Binary format of store file entries
//!
//! The store file is a sequence of entries, each:
//! ChunkHeader (32 bytes) + key_len(u16) + value_len(u32) + operation(u8) + padding(u8) + key_bytes + value_bytes
//!
//! Entries are grouped into batches: `Begin, (Put | Delete)*, Commit`. A batch is
//! applied only once its Commit entry has been read intact.

use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// Magic bytes identifying store entries: "TSRA" in ASCII
pub const MAGIC_ARRAY: [u8; 4] = [0x54, 0x53, 0x52, 0x41];

/// Hard cap on key size imposed by the u16 length field
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Hard cap on value size (256MB)
pub const MAX_VALUE_SIZE: usize = 256 * 1024 * 1024;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Payload prefix: key_len(2) + value_len(4) + operation(1) + padding(1)
const PAYLOAD_PREFIX: usize = 8;

/// Entry operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or replace a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
    /// Start of a batch; discards anything pending from an unfinished batch
    Begin = 3,
    /// End of a batch; the value is the modification counter after the batch (u64 LE)
    Commit = 4,
}

impl Operation {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Begin),
            4 => Some(Operation::Commit),
            _ => None,
        }
    }
}

/// Fixed-size header for each entry
/// Size: 32 bytes
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "TSRA"
///   [4..8]   length:     u32    - payload length in bytes
///   [8..12]  checksum:   u32    - CRC32C of payload bytes
///   [12]     entry_type: u8     - operation type
///   [13..16] reserved, zero
///   [16..20] header_crc: u32    - CRC32C of bytes [0..16]
///   [20..32] reserved, zero
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    /// Magic bytes for entry identification and corruption recovery
    pub magic: [u8; 4],
    /// Total length of the entry payload (excluding this header)
    pub length: u32,
    /// CRC32C checksum of the payload bytes
    pub checksum: u32,
    /// Operation type
    pub entry_type: u8,
}

/// Bytes of the header covered by its own checksum
const HEADER_CRC_SPAN: usize = 16;

/// A decoded entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub operation: Operation,
}

impl LogEntry {
    /// Sequence number carried by a Commit entry
    pub fn commit_sequence(&self) -> Option<u64> {
        if self.operation != Operation::Commit {
            return None;
        }
        let bytes: [u8; 8] = self.value.as_slice().try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, entry_type: Operation) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            entry_type: entry_type as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        let header_crc = crc32c::crc32c(&buf[..HEADER_CRC_SPAN]);
        buf[16..20].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            entry_type: bytes[12],
        }
    }
}

/// Serialize one entry, appending it to `out`.
pub fn serialize_into(out: &mut Vec<u8>, key: &[u8], value: &[u8], op: Operation) -> StoreResult<()> {
    // Validate input sizes BEFORE any allocation
    if key.len() > MAX_KEY_SIZE {
        return Err(StoreError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(StoreError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value".to_string(),
        });
    }

    let payload_size = PAYLOAD_PREFIX + key.len() + value.len();
    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.push(op as u8);
    payload.push(0);
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let checksum = crc32c::crc32c(&payload);
    let header = ChunkHeader::new(payload.len() as u32, checksum, op);

    out.reserve(HEADER_SIZE + payload_size);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Serialize a whole batch: Begin, the ops, Commit(sequence).
///
/// `None` values are deletes.
pub fn serialize_batch(ops: &[(Vec<u8>, Option<Vec<u8>>)], sequence: u64) -> StoreResult<Vec<u8>> {
    let mut buffer = Vec::new();
    serialize_into(&mut buffer, &[], &[], Operation::Begin)?;
    for (key, value) in ops {
        match value {
            Some(value) => serialize_into(&mut buffer, key, value, Operation::Put)?,
            None => serialize_into(&mut buffer, key, &[], Operation::Delete)?,
        }
    }
    serialize_into(&mut buffer, &[], &sequence.to_le_bytes(), Operation::Commit)?;
    Ok(buffer)
}

/// Deserialize an entry from the start of `data`.
///
/// `path` and `base_offset` only feed error context.
pub fn deserialize_entry(data: &[u8], path: &Path, base_offset: u64) -> StoreResult<LogEntry> {
    if data.len() < HEADER_SIZE {
        return Err(StoreError::TornWrite {
            path: path.to_path_buf(),
            expected_size: HEADER_SIZE as u32,
            available_bytes: data.len() as u64,
            offset: base_offset,
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(StoreError::NoMagicFound {
            path: path.to_path_buf(),
            offset: base_offset,
            found_bytes: header.magic,
        });
    }

    let (expected, actual) = header_checksums(&header_bytes);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
            offset: base_offset,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(StoreError::TornWrite {
            path: path.to_path_buf(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: base_offset + HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual: computed,
            offset: base_offset + HEADER_SIZE as u64,
        });
    }

    if payload.len() < PAYLOAD_PREFIX {
        return Err(StoreError::LogCorrupted {
            path: path.to_path_buf(),
            offset: base_offset,
            reason: "Payload too short for header fields".to_string(),
        });
    }

    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let operation = Operation::from_u8(payload[6]).ok_or_else(|| StoreError::LogCorrupted {
        path: path.to_path_buf(),
        offset: base_offset + HEADER_SIZE as u64 + 6,
        reason: format!("Invalid operation type: {}", payload[6]),
    })?;

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;
    if payload.len() != value_end {
        return Err(StoreError::LogCorrupted {
            path: path.to_path_buf(),
            offset: base_offset,
            reason: format!(
                "Payload length {} does not match key({}) + value({})",
                payload.len(), key_len, value_len
            ),
        });
    }

    Ok(LogEntry {
        key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
        operation,
    })
}

/// Stored and computed header checksum
fn header_checksums(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let stored = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    (stored, crc32c::crc32c(&header[..HEADER_CRC_SPAN]))
}

/// True when `data` starts with a complete entry header whose magic and
/// header checksum are intact. The length field can only be trusted then.
pub fn header_intact(data: &[u8]) -> bool {
    let Some(bytes) = data.get(..HEADER_SIZE) else {
        return false;
    };
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(bytes);
    let (stored, computed) = header_checksums(&header);
    header[0..4] == MAGIC_ARRAY && stored == computed
}

/// Total encoded size of the entry starting at `data`, if the header is present.
pub fn entry_size(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    Some(HEADER_SIZE + length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn here() -> PathBuf {
        PathBuf::from("<buffer>")
    }

    #[test]
    fn test_put_roundtrip() {
        let mut buf = Vec::new();
        serialize_into(&mut buf, b"test_key", b"test_value_data", Operation::Put).unwrap();
        let entry = deserialize_entry(&buf, &here(), 0).unwrap();

        assert_eq!(entry.key, b"test_key");
        assert_eq!(entry.value, b"test_value_data");
        assert_eq!(entry.operation, Operation::Put);
        assert_eq!(entry_size(&buf), Some(buf.len()));
    }

    #[test]
    fn test_batch_layout() {
        let ops = vec![
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), None),
        ];
        let buf = serialize_batch(&ops, 42).unwrap();

        let mut offset = 0;
        let mut kinds = Vec::new();
        let mut last = None;
        while offset < buf.len() {
            let size = entry_size(&buf[offset..]).unwrap();
            let entry = deserialize_entry(&buf[offset..offset + size], &here(), offset as u64).unwrap();
            kinds.push(entry.operation);
            last = Some(entry);
            offset += size;
        }

        assert_eq!(kinds, vec![Operation::Begin, Operation::Put, Operation::Delete, Operation::Commit]);
        assert_eq!(last.unwrap().commit_sequence(), Some(42));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; MAX_KEY_SIZE + 1];
        let result = serialize_into(&mut Vec::new(), &key, b"val", Operation::Put);
        assert!(matches!(result, Err(StoreError::OversizedEntry { component, .. }) if component == "key"));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = Vec::new();
        serialize_into(&mut data, b"key", b"value", Operation::Put).unwrap();
        data[0] = 0xFF;
        assert!(matches!(deserialize_entry(&data, &here(), 0), Err(StoreError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = Vec::new();
        serialize_into(&mut data, b"key", b"value", Operation::Put).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(deserialize_entry(&data, &here(), 0), Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_corrupted_length_detected() {
        let mut data = Vec::new();
        serialize_into(&mut data, b"key", b"value", Operation::Put).unwrap();
        assert!(header_intact(&data));

        data[7] = 0x40;
        assert!(!header_intact(&data));
        assert!(matches!(deserialize_entry(&data, &here(), 0), Err(StoreError::ChecksumMismatch { offset: 0, .. })));
    }

    #[test]
    fn test_truncated_entry_is_torn() {
        let mut data = Vec::new();
        serialize_into(&mut data, b"key", b"value", Operation::Put).unwrap();
        data.truncate(data.len() - 2);
        assert!(matches!(deserialize_entry(&data, &here(), 0), Err(StoreError::TornWrite { .. })));
    }

    #[test]
    fn test_commit_sequence_only_on_commit() {
        let entry = LogEntry { key: vec![], value: 7u64.to_le_bytes().to_vec(), operation: Operation::Put };
        assert_eq!(entry.commit_sequence(), None);
    }
}
