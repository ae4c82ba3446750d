//! Framing of records stored in blocks.
//!
//! Every block written by the core holds one framed record:
//! `record_len (4) | payload | crc32 (4)`, little endian, where
//! `record_len` counts the whole frame. The rest of the block is zero
//! padding added by the store.

use crate::error::{CoreError, CoreResult};

/// Bytes added around a payload by [`frame`].
pub(crate) const FRAME_OVERHEAD: usize = 8;

/// Wraps a payload in a length prefix and checksum.
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let record_len = payload.len() + FRAME_OVERHEAD;
    let mut buf = Vec::with_capacity(record_len);
    buf.extend_from_slice(&(record_len as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Extracts the payload of a framed record, verifying its checksum.
pub(crate) fn unframe(block: &[u8]) -> CoreResult<&[u8]> {
    if block.len() < FRAME_OVERHEAD {
        return Err(CoreError::block_corruption("block shorter than frame"));
    }
    let record_len = read_u32(block, 0)? as usize;
    if record_len < FRAME_OVERHEAD || record_len > block.len() {
        return Err(CoreError::block_corruption(format!(
            "record length {record_len} out of bounds"
        )));
    }

    let stored = read_u32(block, record_len - 4)?;
    let computed = crc32fast::hash(&block[..record_len - 4]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    Ok(&block[4..record_len - 4])
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> CoreResult<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| CoreError::block_corruption("truncated u32"))
}

pub(crate) fn read_u64(data: &[u8], at: usize) -> CoreResult<u64> {
    data.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| CoreError::block_corruption("truncated u64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unframe_ignores_padding() {
        let mut block = frame(b"payload");
        block.resize(64, 0);
        assert_eq!(unframe(&block).unwrap(), b"payload");
    }

    #[test]
    fn unframe_detects_bit_flip() {
        let mut block = frame(b"payload");
        block[5] ^= 0x01;
        assert!(matches!(
            unframe(&block),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unframe_rejects_zeroed_block() {
        let block = vec![0u8; 32];
        assert!(matches!(
            unframe(&block),
            Err(CoreError::BlockCorruption { .. })
        ));
    }

    #[test]
    fn read_helpers_check_bounds() {
        let data = [1u8, 0, 0, 0];
        assert_eq!(read_u32(&data, 0).unwrap(), 1);
        assert!(read_u32(&data, 1).is_err());
        assert!(read_u64(&data, 0).is_err());
    }
}
