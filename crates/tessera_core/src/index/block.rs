//! Index block encoding.
//!
//! An index block holds a run of row ids from one index chain.
//! Payload: `count (4) | row_id (8) * count`.

use crate::codec::{frame, read_u32, read_u64, unframe, FRAME_OVERHEAD};
use crate::error::{CoreError, CoreResult};
use crate::types::RowId;

/// Number of row ids that fit into one block of `block_size` bytes.
pub(crate) fn capacity(block_size: usize) -> usize {
    block_size.saturating_sub(FRAME_OVERHEAD + 4) / 8
}

pub(crate) fn encode(rows: &[RowId]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + rows.len() * 8);
    payload.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for row in rows {
        payload.extend_from_slice(&row.as_u64().to_le_bytes());
    }
    frame(&payload)
}

pub(crate) fn decode(block: &[u8]) -> CoreResult<Vec<RowId>> {
    let payload = unframe(block)?;
    let count = read_u32(payload, 0)? as usize;
    if payload.len() != 4 + count * 8 {
        return Err(CoreError::block_corruption(format!(
            "index block claims {count} rows in {} bytes",
            payload.len()
        )));
    }
    (0..count)
        .map(|i| read_u64(payload, 4 + i * 8).map(RowId::new))
        .collect()
}
