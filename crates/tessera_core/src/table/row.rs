//! Rows and their block encoding.

use crate::codec::{frame, read_u32, read_u64, unframe, FRAME_OVERHEAD};
use crate::error::{CoreError, CoreResult};
use crate::types::RowId;

/// One table row: an ordered list of opaque cells.
///
/// Cells compare as byte strings; interpreting them is the type system's
/// business.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Row {
    cells: Vec<Vec<u8>>,
}

impl Row {
    /// Creates a row from cells.
    #[must_use]
    pub fn new(cells: Vec<Vec<u8>>) -> Self {
        Self { cells }
    }

    /// Creates a row from string cells.
    #[must_use]
    pub fn from_strs(cells: &[&str]) -> Self {
        Self::new(cells.iter().map(|c| c.as_bytes().to_vec()).collect())
    }

    /// Returns a cell by column position.
    #[must_use]
    pub fn cell(&self, column: usize) -> Option<&[u8]> {
        self.cells.get(column).map(Vec::as_slice)
    }

    /// Returns every cell.
    #[must_use]
    pub fn cells(&self) -> &[Vec<u8>] {
        &self.cells
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the row has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Size of the framed block record for this row.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + 12 + self.cells.iter().map(|c| 4 + c.len()).sum::<usize>()
    }

    /// Encodes the row as a framed block record.
    ///
    /// Payload: `row_id (8) | cell_count (4) | (len (4) | bytes)*`.
    #[must_use]
    pub fn encode(&self, id: RowId) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.encoded_len() - FRAME_OVERHEAD);
        payload.extend_from_slice(&id.as_u64().to_le_bytes());
        payload.extend_from_slice(&(self.cells.len() as u32).to_le_bytes());
        for cell in &self.cells {
            payload.extend_from_slice(&(cell.len() as u32).to_le_bytes());
            payload.extend_from_slice(cell);
        }
        frame(&payload)
    }

    /// Decodes a row from a block.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` or `BlockCorruption` for damaged blocks.
    pub fn decode(block: &[u8]) -> CoreResult<(RowId, Self)> {
        let payload = unframe(block)?;
        let id = RowId::new(read_u64(payload, 0)?);
        let count = read_u32(payload, 8)? as usize;

        let mut cells = Vec::with_capacity(count.min(payload.len()));
        let mut at = 12;
        for _ in 0..count {
            let len = read_u32(payload, at)? as usize;
            at += 4;
            let cell = payload
                .get(at..at + len)
                .ok_or_else(|| CoreError::block_corruption("cell extends past record"))?;
            cells.push(cell.to_vec());
            at += len;
        }
        if at != payload.len() {
            return Err(CoreError::block_corruption("trailing bytes after row"));
        }

        Ok((id, Self { cells }))
    }
}

impl From<Vec<Vec<u8>>> for Row {
    fn from(cells: Vec<Vec<u8>>) -> Self {
        Self::new(cells)
    }
}
