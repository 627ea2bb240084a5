// SPDX-License-Identifier: Apache-2.0

//! Inline-value storage: one chunk table parameterised by element size.

use crate::arena::ArenaError;
use crate::chunk::ChunkTable;

/// Chunked storage for fixed-size inline values.
#[derive(Debug)]
pub(crate) struct InlineStore {
    table: ChunkTable,
}

impl InlineStore {
    pub(crate) fn new(elem_size: usize) -> Result<Self, ArenaError> {
        Ok(Self {
            table: ChunkTable::new(elem_size)?,
        })
    }

    /// Read-only bytes of the element at `index`. Does not stamp.
    pub(crate) fn get(&self, index: u32) -> Option<&[u8]> {
        self.table.elem(index)
    }

    /// Exclusive bytes of the element at `index`; commits the chunk on
    /// first touch and stamps its change version with `clock`.
    pub(crate) fn get_mut(&mut self, index: u32, clock: u64) -> Result<&mut [u8], ArenaError> {
        self.table.elem_mut(index, clock)
    }

    pub(crate) fn table(&self) -> &ChunkTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut ChunkTable {
        &mut self.table
    }
}
