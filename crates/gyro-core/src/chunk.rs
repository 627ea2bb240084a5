// SPDX-License-Identifier: Apache-2.0

//! Sparse chunk table: fixed-capacity chunks over a reserve/commit region.
//!
//! A table maps an entity index to the chunk `index >> CHUNK_SHIFT` and the
//! slot `index & (CHUNK_CAPACITY - 1)`. Chunks are committed on first touch
//! and each carries a change version stamped from the repository clock on
//! every exclusive access.

use tracing::trace;

use crate::arena::{ArenaError, Region};
use crate::constants::{chunk_of, offset_in_chunk, CHUNK_CAPACITY, MAX_CHUNKS};

/// A chunked store for fixed-size elements of one component type.
#[derive(Debug)]
pub struct ChunkTable {
    elem_size: usize,
    chunk_bytes: usize,
    region: Region,
    versions: Vec<u64>,
}

impl ChunkTable {
    /// Creates a table for elements of `elem_size` bytes.
    ///
    /// Reserves address budget for every possible chunk up front; nothing is
    /// committed until an index is touched.
    pub fn new(elem_size: usize) -> Result<Self, ArenaError> {
        debug_assert!(elem_size > 0);
        let chunk_bytes = elem_size * CHUNK_CAPACITY;
        let region = Region::reserve(chunk_bytes * MAX_CHUNKS, chunk_bytes)?;
        Ok(Self {
            elem_size,
            chunk_bytes,
            region,
            versions: vec![0; MAX_CHUNKS],
        })
    }

    /// Element size in bytes.
    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Returns whether the chunk containing `index` is committed, without
    /// allocating.
    #[must_use]
    pub fn exists_for(&self, index: u32) -> bool {
        self.chunk_exists(chunk_of(index))
    }

    /// Returns whether chunk `chunk_ix` is committed.
    #[must_use]
    pub fn chunk_exists(&self, chunk_ix: usize) -> bool {
        self.region.is_committed(chunk_ix * self.chunk_bytes, self.chunk_bytes)
    }

    /// Change version of chunk `chunk_ix`.
    #[must_use]
    pub fn version(&self, chunk_ix: usize) -> u64 {
        self.versions.get(chunk_ix).copied().unwrap_or(0)
    }

    /// Borrows chunk `chunk_ix` read-only. `None` when not committed.
    #[must_use]
    pub fn chunk(&self, chunk_ix: usize) -> Option<&[u8]> {
        self.region.slice(chunk_ix * self.chunk_bytes, self.chunk_bytes)
    }

    /// Exclusively borrows chunk `chunk_ix`, committing it if absent and
    /// stamping its change version with `clock`.
    pub fn chunk_mut(&mut self, chunk_ix: usize, clock: u64) -> Result<&mut [u8], ArenaError> {
        self.ensure_chunk(chunk_ix)?;
        self.versions[chunk_ix] = clock;
        let offset = chunk_ix * self.chunk_bytes;
        let reserved = self.region.reserved();
        self.region
            .slice_mut(offset, self.chunk_bytes)
            .ok_or(ArenaError::OutOfReservation {
                offset,
                bytes: self.chunk_bytes,
                reserved,
            })
    }

    /// Commits chunk `chunk_ix` without stamping its version.
    pub fn ensure_chunk(&mut self, chunk_ix: usize) -> Result<(), ArenaError> {
        if !self.chunk_exists(chunk_ix) {
            trace!(chunk_ix, elem_size = self.elem_size, "committing chunk");
        }
        self.region.commit(chunk_ix * self.chunk_bytes, self.chunk_bytes)
    }

    /// Borrows the element at `index` read-only.
    ///
    /// Does not stamp the chunk version; read-only access is invisible to
    /// change tracking.
    #[must_use]
    pub fn elem(&self, index: u32) -> Option<&[u8]> {
        let offset = chunk_of(index) * self.chunk_bytes + offset_in_chunk(index) * self.elem_size;
        self.region.slice(offset, self.elem_size)
    }

    /// Exclusively borrows the element at `index`, committing its chunk on
    /// first touch and stamping the chunk version with `clock`.
    pub fn elem_mut(&mut self, index: u32, clock: u64) -> Result<&mut [u8], ArenaError> {
        let chunk_ix = chunk_of(index);
        self.ensure_chunk(chunk_ix)?;
        self.versions[chunk_ix] = clock;
        let offset = chunk_ix * self.chunk_bytes + offset_in_chunk(index) * self.elem_size;
        let reserved = self.region.reserved();
        self.region
            .slice_mut(offset, self.elem_size)
            .ok_or(ArenaError::OutOfReservation {
                offset,
                bytes: self.elem_size,
                reserved,
            })
    }

    /// Iterates indices of committed chunks in ascending order.
    pub fn committed_chunks(&self) -> impl Iterator<Item = usize> + '_ {
        self.region.committed_slabs()
    }

    /// Exclusively iterates every committed chunk without stamping.
    ///
    /// The borrows are disjoint; the parallel query path fans them out
    /// across workers. Yielding does not count as a mutation: callers
    /// stamp exactly the chunks they write, via [`Self::chunk_mut`],
    /// before taking the iterator.
    pub fn chunks_mut(&mut self) -> impl Iterator<Item = (usize, &mut [u8])> {
        self.region.slabs_mut()
    }

    /// Drops every committed chunk and resets all versions.
    pub fn clear(&mut self) {
        self.region.decommit_all();
        self.versions.iter_mut().for_each(|v| *v = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_commit_lazily_on_exclusive_access() {
        let mut table = ChunkTable::new(8).expect("table");
        assert!(!table.exists_for(0));
        assert!(!table.exists_for((CHUNK_CAPACITY as u32) * 2));

        table.elem_mut(3, 7).expect("elem_mut");
        assert!(table.exists_for(0));
        assert!(table.exists_for(CHUNK_CAPACITY as u32 - 1));
        assert!(!table.exists_for(CHUNK_CAPACITY as u32));
        assert_eq!(table.version(0), 7);
    }

    #[test]
    fn read_only_access_does_not_stamp() {
        let mut table = ChunkTable::new(4).expect("table");
        table.elem_mut(0, 1).expect("elem_mut");
        assert_eq!(table.version(0), 1);
        let _ = table.elem(0).expect("elem");
        assert_eq!(table.version(0), 1);
    }

    #[test]
    fn elements_are_addressed_within_their_chunk() {
        let mut table = ChunkTable::new(2).expect("table");
        table.elem_mut(5, 1).expect("slot 5").copy_from_slice(&[5, 5]);
        let far = CHUNK_CAPACITY as u32 + 1;
        table.elem_mut(far, 2).expect("far slot").copy_from_slice(&[9, 9]);

        assert_eq!(table.elem(5).expect("read 5"), &[5, 5]);
        assert_eq!(table.elem(far).expect("read far"), &[9, 9]);
        assert_eq!(table.version(0), 1);
        assert_eq!(table.version(1), 2);
        assert_eq!(table.committed_chunks().collect::<Vec<_>>(), vec![0, 1]);
    }
}
