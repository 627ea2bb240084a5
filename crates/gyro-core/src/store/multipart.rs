// SPDX-License-Identifier: Apache-2.0

//! Multi-part storage: per-entity runs of fixed-size elements in an arena.
//!
//! Each entity's slot is a [`PartRef`] indirection record stored inline;
//! the elements themselves live contiguously in a per-type arena. Runs are
//! placed so they never straddle an arena chunk boundary, which keeps a
//! `parts` view a single contiguous borrow. Edits that cannot grow in place
//! move the run to the arena tail; abandoned runs are not compacted, in line
//! with the no-reclamation chunk lifecycle.

use bytemuck::{Pod, Zeroable};

use crate::arena::ArenaError;
use crate::chunk::ChunkTable;
use crate::constants::CHUNK_CAPACITY;

/// Indirection record from an entity index to its run in the arena.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Pod, Zeroable)]
pub(crate) struct PartRef {
    /// First element of the run, as an arena element index.
    pub start: u32,
    /// Number of elements in the run.
    pub count: u32,
}

const _: () = assert!(std::mem::size_of::<PartRef>() == 8);

/// Storage for a multi-part component type.
#[derive(Debug)]
pub(crate) struct MultiPartStore {
    elem_size: usize,
    refs: ChunkTable,
    arena: ChunkTable,
    arena_len: u32,
}

impl MultiPartStore {
    pub(crate) fn new(elem_size: usize) -> Result<Self, ArenaError> {
        Ok(Self {
            elem_size,
            refs: ChunkTable::new(std::mem::size_of::<PartRef>())?,
            arena: ChunkTable::new(elem_size)?,
            arena_len: 0,
        })
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// The ordered elements of `index`'s run as one contiguous borrow.
    pub(crate) fn parts(&self, index: u32) -> Option<&[u8]> {
        let part_ref = self.part_ref(index)?;
        if part_ref.count == 0 {
            return Some(&[]);
        }
        self.run_bytes(part_ref)
    }

    /// Replaces `index`'s run with `count` elements from `bytes`.
    pub(crate) fn set_parts(
        &mut self,
        index: u32,
        bytes: &[u8],
        count: u32,
        clock: u64,
    ) -> Result<(), ArenaError> {
        debug_assert_eq!(bytes.len(), count as usize * self.elem_size);
        let new_ref = if count == 0 {
            PartRef::default()
        } else {
            let start = self.alloc_run(count, clock)?;
            self.run_bytes_mut(PartRef { start, count }, clock)?
                .copy_from_slice(bytes);
            PartRef { start, count }
        };
        self.write_ref(index, new_ref, clock)
    }

    /// Appends one element to `index`'s run.
    pub(crate) fn add_part(&mut self, index: u32, bytes: &[u8], clock: u64) -> Result<(), ArenaError> {
        debug_assert_eq!(bytes.len(), self.elem_size);
        let current = self.part_ref(index).unwrap_or_default();

        // Grow in place when the run already sits at the arena tail and the
        // next element stays inside the same arena chunk.
        let tail = current.start + current.count;
        let in_place = current.count > 0
            && tail == self.arena_len
            && (tail as usize % CHUNK_CAPACITY) != 0;
        if in_place {
            self.arena
                .elem_mut(tail, clock)?
                .copy_from_slice(bytes);
            self.arena_len = tail + 1;
            return self.write_ref(
                index,
                PartRef {
                    start: current.start,
                    count: current.count + 1,
                },
                clock,
            );
        }

        let count = current.count + 1;
        let start = self.alloc_run(count, clock)?;
        if current.count > 0 {
            let old: Vec<u8> = self
                .run_bytes(current)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            self.run_bytes_mut(
                PartRef {
                    start,
                    count: current.count,
                },
                clock,
            )?
            .copy_from_slice(&old);
        }
        self.arena
            .elem_mut(start + current.count, clock)?
            .copy_from_slice(bytes);
        self.write_ref(index, PartRef { start, count }, clock)
    }

    /// Removes the element at `part_ix`, shifting the rest of the run down.
    pub(crate) fn remove_part(&mut self, index: u32, part_ix: u32, clock: u64) -> Result<(), ArenaError> {
        let Some(current) = self.part_ref(index) else {
            return Ok(());
        };
        if part_ix >= current.count {
            return Ok(());
        }
        for i in part_ix..current.count - 1 {
            let next: Vec<u8> = self
                .arena
                .elem(current.start + i + 1)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            self.arena
                .elem_mut(current.start + i, clock)?
                .copy_from_slice(&next);
        }
        self.write_ref(
            index,
            PartRef {
                start: current.start,
                count: current.count - 1,
            },
            clock,
        )
    }

    /// Zeroes `index`'s indirection record. Arena bytes are abandoned.
    pub(crate) fn clear_run(&mut self, index: u32, clock: u64) {
        if self.part_ref(index).map_or(false, |r| r.count > 0) {
            let _ = self.write_ref(index, PartRef::default(), clock);
        }
    }

    pub(crate) fn refs_table(&self) -> &ChunkTable {
        &self.refs
    }

    pub(crate) fn refs_table_mut(&mut self) -> &mut ChunkTable {
        &mut self.refs
    }

    pub(crate) fn arena_table(&self) -> &ChunkTable {
        &self.arena
    }

    pub(crate) fn arena_table_mut(&mut self) -> &mut ChunkTable {
        &mut self.arena
    }

    pub(crate) fn clear(&mut self) {
        self.refs.clear();
        self.arena.clear();
        self.arena_len = 0;
    }

    /// Recomputes the arena tail from every committed indirection record.
    ///
    /// Playback calls this after applying chunk records so later edits
    /// allocate past everything the recording referenced.
    pub(crate) fn rebuild_tail(&mut self) {
        let mut tail = 0u32;
        let committed: Vec<usize> = self.refs.committed_chunks().collect();
        for chunk_ix in committed {
            let Some(chunk) = self.refs.chunk(chunk_ix) else {
                continue;
            };
            for part_ref in bytemuck::cast_slice::<u8, PartRef>(chunk) {
                tail = tail.max(part_ref.start + part_ref.count);
            }
        }
        self.arena_len = tail;
    }

    fn part_ref(&self, index: u32) -> Option<PartRef> {
        self.refs
            .elem(index)
            .map(|bytes| *bytemuck::from_bytes::<PartRef>(bytes))
    }

    fn write_ref(&mut self, index: u32, part_ref: PartRef, clock: u64) -> Result<(), ArenaError> {
        let bytes = self.refs.elem_mut(index, clock)?;
        bytes.copy_from_slice(bytemuck::bytes_of(&part_ref));
        Ok(())
    }

    /// Reserves a run of `count` elements at the arena tail, skipping to the
    /// next chunk boundary when the tail chunk cannot hold the whole run.
    fn alloc_run(&mut self, count: u32, clock: u64) -> Result<u32, ArenaError> {
        debug_assert!(count as usize <= CHUNK_CAPACITY);
        let mut start = self.arena_len;
        let within_chunk = start as usize % CHUNK_CAPACITY;
        if within_chunk + count as usize > CHUNK_CAPACITY {
            start += (CHUNK_CAPACITY - within_chunk) as u32;
        }
        // Touch the run's chunk so it is committed and stamped.
        let _ = self.arena.elem_mut(start, clock)?;
        self.arena_len = start + count;
        Ok(start)
    }

    fn run_bytes(&self, part_ref: PartRef) -> Option<&[u8]> {
        let chunk_ix = part_ref.start as usize / CHUNK_CAPACITY;
        let local = part_ref.start as usize % CHUNK_CAPACITY;
        let chunk = self.arena.chunk(chunk_ix)?;
        chunk.get(local * self.elem_size..(local + part_ref.count as usize) * self.elem_size)
    }

    fn run_bytes_mut(&mut self, part_ref: PartRef, clock: u64) -> Result<&mut [u8], ArenaError> {
        let chunk_ix = part_ref.start as usize / CHUNK_CAPACITY;
        let local = part_ref.start as usize % CHUNK_CAPACITY;
        let elem_size = self.elem_size;
        let chunk = self.arena.chunk_mut(chunk_ix, clock)?;
        let range = local * elem_size..(local + part_ref.count as usize) * elem_size;
        let len = chunk.len();
        chunk.get_mut(range).ok_or(ArenaError::OutOfReservation {
            offset: local * elem_size,
            bytes: part_ref.count as usize * elem_size,
            reserved: len,
        })
    }
}
