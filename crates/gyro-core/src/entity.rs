// SPDX-License-Identifier: Apache-2.0

//! Generational entity handles and the chunked entity index.
//!
//! The per-entity header row lives in a [`ChunkTable`] exactly like any
//! component, so scanning N consecutive indices touches a predictable run
//! of cache lines regardless of how many component types the entities
//! carry. Population counters and the per-chunk signature union are derived
//! metadata kept beside the table.

use bytemuck::{Pod, Zeroable};

use crate::arena::ArenaError;
use crate::chunk::ChunkTable;
use crate::constants::{chunk_of, CHUNK_CAPACITY, MAX_CHUNKS, MAX_ENTITIES};
use crate::mask::Mask256;
use crate::registry::ComponentTypeId;
use crate::repo::RepoError;

/// Bit set on placeholder indices handed out by command buffers.
pub(crate) const PLACEHOLDER_BIT: u32 = 1 << 31;

/// A generational entity handle.
///
/// Two handles are equal only when both index and generation match; a
/// handle whose generation lags the header's is stale and fails liveness
/// checks.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Pod, Zeroable)]
pub struct Entity {
    index: u32,
    generation: u32,
}

const _: () = assert!(std::mem::size_of::<Entity>() == 8);

impl Entity {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Dense index of this entity.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation the handle was issued at.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Whether this handle is a command-buffer placeholder awaiting remap.
    #[must_use]
    pub fn is_placeholder(self) -> bool {
        self.index & PLACEHOLDER_BIT != 0
    }

    pub(crate) fn placeholder(ordinal: u32) -> Self {
        Self {
            index: PLACEHOLDER_BIT | ordinal,
            generation: 0,
        }
    }

    pub(crate) fn placeholder_ordinal(self) -> u32 {
        self.index & !PLACEHOLDER_BIT
    }
}

/// Per-entity header row, stored chunked like any component.
///
/// Padded to a multiple of 32 bytes so the mask lanes load aligned.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Pod, Zeroable)]
pub struct EntityHeader {
    /// Component types present on this entity.
    pub component_mask: Mask256,
    /// Component types this node is authoritative for.
    pub authority_mask: Mask256,
    /// Bumped on every destruction; stale handles fail against it.
    pub generation: u32,
    /// Header flags; bit 0 is `active`.
    pub flags: u32,
    /// Pads the row to 96 bytes.
    pub reserved: [u8; 24],
}

/// Size of one header row in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<EntityHeader>();

const _: () = assert!(HEADER_SIZE == 96);
const _: () = assert!(HEADER_SIZE % 32 == 0);

impl EntityHeader {
    const FLAG_ACTIVE: u32 = 1;

    /// Whether the slot currently holds a live entity.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flags & Self::FLAG_ACTIVE != 0
    }

    fn set_active(&mut self, active: bool) {
        if active {
            self.flags |= Self::FLAG_ACTIVE;
        } else {
            self.flags &= !Self::FLAG_ACTIVE;
        }
    }
}

/// The entity index: header store, free list, per-chunk metadata.
#[derive(Debug)]
pub struct EntityIndex {
    headers: ChunkTable,
    free: Vec<u32>,
    high_water: u32,
    population: Vec<u32>,
    signatures: Vec<Mask256>,
    destroyed: Vec<Entity>,
}

impl EntityIndex {
    pub(crate) fn new() -> Result<Self, ArenaError> {
        Ok(Self {
            headers: ChunkTable::new(HEADER_SIZE)?,
            free: Vec::new(),
            high_water: 0,
            population: vec![0; MAX_CHUNKS],
            signatures: vec![Mask256::EMPTY; MAX_CHUNKS],
            destroyed: Vec::new(),
        })
    }

    /// Allocates a live entity, reusing a free index when one exists.
    ///
    /// The first allocation of an index keeps generation 0; reused indices
    /// carry whatever generation their destructions accumulated.
    pub fn create(&mut self, clock: u64) -> Result<Entity, RepoError> {
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            if self.high_water as usize >= MAX_ENTITIES {
                return Err(RepoError::EntityIndexExhausted);
            }
            let index = self.high_water;
            self.high_water += 1;
            index
        };

        let header = self.header_mut(index, clock)?;
        header.component_mask.clear_all();
        header.authority_mask.clear_all();
        header.set_active(true);
        let generation = header.generation;

        self.population[chunk_of(index)] += 1;
        Ok(Entity::new(index, generation))
    }

    /// Destroys `entity` if it is alive; stale handles are a silent no-op.
    ///
    /// Returns whether a destruction happened. Destroyed handles are
    /// remembered until the next [`Self::begin_frame`] so the recorder can
    /// serialize the frame's destruction list.
    pub fn destroy(&mut self, entity: Entity, clock: u64) -> Result<bool, RepoError> {
        if !self.is_alive(entity) {
            return Ok(false);
        }
        let index = entity.index();
        let header = self.header_mut(index, clock)?;
        header.component_mask.clear_all();
        header.authority_mask.clear_all();
        header.set_active(false);
        header.generation = header.generation.wrapping_add(1);

        self.population[chunk_of(index)] -= 1;
        self.free.push(index);
        self.destroyed.push(entity);
        Ok(true)
    }

    /// Whether `entity` is alive: active and generation-matched.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        if entity.is_placeholder() {
            return false;
        }
        self.header(entity.index())
            .is_some_and(|h| h.is_active() && h.generation == entity.generation())
    }

    /// Read-only header for `index`; `None` when its chunk was never touched.
    #[must_use]
    pub fn header(&self, index: u32) -> Option<&EntityHeader> {
        self.headers.elem(index).map(bytemuck::from_bytes)
    }

    /// Exclusive header access; commits the chunk and stamps its version.
    pub fn header_mut(&mut self, index: u32, clock: u64) -> Result<&mut EntityHeader, RepoError> {
        Ok(bytemuck::from_bytes_mut(self.headers.elem_mut(index, clock)?))
    }

    /// Sets the component bit for `index` and folds it into the chunk
    /// signature.
    pub fn set_component_bit(
        &mut self,
        index: u32,
        id: ComponentTypeId,
        clock: u64,
    ) -> Result<(), RepoError> {
        self.header_mut(index, clock)?.component_mask.set(id);
        self.signatures[chunk_of(index)].set(id);
        Ok(())
    }

    /// Clears the component bit for `index`.
    ///
    /// The chunk signature is left as-is: it is a conservative union and
    /// only the per-entity mask is authoritative for absence.
    pub fn clear_component_bit(
        &mut self,
        index: u32,
        id: ComponentTypeId,
        clock: u64,
    ) -> Result<(), RepoError> {
        self.header_mut(index, clock)?.component_mask.clear(id);
        Ok(())
    }

    /// Sets or clears the authority bit for `index`.
    pub fn set_authority_bit(
        &mut self,
        index: u32,
        id: ComponentTypeId,
        value: bool,
        clock: u64,
    ) -> Result<(), RepoError> {
        let header = self.header_mut(index, clock)?;
        if value {
            header.authority_mask.set(id);
        } else {
            header.authority_mask.clear(id);
        }
        Ok(())
    }

    /// Count of live entities in chunk `chunk_ix`.
    #[must_use]
    pub fn population(&self, chunk_ix: usize) -> u32 {
        self.population.get(chunk_ix).copied().unwrap_or(0)
    }

    /// Conservative union of component masks over chunk `chunk_ix`.
    #[must_use]
    pub fn signature(&self, chunk_ix: usize) -> &Mask256 {
        self.signatures.get(chunk_ix).unwrap_or(&Mask256::EMPTY)
    }

    /// One past the highest index ever allocated.
    #[must_use]
    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    /// Entities destroyed since the last [`Self::begin_frame`].
    #[must_use]
    pub fn destroyed_this_frame(&self) -> &[Entity] {
        &self.destroyed
    }

    /// Starts a new frame: forgets the previous frame's destruction list.
    pub fn begin_frame(&mut self) {
        self.destroyed.clear();
    }

    /// The backing header chunk table (recording and queries).
    pub(crate) fn headers_table(&self) -> &ChunkTable {
        &self.headers
    }

    /// Exclusive access to the backing header chunk table (playback).
    pub(crate) fn headers_table_mut(&mut self) -> &mut ChunkTable {
        &mut self.headers
    }

    /// Typed view of a committed header chunk.
    #[must_use]
    pub(crate) fn header_chunk(&self, chunk_ix: usize) -> Option<&[EntityHeader]> {
        self.headers.chunk(chunk_ix).map(bytemuck::cast_slice)
    }

    /// Clears every header chunk and all derived metadata.
    pub(crate) fn reset(&mut self) {
        self.headers.clear();
        self.free.clear();
        self.high_water = 0;
        self.population.iter_mut().for_each(|p| *p = 0);
        self.signatures.iter_mut().for_each(|s| s.clear_all());
        self.destroyed.clear();
    }

    /// Recomputes population, signatures, free list and high-water mark
    /// from header chunk contents.
    ///
    /// Playback calls this after applying a keyframe's header chunks. The
    /// free list is rebuilt in ascending index order; recorded state is
    /// unaffected, only the allocation order of future `create` calls on
    /// the restored repository differs from the source.
    pub(crate) fn rebuild_metadata(&mut self) {
        self.free.clear();
        self.high_water = 0;
        self.population.iter_mut().for_each(|p| *p = 0);
        self.signatures.iter_mut().for_each(|s| s.clear_all());

        let committed: Vec<usize> = self.headers.committed_chunks().collect();
        for chunk_ix in committed {
            let Some(rows) = self.header_chunk(chunk_ix) else {
                continue;
            };
            let base = (chunk_ix * CHUNK_CAPACITY) as u32;
            let mut population = 0u32;
            let mut signature = Mask256::EMPTY;
            let mut last_used = None;
            for (local, row) in rows.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let index = base + local as u32;
                if row.is_active() {
                    population += 1;
                    signature.union_with(&row.component_mask);
                    last_used = Some(index);
                } else if row.generation > 0 {
                    // A slot that has lived and died stays allocatable.
                    last_used = Some(index);
                }
            }
            self.population[chunk_ix] = population;
            self.signatures[chunk_ix] = signature;
            if let Some(last) = last_used {
                self.high_water = self.high_water.max(last + 1);
            }
        }

        for index in (0..self.high_water).rev() {
            let dead = self.header(index).map_or(true, |h| !h.is_active());
            if dead {
                self.free.push(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_destroy_create_bumps_generation() {
        let mut index = EntityIndex::new().expect("index");
        let e1 = index.create(1).expect("create");
        assert!(index.is_alive(e1));
        assert_eq!(e1.index(), 0);
        assert_eq!(e1.generation(), 0);

        assert!(index.destroy(e1, 2).expect("destroy"));
        assert!(!index.is_alive(e1));

        let e2 = index.create(3).expect("recreate");
        assert_eq!(e2.index(), 0);
        assert_eq!(e2.generation(), 1);
        assert_ne!(e1, e2);
        assert!(!index.is_alive(e1));
        assert!(index.is_alive(e2));
    }

    #[test]
    fn destroy_of_stale_handle_is_a_noop() {
        let mut index = EntityIndex::new().expect("index");
        let e = index.create(1).expect("create");
        assert!(index.destroy(e, 2).expect("destroy"));
        assert!(!index.destroy(e, 3).expect("stale destroy"));
        assert_eq!(index.destroyed_this_frame().len(), 1);
    }

    #[test]
    fn population_and_signature_track_creation() {
        let mut index = EntityIndex::new().expect("index");
        let e = index.create(1).expect("create");
        assert_eq!(index.population(0), 1);

        let t = ComponentTypeId(7);
        index.set_component_bit(e.index(), t, 2).expect("set bit");
        assert!(index.signature(0).test(t));
        assert!(index.header(e.index()).expect("header").component_mask.test(t));

        index.clear_component_bit(e.index(), t, 3).expect("clear bit");
        // Signature stays conservatively set.
        assert!(index.signature(0).test(t));
        assert!(!index.header(e.index()).expect("header").component_mask.test(t));
    }

    #[test]
    fn rebuild_recovers_population_and_free_slots() {
        let mut index = EntityIndex::new().expect("index");
        let a = index.create(1).expect("a");
        let b = index.create(1).expect("b");
        let _c = index.create(1).expect("c");
        index.set_component_bit(a.index(), ComponentTypeId(3), 1).expect("bit");
        index.destroy(b, 2).expect("destroy");

        index.rebuild_metadata();
        assert_eq!(index.population(0), 2);
        assert!(index.signature(0).test(ComponentTypeId(3)));
        assert_eq!(index.high_water(), 3);

        // The freed slot is allocatable again with its bumped generation.
        let reborn = index.create(3).expect("reborn");
        assert_eq!(reborn.index(), b.index());
        assert_eq!(reborn.generation(), 1);
    }
}
