// SPDX-License-Identifier: Apache-2.0

//! Boxed-object storage: one owning slot per entity index.
//!
//! Slots are sparse; change tracking is kept at entity-chunk granularity so
//! delta recording can select modified index ranges the same way it selects
//! inline chunks.

use rustc_hash::FxHashMap;

use crate::constants::{chunk_of, MAX_CHUNKS};
use crate::serializable::ObjectPayload;

/// Sparse owning storage for boxed-object components.
pub(crate) struct ObjectStore {
    slots: FxHashMap<u32, Box<dyn ObjectPayload>>,
    versions: Vec<u64>,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl ObjectStore {
    pub(crate) fn new() -> Self {
        Self {
            slots: FxHashMap::default(),
            versions: vec![0; MAX_CHUNKS],
        }
    }

    /// Installs a payload, dropping any previous one. Stamps the chunk.
    pub(crate) fn insert(&mut self, index: u32, payload: Box<dyn ObjectPayload>, clock: u64) {
        self.slots.insert(index, payload);
        self.stamp(index, clock);
    }

    pub(crate) fn get(&self, index: u32) -> Option<&dyn ObjectPayload> {
        self.slots.get(&index).map(AsRef::as_ref)
    }

    /// Exclusive payload access; stamps the chunk.
    pub(crate) fn get_mut(&mut self, index: u32, clock: u64) -> Option<&mut Box<dyn ObjectPayload>> {
        if self.slots.contains_key(&index) {
            self.stamp(index, clock);
        }
        self.slots.get_mut(&index)
    }

    /// Drops the slot's payload. Stamps the chunk when a payload existed.
    pub(crate) fn remove(&mut self, index: u32, clock: u64) -> Option<Box<dyn ObjectPayload>> {
        let removed = self.slots.remove(&index);
        if removed.is_some() {
            self.stamp(index, clock);
        }
        removed
    }

    pub(crate) fn version(&self, chunk_ix: usize) -> u64 {
        self.versions.get(chunk_ix).copied().unwrap_or(0)
    }

    pub(crate) fn set_version(&mut self, chunk_ix: usize, version: u64) {
        if let Some(slot) = self.versions.get_mut(chunk_ix) {
            *slot = version;
        }
    }

    /// Slots within entity chunk `chunk_ix`, ascending by index.
    ///
    /// The map iterates in hash order; recording sorts so frame bytes stay
    /// deterministic.
    pub(crate) fn slots_in_chunk(&self, chunk_ix: usize) -> Vec<(u32, &dyn ObjectPayload)> {
        let mut slots: Vec<(u32, &dyn ObjectPayload)> = self
            .slots
            .iter()
            .filter(|(index, _)| chunk_of(**index) == chunk_ix)
            .map(|(index, payload)| (*index, payload.as_ref()))
            .collect();
        slots.sort_by_key(|(index, _)| *index);
        slots
    }

    /// Entity chunks that currently hold at least one slot, ascending.
    pub(crate) fn occupied_chunks(&self) -> Vec<usize> {
        let mut chunks: Vec<usize> = self.slots.keys().map(|index| chunk_of(*index)).collect();
        chunks.sort_unstable();
        chunks.dedup();
        chunks
    }

    /// Drops every slot within entity chunk `chunk_ix`. Used by playback
    /// before reinstalling a chunk's recorded slots.
    pub(crate) fn clear_chunk(&mut self, chunk_ix: usize) {
        self.slots.retain(|index, _| chunk_of(*index) != chunk_ix);
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.versions.iter_mut().for_each(|v| *v = 0);
    }

    fn stamp(&mut self, index: u32, clock: u64) {
        if let Some(slot) = self.versions.get_mut(chunk_of(index)) {
            *slot = clock;
        }
    }
}
