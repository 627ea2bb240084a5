// SPDX-License-Identifier: Apache-2.0

//! Deferred structural mutations, recorded as a tagged byte stream.
//!
//! Systems record create/destroy/add/set/remove commands while iterating;
//! the phase barrier plays every buffer back on the main thread in record
//! order. `create` hands out a placeholder handle (top index bit set) that
//! playback remaps to the really-created entity, so commands recorded after
//! a create may target it freely.

use bytemuck::Pod;
use bytes::{Buf, BufMut, BytesMut};

use crate::entity::Entity;
use crate::registry::ComponentTypeId;
use crate::repo::{RepoError, Repository};

const TAG_CREATE: u8 = 1;
const TAG_DESTROY: u8 = 2;
const TAG_ADD: u8 = 3;
const TAG_SET: u8 = 4;
const TAG_REMOVE: u8 = 5;

/// A single-owner buffer of deferred structural commands.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    bytes: BytesMut,
    placeholders: u32,
}

impl CommandBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Records an entity creation and returns its placeholder handle.
    ///
    /// The placeholder is only meaningful to commands recorded later in
    /// this same buffer; it is remapped during playback.
    pub fn create(&mut self) -> Entity {
        let placeholder = Entity::placeholder(self.placeholders);
        self.placeholders += 1;
        self.bytes.put_u8(TAG_CREATE);
        placeholder
    }

    /// Records a destruction.
    pub fn destroy(&mut self, entity: Entity) {
        self.bytes.put_u8(TAG_DESTROY);
        self.put_entity(entity);
    }

    /// Records an add of raw component bytes.
    pub fn add_raw(&mut self, entity: Entity, type_id: ComponentTypeId, payload: &[u8]) {
        self.put_component_op(TAG_ADD, entity, type_id, payload);
    }

    /// Records a set of raw component bytes.
    pub fn set_raw(&mut self, entity: Entity, type_id: ComponentTypeId, payload: &[u8]) {
        self.put_component_op(TAG_SET, entity, type_id, payload);
    }

    /// Records an add of a typed inline value.
    pub fn add<T: Pod>(&mut self, entity: Entity, type_id: ComponentTypeId, value: &T) {
        self.add_raw(entity, type_id, bytemuck::bytes_of(value));
    }

    /// Records a set of a typed inline value.
    pub fn set<T: Pod>(&mut self, entity: Entity, type_id: ComponentTypeId, value: &T) {
        self.set_raw(entity, type_id, bytemuck::bytes_of(value));
    }

    /// Records a component removal.
    pub fn remove(&mut self, entity: Entity, type_id: ComponentTypeId) {
        self.bytes.put_u8(TAG_REMOVE);
        self.put_entity(entity);
        self.bytes.put_u8(type_id.0);
    }

    /// Plays the buffer back against `repo` in record order.
    ///
    /// Runs on one thread with exclusive repository access. Stale handles
    /// make their commands silent no-ops; an add or set naming an
    /// unregistered type fails with [`RepoError::TypeIdNotRegistered`]. On
    /// any error the buffer is left intact and the repository keeps every
    /// command applied so far; the caller must treat that as fatal. On
    /// success the buffer is cleared.
    pub fn play_back(&mut self, repo: &mut Repository) -> Result<(), RepoError> {
        let mut remap: Vec<Entity> = Vec::with_capacity(self.placeholders as usize);
        let total = self.bytes.len();
        let mut cursor: &[u8] = &self.bytes;

        while cursor.has_remaining() {
            let offset = total - cursor.remaining();
            let malformed = RepoError::MalformedCommandBuffer { offset };
            match cursor.get_u8() {
                TAG_CREATE => {
                    remap.push(repo.create()?);
                }
                TAG_DESTROY => {
                    let entity = Self::take_entity(&mut cursor, &remap).ok_or(malformed)?;
                    repo.destroy(entity)?;
                }
                TAG_ADD | TAG_SET => {
                    let entity = Self::take_entity(&mut cursor, &remap)
                        .ok_or(RepoError::MalformedCommandBuffer { offset })?;
                    if cursor.remaining() < 5 {
                        return Err(RepoError::MalformedCommandBuffer { offset });
                    }
                    let type_id = ComponentTypeId(cursor.get_u8());
                    let len = cursor.get_u32_le() as usize;
                    if cursor.remaining() < len {
                        return Err(RepoError::MalformedCommandBuffer { offset });
                    }
                    let payload = cursor.copy_to_bytes(len);
                    repo.add_raw(entity, type_id, &payload)?;
                }
                TAG_REMOVE => {
                    let entity = Self::take_entity(&mut cursor, &remap).ok_or(malformed)?;
                    if !cursor.has_remaining() {
                        return Err(RepoError::MalformedCommandBuffer { offset });
                    }
                    let type_id = ComponentTypeId(cursor.get_u8());
                    repo.remove_raw(entity, type_id)?;
                }
                _ => return Err(malformed),
            }
        }

        self.clear();
        Ok(())
    }

    /// Discards every recorded command.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.placeholders = 0;
    }

    fn put_component_op(
        &mut self,
        tag: u8,
        entity: Entity,
        type_id: ComponentTypeId,
        payload: &[u8],
    ) {
        self.bytes.put_u8(tag);
        self.put_entity(entity);
        self.bytes.put_u8(type_id.0);
        #[allow(clippy::cast_possible_truncation)]
        self.bytes.put_u32_le(payload.len() as u32);
        self.bytes.put_slice(payload);
    }

    fn put_entity(&mut self, entity: Entity) {
        self.bytes.put_u32_le(entity.index());
        self.bytes.put_u32_le(entity.generation());
    }

    fn take_entity(cursor: &mut &[u8], remap: &[Entity]) -> Option<Entity> {
        if cursor.remaining() < 8 {
            return None;
        }
        let index = cursor.get_u32_le();
        let generation = cursor.get_u32_le();
        let entity = Entity::new(index, generation);
        if entity.is_placeholder() {
            remap.get(entity.placeholder_ordinal() as usize).copied()
        } else {
            Some(entity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Health {
        points: u32,
        shield: u32,
    }

    fn repo_with_health() -> (Repository, ComponentTypeId) {
        let mut repo = Repository::new().expect("repo");
        let id = repo.register_component::<Health>().expect("register");
        (repo, id)
    }

    #[test]
    fn placeholders_are_remapped_to_created_entities() {
        let (mut repo, health) = repo_with_health();
        let mut buffer = CommandBuffer::new();

        let future = buffer.create();
        assert!(future.is_placeholder());
        buffer.add(future, health, &Health { points: 50, shield: 10 });

        buffer.play_back(&mut repo).expect("play back");
        assert!(buffer.is_empty());

        let query = repo.query().with::<Health>().expect("with").build();
        let spawned: Vec<_> = repo.iter(&query).collect();
        assert_eq!(spawned.len(), 1);
        assert_eq!(
            *repo.get::<Health>(spawned[0]).expect("health"),
            Health { points: 50, shield: 10 }
        );
    }

    #[test]
    fn commands_apply_in_record_order() {
        let (mut repo, health) = repo_with_health();
        let e = repo.create().expect("create");

        let mut buffer = CommandBuffer::new();
        buffer.add(e, health, &Health { points: 1, shield: 0 });
        buffer.set(e, health, &Health { points: 2, shield: 0 });
        buffer.play_back(&mut repo).expect("play back");

        assert_eq!(
            *repo.get::<Health>(e).expect("health"),
            Health { points: 2, shield: 0 }
        );
    }

    #[test]
    fn stale_targets_are_silent_noops() {
        let (mut repo, health) = repo_with_health();
        let e = repo.create().expect("create");
        repo.destroy(e).expect("destroy");

        let mut buffer = CommandBuffer::new();
        buffer.add(e, health, &Health { points: 3, shield: 3 });
        buffer.destroy(e);
        buffer.remove(e, health);
        buffer.play_back(&mut repo).expect("all no-ops");
    }

    #[test]
    fn unregistered_type_ids_fail_playback() {
        let (mut repo, _) = repo_with_health();
        let e = repo.create().expect("create");

        let mut buffer = CommandBuffer::new();
        buffer.add_raw(e, ComponentTypeId(200), &[0u8; 4]);
        let err = buffer.play_back(&mut repo).expect_err("must fail");
        assert!(matches!(err, RepoError::TypeIdNotRegistered(200)));
    }

    #[test]
    fn destroy_via_buffer_is_recorded_for_the_frame() {
        let (mut repo, _) = repo_with_health();
        let e = repo.create().expect("create");

        let mut buffer = CommandBuffer::new();
        buffer.destroy(e);
        buffer.play_back(&mut repo).expect("play back");

        assert!(!repo.is_alive(e));
        assert_eq!(repo.destroyed_this_frame(), &[e]);
    }
}
