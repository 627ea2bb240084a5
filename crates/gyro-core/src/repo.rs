// SPDX-License-Identifier: Apache-2.0

//! The repository: one process-local store of all entity and component
//! state.
//!
//! Everything is indexed by dense component type id. The global clock
//! advances once per frame via [`Repository::tick`]; every exclusive chunk
//! access stamps that chunk with the current clock, which is what delta
//! recording keys on. The documented frame order is strict:
//! `tick(); mutate; capture_frame(previous_tick)`. Mutations made before
//! the tick are invisible to the next delta.

use bytemuck::Pod;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::arena::ArenaError;
use crate::entity::{Entity, EntityIndex};
use crate::registry::{
    ComponentRegistry, ComponentTypeId, DataPolicy, RegistryError, StorageClass, TypeDescriptor,
    HEADER_TYPE_ID,
};
use crate::serializable::{CodecError, ObjectRegistry, TypedPayload};
use crate::store::{InlineStore, MultiPartStore, ObjectStore, SingletonStore, Store};

/// Errors surfaced by repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Every entity index up to the build-time maximum is in use.
    #[error("entity index space exhausted")]
    EntityIndexExhausted,

    /// A read went through a handle whose entity has been destroyed.
    #[error("stale entity handle {0:?}")]
    StaleHandle(Entity),

    /// A read of a component the entity does not carry.
    #[error("entity {entity:?} has no {type_name} component")]
    MissingComponent {
        /// The handle used for the read.
        entity: Entity,
        /// Name of the missing component type.
        type_name: &'static str,
    },

    /// A singleton read before the value was ever written.
    #[error("singleton {type_name} has not been set")]
    MissingSingleton {
        /// Name of the singleton type.
        type_name: &'static str,
    },

    /// The type was never registered with this repository.
    #[error("component type {type_name} is not registered")]
    UnknownType {
        /// Name of the unregistered type.
        type_name: &'static str,
    },

    /// A command or record referenced a dense id with no registration.
    #[error("component type id {0} is not registered")]
    TypeIdNotRegistered(u8),

    /// The operation does not apply to the type's storage class.
    #[error("storage class mismatch for {type_name}")]
    StorageClassMismatch {
        /// Name of the offending type.
        type_name: &'static str,
    },

    /// The type's layout cannot be stored inline (alignment above 8).
    #[error("unsupported layout for {type_name}: alignment exceeds 8 bytes")]
    UnsupportedLayout {
        /// Name of the offending type.
        type_name: &'static str,
    },

    /// A raw payload length disagreed with the registered element size.
    #[error("payload for type id {type_id} is {actual} bytes, expected {expected}")]
    PayloadSize {
        /// Dense id of the target type.
        type_id: u8,
        /// Registered element size.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },

    /// A parallel iteration asked to write and read the same component.
    #[error("parallel iteration may not alias one component as writer and reader")]
    AliasedParallelAccess,

    /// A command buffer's byte stream was structurally invalid.
    #[error("malformed command buffer at byte {offset}")]
    MalformedCommandBuffer {
        /// Byte offset of the undecodable command.
        offset: usize,
    },

    /// Storage commitment failed.
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// Type registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Object payload (de)serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The process-local entity/component repository.
#[derive(Debug)]
pub struct Repository {
    clock: u64,
    registry: ComponentRegistry,
    entities: EntityIndex,
    stores: Vec<Option<Store>>,
    objects: ObjectRegistry,
}

impl Repository {
    /// Creates an empty repository with the entity header pre-registered.
    pub fn new() -> Result<Self, RepoError> {
        Ok(Self {
            clock: 0,
            registry: ComponentRegistry::new(crate::entity::HEADER_SIZE),
            entities: EntityIndex::new()?,
            stores: vec![None],
            objects: ObjectRegistry::new(),
        })
    }

    /// Advances the global clock and starts a new frame.
    ///
    /// Returns the new clock value. Every frame begins with this call,
    /// before any phase runs or any mutation destined for the next delta.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.entities.begin_frame();
        self.clock
    }

    /// Current value of the global clock.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    // ── Registration ────────────────────────────────────────────────

    /// Registers `T` as an inline-value component with the default policy.
    pub fn register_component<T: Pod + Send + Sync + 'static>(
        &mut self,
    ) -> Result<ComponentTypeId, RepoError> {
        self.register_component_with_policy::<T>(DataPolicy::ALL)
    }

    /// Registers `T` as an inline-value component with an explicit policy.
    pub fn register_component_with_policy<T: Pod + Send + Sync + 'static>(
        &mut self,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId, RepoError> {
        check_layout::<T>()?;
        let id = self.register_raw::<T>(TypeDescriptor {
            name: std::any::type_name::<T>(),
            storage: StorageClass::InlineValue,
            elem_size: std::mem::size_of::<T>(),
            policy,
        })?;
        self.ensure_store(id, || {
            Ok(Some(Store::Inline(InlineStore::new(std::mem::size_of::<T>())?)))
        })?;
        Ok(id)
    }

    /// Registers `T` as a tag: mask bit only, no storage.
    pub fn register_tag<T: Send + Sync + 'static>(&mut self) -> Result<ComponentTypeId, RepoError> {
        let id = self.register_raw::<T>(TypeDescriptor {
            name: std::any::type_name::<T>(),
            storage: StorageClass::Tag,
            elem_size: 0,
            policy: DataPolicy::TRANSIENT,
        })?;
        self.ensure_store(id, || Ok(None))?;
        Ok(id)
    }

    /// Registers `T` as a boxed-object component with the object policy.
    pub fn register_object<T>(&mut self) -> Result<ComponentTypeId, RepoError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.register_object_with_policy::<T>(DataPolicy::OBJECT)
    }

    /// Registers `T` as a boxed-object component with an explicit policy.
    pub fn register_object_with_policy<T>(
        &mut self,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId, RepoError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let id = self.register_raw::<T>(TypeDescriptor {
            name: std::any::type_name::<T>(),
            storage: StorageClass::BoxedObject,
            elem_size: 0,
            policy,
        })?;
        self.ensure_store(id, || Ok(Some(Store::Object(ObjectStore::new()))))?;
        self.objects.register::<T>();
        Ok(id)
    }

    /// Registers `T` as a multi-part component.
    pub fn register_multipart<T: Pod + Send + Sync + 'static>(
        &mut self,
    ) -> Result<ComponentTypeId, RepoError> {
        check_layout::<T>()?;
        let id = self.register_raw::<T>(TypeDescriptor {
            name: std::any::type_name::<T>(),
            storage: StorageClass::MultiPart,
            elem_size: std::mem::size_of::<T>(),
            policy: DataPolicy::ALL,
        })?;
        self.ensure_store(id, || {
            Ok(Some(Store::MultiPart(MultiPartStore::new(
                std::mem::size_of::<T>(),
            )?)))
        })?;
        Ok(id)
    }

    /// Registers `T` as a singleton.
    pub fn register_singleton<T: Pod + Send + Sync + 'static>(
        &mut self,
    ) -> Result<ComponentTypeId, RepoError> {
        check_layout::<T>()?;
        let id = self.register_raw::<T>(TypeDescriptor {
            name: std::any::type_name::<T>(),
            storage: StorageClass::Singleton,
            elem_size: std::mem::size_of::<T>(),
            policy: DataPolicy::ALL,
        })?;
        self.ensure_store(id, || {
            Ok(Some(Store::Singleton(SingletonStore::new(
                std::mem::size_of::<T>(),
            ))))
        })?;
        Ok(id)
    }

    /// Dense id of `T`, if registered.
    #[must_use]
    pub fn type_id_of<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.registry.id_of(std::any::TypeId::of::<T>())
    }

    // ── Entity lifecycle ────────────────────────────────────────────

    /// Creates a live entity.
    pub fn create(&mut self) -> Result<Entity, RepoError> {
        self.entities.create(self.clock)
    }

    /// Destroys `entity`. Stale handles are a silent no-op.
    pub fn destroy(&mut self, entity: Entity) -> Result<(), RepoError> {
        if !self.entities.destroy(entity, self.clock)? {
            return Ok(());
        }
        let clock = self.clock;
        for store in self.stores.iter_mut().flatten() {
            store.clear_slot(entity.index(), clock);
        }
        Ok(())
    }

    /// Whether `entity` is alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Entities destroyed since the last [`Self::tick`].
    #[must_use]
    pub fn destroyed_this_frame(&self) -> &[Entity] {
        self.entities.destroyed_this_frame()
    }

    // ── Inline components ───────────────────────────────────────────

    /// Adds (or overwrites) `entity`'s `T` value. No-op on stale handles.
    pub fn add<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        let store = self.inline_store_mut(id)?;
        store
            .get_mut(entity.index(), clock)?
            .copy_from_slice(bytemuck::bytes_of(&value));
        self.entities.set_component_bit(entity.index(), id, clock)?;
        Ok(())
    }

    /// Alias of [`Self::add`]: overwrites the value, setting the bit if
    /// needed.
    pub fn set<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), RepoError> {
        self.add(entity, value)
    }

    /// Read-only access to `entity`'s `T`. Never stamps change versions.
    pub fn get<T: Pod + Send + Sync + 'static>(&self, entity: Entity) -> Result<&T, RepoError> {
        let id = self.lookup::<T>()?;
        self.check_readable(entity, id, std::any::type_name::<T>())?;
        let store = self.inline_store(id)?;
        let bytes = store
            .get(entity.index())
            .ok_or(RepoError::MissingComponent {
                entity,
                type_name: std::any::type_name::<T>(),
            })?;
        Ok(bytemuck::from_bytes(bytes))
    }

    /// Exclusive access to `entity`'s `T`. Stamps the chunk change version.
    pub fn get_mut<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
    ) -> Result<&mut T, RepoError> {
        let id = self.lookup::<T>()?;
        self.check_readable(entity, id, std::any::type_name::<T>())?;
        let clock = self.clock;
        let store = self.inline_store_mut(id)?;
        Ok(bytemuck::from_bytes_mut(store.get_mut(entity.index(), clock)?))
    }

    /// Clears the component bit for `T`. No-op on stale handles.
    ///
    /// Works for every storage class. Inline bytes stay in place (the mask
    /// is authoritative); object payloads are dropped; multi-part runs are
    /// abandoned.
    pub fn remove<T: 'static>(&mut self, entity: Entity) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        self.entities.clear_component_bit(entity.index(), id, clock)?;
        if let Some(store) = self.stores.get_mut(id.0 as usize).and_then(Option::as_mut) {
            store.clear_slot(entity.index(), clock);
        }
        Ok(())
    }

    /// Whether `entity` is alive and carries `T` (any storage class).
    #[must_use]
    pub fn has<T: 'static>(&self, entity: Entity) -> bool {
        let Some(id) = self.type_id_of::<T>() else {
            return false;
        };
        self.entities.is_alive(entity)
            && self
                .entities
                .header(entity.index())
                .is_some_and(|h| h.component_mask.test(id))
    }

    // ── Tags ────────────────────────────────────────────────────────

    /// Sets the tag bit for `T`. No-op on stale handles.
    pub fn add_tag<T: Send + Sync + 'static>(&mut self, entity: Entity) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        self.entities.set_component_bit(entity.index(), id, clock)
    }

    /// Whether `entity` carries tag `T`.
    #[must_use]
    pub fn has_tag<T: Send + Sync + 'static>(&self, entity: Entity) -> bool {
        self.has::<T>(entity)
    }

    /// Clears the tag bit for `T`. No-op on stale handles.
    pub fn remove_tag<T: Send + Sync + 'static>(&mut self, entity: Entity) -> Result<(), RepoError> {
        self.remove::<T>(entity)
    }

    // ── Authority ───────────────────────────────────────────────────

    /// Marks this node (non-)authoritative for `T` on `entity`.
    pub fn set_authority<T: 'static>(
        &mut self,
        entity: Entity,
        value: bool,
    ) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        self.entities
            .set_authority_bit(entity.index(), id, value, clock)
    }

    /// Whether this node is authoritative for `T` on `entity`.
    #[must_use]
    pub fn has_authority<T: 'static>(&self, entity: Entity) -> bool {
        let Some(id) = self.type_id_of::<T>() else {
            return false;
        };
        self.entities.is_alive(entity)
            && self
                .entities
                .header(entity.index())
                .is_some_and(|h| h.authority_mask.test(id))
    }

    // ── Boxed objects ───────────────────────────────────────────────

    /// Installs an object payload on `entity`. No-op on stale handles.
    pub fn add_object<T>(&mut self, entity: Entity, value: T) -> Result<(), RepoError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        let store = self.object_store_mut(id)?;
        store.insert(entity.index(), Box::new(TypedPayload(value)), clock);
        self.entities.set_component_bit(entity.index(), id, clock)?;
        Ok(())
    }

    /// Read-only access to `entity`'s object payload.
    pub fn object<T>(&self, entity: Entity) -> Result<&T, RepoError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let id = self.lookup::<T>()?;
        self.check_readable(entity, id, std::any::type_name::<T>())?;
        let store = self.object_store(id)?;
        let payload = store
            .get(entity.index())
            .ok_or(RepoError::MissingComponent {
                entity,
                type_name: std::any::type_name::<T>(),
            })?;
        payload
            .as_any()
            .downcast_ref::<TypedPayload<T>>()
            .map(|typed| &typed.0)
            .ok_or(RepoError::StorageClassMismatch {
                type_name: std::any::type_name::<T>(),
            })
    }

    /// Exclusive access to `entity`'s object payload. Stamps the chunk.
    pub fn object_mut<T>(&mut self, entity: Entity) -> Result<&mut T, RepoError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let id = self.lookup::<T>()?;
        self.check_readable(entity, id, std::any::type_name::<T>())?;
        let clock = self.clock;
        let store = self.object_store_mut(id)?;
        let payload = store
            .get_mut(entity.index(), clock)
            .ok_or(RepoError::MissingComponent {
                entity,
                type_name: std::any::type_name::<T>(),
            })?;
        payload
            .as_any_mut()
            .downcast_mut::<TypedPayload<T>>()
            .map(|typed| &mut typed.0)
            .ok_or(RepoError::StorageClassMismatch {
                type_name: std::any::type_name::<T>(),
            })
    }

    // ── Multi-part components ───────────────────────────────────────

    /// The ordered parts of `entity`'s `T` run.
    pub fn parts<T: Pod + Send + Sync + 'static>(&self, entity: Entity) -> Result<&[T], RepoError> {
        let id = self.lookup::<T>()?;
        self.check_readable(entity, id, std::any::type_name::<T>())?;
        let store = self.multipart_store(id)?;
        let bytes = store
            .parts(entity.index())
            .ok_or(RepoError::MissingComponent {
                entity,
                type_name: std::any::type_name::<T>(),
            })?;
        Ok(bytemuck::cast_slice(bytes))
    }

    /// Replaces `entity`'s `T` run with `values`. No-op on stale handles.
    pub fn set_parts<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        values: &[T],
    ) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        let store = self.multipart_store_mut(id)?;
        #[allow(clippy::cast_possible_truncation)]
        store.set_parts(
            entity.index(),
            bytemuck::cast_slice(values),
            values.len() as u32,
            clock,
        )?;
        self.entities.set_component_bit(entity.index(), id, clock)?;
        Ok(())
    }

    /// Appends one part to `entity`'s `T` run. No-op on stale handles.
    pub fn add_part<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        let store = self.multipart_store_mut(id)?;
        store.add_part(entity.index(), bytemuck::bytes_of(&value), clock)?;
        self.entities.set_component_bit(entity.index(), id, clock)?;
        Ok(())
    }

    /// Removes the part at `part_ix` from `entity`'s `T` run.
    pub fn remove_part<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        part_ix: u32,
    ) -> Result<(), RepoError> {
        let id = self.lookup::<T>()?;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        let store = self.multipart_store_mut(id)?;
        store.remove_part(entity.index(), part_ix, clock)?;
        Ok(())
    }

    // ── Singletons ──────────────────────────────────────────────────

    /// Read-only access to the `T` singleton.
    pub fn singleton<T: Pod + Send + Sync + 'static>(&self) -> Result<&T, RepoError> {
        let id = self.lookup::<T>()?;
        let store = self.singleton_store(id)?;
        let bytes = store.get().ok_or(RepoError::MissingSingleton {
            type_name: std::any::type_name::<T>(),
        })?;
        Ok(bytemuck::from_bytes(bytes))
    }

    /// Exclusive access to the `T` singleton, zero-initialising it on first
    /// touch. Stamps the singleton's change version.
    pub fn singleton_mut<T: Pod + Send + Sync + 'static>(&mut self) -> Result<&mut T, RepoError> {
        let id = self.lookup::<T>()?;
        let clock = self.clock;
        let store = self.singleton_store_mut(id)?;
        Ok(bytemuck::from_bytes_mut(store.get_mut(clock)))
    }

    // ── Raw access (command buffers, playback) ──────────────────────

    /// Adds an inline value by dense id from raw bytes. No-op on stale
    /// handles; unregistered ids fail with
    /// [`RepoError::TypeIdNotRegistered`].
    pub fn add_raw(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
        payload: &[u8],
    ) -> Result<(), RepoError> {
        let desc = self
            .registry
            .descriptor(type_id)
            .ok_or(RepoError::TypeIdNotRegistered(type_id.0))?;
        let storage = desc.storage;
        let elem_size = desc.elem_size;
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        match storage {
            StorageClass::Tag => {
                self.entities.set_component_bit(entity.index(), type_id, clock)?;
            }
            StorageClass::InlineValue => {
                if payload.len() != elem_size {
                    return Err(RepoError::PayloadSize {
                        type_id: type_id.0,
                        expected: elem_size,
                        actual: payload.len(),
                    });
                }
                let store = self.inline_store_mut(type_id)?;
                store.get_mut(entity.index(), clock)?.copy_from_slice(payload);
                self.entities.set_component_bit(entity.index(), type_id, clock)?;
            }
            StorageClass::MultiPart => {
                if elem_size == 0 || payload.len() % elem_size != 0 {
                    return Err(RepoError::PayloadSize {
                        type_id: type_id.0,
                        expected: elem_size,
                        actual: payload.len(),
                    });
                }
                #[allow(clippy::cast_possible_truncation)]
                let count = (payload.len() / elem_size) as u32;
                let store = self.multipart_store_mut(type_id)?;
                store.set_parts(entity.index(), payload, count, clock)?;
                self.entities.set_component_bit(entity.index(), type_id, clock)?;
            }
            StorageClass::BoxedObject | StorageClass::Singleton => {
                return Err(RepoError::StorageClassMismatch {
                    type_name: desc_name(&self.registry, type_id),
                });
            }
        }
        Ok(())
    }

    /// Clears a component by dense id. No-op on stale handles.
    pub fn remove_raw(&mut self, entity: Entity, type_id: ComponentTypeId) -> Result<(), RepoError> {
        if self.registry.descriptor(type_id).is_none() {
            return Err(RepoError::TypeIdNotRegistered(type_id.0));
        }
        if !self.entities.is_alive(entity) {
            return Ok(());
        }
        let clock = self.clock;
        self.entities.clear_component_bit(entity.index(), type_id, clock)?;
        if let Some(store) = self.stores.get_mut(type_id.0 as usize).and_then(Option::as_mut) {
            store.clear_slot(entity.index(), clock);
        }
        Ok(())
    }

    // ── Crate-internal surface ──────────────────────────────────────

    pub(crate) fn entity_index(&self) -> &EntityIndex {
        &self.entities
    }

    pub(crate) fn entity_index_mut(&mut self) -> &mut EntityIndex {
        &mut self.entities
    }

    pub(crate) fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub(crate) fn object_registry(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub(crate) fn store(&self, id: ComponentTypeId) -> Option<&Store> {
        self.stores.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn store_mut(&mut self, id: ComponentTypeId) -> Option<&mut Store> {
        self.stores.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub(crate) fn set_clock(&mut self, clock: u64) {
        self.clock = clock;
    }

    /// Change version of the chunk holding `chunk_ix` for `type_id`.
    ///
    /// For the header type this is the header table's stamp; tags fall back
    /// to the header table as well, since tag flips stamp header chunks.
    pub(crate) fn changed_version(&self, type_id: ComponentTypeId, chunk_ix: usize) -> u64 {
        if type_id == HEADER_TYPE_ID {
            return self.entities.headers_table().version(chunk_ix);
        }
        match self.store(type_id) {
            Some(Store::Inline(store)) => store.table().version(chunk_ix),
            Some(Store::Object(store)) => store.version(chunk_ix),
            Some(Store::MultiPart(store)) => store
                .refs_table()
                .version(chunk_ix)
                .max(store.arena_table().version(chunk_ix)),
            Some(Store::Singleton(store)) => store.version(),
            None => self.entities.headers_table().version(chunk_ix),
        }
    }

    /// Simultaneous exclusive/shared access to two distinct inline stores
    /// plus the entity index, for the parallel iteration path.
    pub(crate) fn inline_pair_mut(
        &mut self,
        write: ComponentTypeId,
        read: ComponentTypeId,
    ) -> Result<(&mut InlineStore, &InlineStore, &EntityIndex, u64), RepoError> {
        if write == read {
            return Err(RepoError::AliasedParallelAccess);
        }
        let (w_ix, r_ix) = (write.0 as usize, read.0 as usize);
        let (low, high, write_is_low) = if w_ix < r_ix {
            (w_ix, r_ix, true)
        } else {
            (r_ix, w_ix, false)
        };
        let (head, tail) = self.stores.split_at_mut(high);
        let low_store = head
            .get_mut(low)
            .and_then(Option::as_mut)
            .ok_or(RepoError::TypeIdNotRegistered(ComponentTypeId(low as u8).0))?;
        let high_store = tail
            .first_mut()
            .and_then(Option::as_mut)
            .ok_or(RepoError::TypeIdNotRegistered(ComponentTypeId(high as u8).0))?;
        let (w_store, r_store) = if write_is_low {
            (low_store, &*high_store)
        } else {
            (high_store, &*low_store)
        };
        let Store::Inline(w_inline) = w_store else {
            return Err(RepoError::StorageClassMismatch {
                type_name: desc_name(&self.registry, write),
            });
        };
        let Store::Inline(r_inline) = r_store else {
            return Err(RepoError::StorageClassMismatch {
                type_name: desc_name(&self.registry, read),
            });
        };
        Ok((w_inline, r_inline, &self.entities, self.clock))
    }

    /// Drops whatever every store holds for `index` (playback destruction
    /// apply).
    pub(crate) fn clear_entity_slots(&mut self, index: u32) {
        let clock = self.clock;
        for store in self.stores.iter_mut().flatten() {
            store.clear_slot(index, clock);
        }
    }

    /// Clears all component state and the entity index (playback keyframe
    /// reset). Registrations and the clock survive.
    pub(crate) fn reset_state(&mut self) {
        self.entities.reset();
        for store in self.stores.iter_mut().flatten() {
            match store {
                Store::Inline(s) => s.table_mut().clear(),
                Store::Object(s) => s.clear(),
                Store::MultiPart(s) => s.clear(),
                Store::Singleton(s) => s.clear(),
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn register_raw<T: 'static>(&mut self, desc: TypeDescriptor) -> Result<ComponentTypeId, RepoError> {
        Ok(self.registry.register(std::any::TypeId::of::<T>(), desc)?)
    }

    fn ensure_store(
        &mut self,
        id: ComponentTypeId,
        build: impl FnOnce() -> Result<Option<Store>, RepoError>,
    ) -> Result<(), RepoError> {
        if self.stores.len() == id.0 as usize {
            let store = build()?;
            self.stores.push(store);
        }
        Ok(())
    }

    pub(crate) fn lookup<T: 'static>(&self) -> Result<ComponentTypeId, RepoError> {
        self.type_id_of::<T>().ok_or(RepoError::UnknownType {
            type_name: std::any::type_name::<T>(),
        })
    }

    fn check_readable(
        &self,
        entity: Entity,
        id: ComponentTypeId,
        type_name: &'static str,
    ) -> Result<(), RepoError> {
        if !self.entities.is_alive(entity) {
            return Err(RepoError::StaleHandle(entity));
        }
        let present = self
            .entities
            .header(entity.index())
            .is_some_and(|h| h.component_mask.test(id));
        if !present {
            return Err(RepoError::MissingComponent { entity, type_name });
        }
        Ok(())
    }

    fn inline_store(&self, id: ComponentTypeId) -> Result<&InlineStore, RepoError> {
        match self.store(id) {
            Some(Store::Inline(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch {
                type_name: desc_name(&self.registry, id),
            }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn inline_store_mut(&mut self, id: ComponentTypeId) -> Result<&mut InlineStore, RepoError> {
        let name = desc_name(&self.registry, id);
        match self.store_mut(id) {
            Some(Store::Inline(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch { type_name: name }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn object_store(&self, id: ComponentTypeId) -> Result<&ObjectStore, RepoError> {
        match self.store(id) {
            Some(Store::Object(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch {
                type_name: desc_name(&self.registry, id),
            }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn object_store_mut(&mut self, id: ComponentTypeId) -> Result<&mut ObjectStore, RepoError> {
        let name = desc_name(&self.registry, id);
        match self.store_mut(id) {
            Some(Store::Object(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch { type_name: name }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn multipart_store(&self, id: ComponentTypeId) -> Result<&MultiPartStore, RepoError> {
        match self.store(id) {
            Some(Store::MultiPart(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch {
                type_name: desc_name(&self.registry, id),
            }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn multipart_store_mut(&mut self, id: ComponentTypeId) -> Result<&mut MultiPartStore, RepoError> {
        let name = desc_name(&self.registry, id);
        match self.store_mut(id) {
            Some(Store::MultiPart(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch { type_name: name }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn singleton_store(&self, id: ComponentTypeId) -> Result<&SingletonStore, RepoError> {
        match self.store(id) {
            Some(Store::Singleton(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch {
                type_name: desc_name(&self.registry, id),
            }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }

    fn singleton_store_mut(&mut self, id: ComponentTypeId) -> Result<&mut SingletonStore, RepoError> {
        let name = desc_name(&self.registry, id);
        match self.store_mut(id) {
            Some(Store::Singleton(store)) => Ok(store),
            Some(_) => Err(RepoError::StorageClassMismatch { type_name: name }),
            None => Err(RepoError::TypeIdNotRegistered(id.0)),
        }
    }
}

fn desc_name(registry: &ComponentRegistry, id: ComponentTypeId) -> &'static str {
    registry.descriptor(id).map_or("<unregistered>", |d| d.name)
}

fn check_layout<T>() -> Result<(), RepoError> {
    if std::mem::align_of::<T>() > 8 {
        return Err(RepoError::UnsupportedLayout {
            type_name: std::any::type_name::<T>(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    struct Frozen;

    #[test]
    fn add_get_remove_inline() {
        let mut repo = Repository::new().expect("repo");
        repo.register_component::<Position>().expect("register");
        let e = repo.create().expect("create");

        repo.add(e, Position { x: 1.0, y: 2.0 }).expect("add");
        assert!(repo.has::<Position>(e));
        assert_eq!(*repo.get::<Position>(e).expect("get"), Position { x: 1.0, y: 2.0 });

        repo.remove::<Position>(e).expect("remove");
        assert!(!repo.has::<Position>(e));
        assert!(matches!(
            repo.get::<Position>(e),
            Err(RepoError::MissingComponent { .. })
        ));
    }

    #[test]
    fn reads_through_stale_handles_fail_and_mutations_are_noops() {
        let mut repo = Repository::new().expect("repo");
        repo.register_component::<Position>().expect("register");
        let e = repo.create().expect("create");
        repo.add(e, Position { x: 1.0, y: 1.0 }).expect("add");
        repo.destroy(e).expect("destroy");

        assert!(matches!(
            repo.get::<Position>(e),
            Err(RepoError::StaleHandle(_))
        ));
        repo.add(e, Position { x: 9.0, y: 9.0 }).expect("silent no-op");
        repo.remove::<Position>(e).expect("silent no-op");
    }

    #[test]
    fn exclusive_access_stamps_and_read_only_does_not() {
        let mut repo = Repository::new().expect("repo");
        let id = repo.register_component::<Position>().expect("register");
        let e = repo.create().expect("create");
        repo.add(e, Position { x: 0.0, y: 0.0 }).expect("add");

        let stamped_at_add = repo.changed_version(id, 0);
        repo.tick();
        repo.tick();
        let _ = repo.get::<Position>(e).expect("read");
        assert_eq!(repo.changed_version(id, 0), stamped_at_add);

        repo.get_mut::<Position>(e).expect("write").x = 5.0;
        assert_eq!(repo.changed_version(id, 0), repo.clock());
    }

    #[test]
    fn tags_flip_mask_bits_only() {
        let mut repo = Repository::new().expect("repo");
        repo.register_tag::<Frozen>().expect("register");
        let e = repo.create().expect("create");

        assert!(!repo.has_tag::<Frozen>(e));
        repo.add_tag::<Frozen>(e).expect("add");
        assert!(repo.has_tag::<Frozen>(e));
        repo.remove_tag::<Frozen>(e).expect("remove");
        assert!(!repo.has_tag::<Frozen>(e));
    }

    #[test]
    fn authority_bits_are_independent_of_presence() {
        let mut repo = Repository::new().expect("repo");
        repo.register_component::<Position>().expect("register");
        let e = repo.create().expect("create");

        assert!(!repo.has_authority::<Position>(e));
        repo.set_authority::<Position>(e, true).expect("grant");
        assert!(repo.has_authority::<Position>(e));
        assert!(!repo.has::<Position>(e));
        repo.set_authority::<Position>(e, false).expect("revoke");
        assert!(!repo.has_authority::<Position>(e));
    }

    #[test]
    fn singletons_live_outside_the_entity_space() {
        let mut repo = Repository::new().expect("repo");
        repo.register_singleton::<Position>().expect("register");
        assert!(matches!(
            repo.singleton::<Position>(),
            Err(RepoError::MissingSingleton { .. })
        ));
        *repo.singleton_mut::<Position>().expect("init") = Position { x: 3.0, y: 4.0 };
        assert_eq!(
            *repo.singleton::<Position>().expect("read"),
            Position { x: 3.0, y: 4.0 }
        );
    }

    #[test]
    fn unregistered_types_are_rejected_by_name() {
        let repo = Repository::new().expect("repo");
        let e = Entity::new(0, 0);
        assert!(matches!(
            repo.get::<Position>(e),
            Err(RepoError::UnknownType { .. })
        ));
    }

    #[test]
    fn double_registration_is_idempotent() {
        let mut repo = Repository::new().expect("repo");
        let a = repo.register_component::<Position>().expect("first");
        let b = repo.register_component::<Position>().expect("second");
        assert_eq!(a, b);
    }
}
