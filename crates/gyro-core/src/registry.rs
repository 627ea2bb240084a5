// SPDX-License-Identifier: Apache-2.0

//! Component type registry: dense type ids, storage class, data policy.
//!
//! Ids are assigned in registration order. Hosts that need identical ids
//! across runs register their types in the same order on every node; the
//! recording and save formats carry ids, so a playback target must mirror
//! the source's registration sequence.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::constants::MAX_COMPONENT_TYPES;

/// Dense identifier for a registered component type. At most 256 exist.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ComponentTypeId(pub u8);

/// Reserved type id for the entity header store.
///
/// Headers are stored in chunked SoA form exactly like a component, and
/// their chunks travel through the recorder under this id.
pub const HEADER_TYPE_ID: ComponentTypeId = ComponentTypeId(0);

/// How a component type's data is stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StorageClass {
    /// Fixed-size byte blob stored inline in chunks.
    InlineValue,
    /// Owning slot holding an opaque serializable payload.
    BoxedObject,
    /// No storage; presence is the component-mask bit alone.
    Tag,
    /// Variable-count run of fixed-size elements behind an indirection record.
    MultiPart,
    /// Single-element inline store, always addressed at slot 0.
    Singleton,
}

/// Capture policy bits for a component type.
///
/// `snapshotable` gates whether the type's state may be cloned into the
/// recorder's off-thread frame snapshot; `recordable` gates inclusion in
/// recording frames; `saveable` gates inclusion in repository saves;
/// `needs_clone` marks object types whose payloads are cloned rather than
/// memcpy'd when snapshotting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DataPolicy {
    /// State may be snapshotted for asynchronous capture.
    pub snapshotable: bool,
    /// State is included in recording frames.
    pub recordable: bool,
    /// State is included in repository saves.
    pub saveable: bool,
    /// Snapshots go through `Clone` instead of a byte copy.
    pub needs_clone: bool,
}

impl DataPolicy {
    /// Everything enabled; the default for inline values.
    pub const ALL: Self = Self {
        snapshotable: true,
        recordable: true,
        saveable: true,
        needs_clone: false,
    };

    /// Everything disabled; the policy for transient types.
    pub const TRANSIENT: Self = Self {
        snapshotable: false,
        recordable: false,
        saveable: false,
        needs_clone: false,
    };

    /// Default for boxed objects: cloned into snapshots, recorded, saved.
    pub const OBJECT: Self = Self {
        snapshotable: true,
        recordable: true,
        saveable: true,
        needs_clone: true,
    };
}

/// Descriptor of one registered component type.
#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    /// Stable, fully-qualified type name (diagnostics and object records).
    pub name: &'static str,
    /// Storage back-end for the type.
    pub storage: StorageClass,
    /// Element size in bytes; 0 for tags and boxed objects.
    pub elem_size: usize,
    /// Capture policy.
    pub policy: DataPolicy,
}

/// Errors surfaced during type registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The type was already registered with a different descriptor.
    #[error("type {name} already registered with a conflicting descriptor")]
    AlreadyRegistered {
        /// Name of the offending type.
        name: &'static str,
    },

    /// More than 256 component types were registered.
    #[error("component type id space exhausted ({MAX_COMPONENT_TYPES} types)")]
    TypeIdExhausted,
}

/// Registry of component types, keyed by Rust type identity.
#[derive(Debug)]
pub struct ComponentRegistry {
    by_rust_type: FxHashMap<std::any::TypeId, ComponentTypeId>,
    descriptors: Vec<TypeDescriptor>,
}

impl ComponentRegistry {
    /// Creates a registry with the entity header pre-registered at id 0.
    #[must_use]
    pub fn new(header_size: usize) -> Self {
        Self {
            by_rust_type: FxHashMap::default(),
            descriptors: vec![TypeDescriptor {
                name: "gyro_core::entity::EntityHeader",
                storage: StorageClass::InlineValue,
                elem_size: header_size,
                policy: DataPolicy::ALL,
            }],
        }
    }

    /// Registers `rust_type` with `desc`, assigning the next dense id.
    ///
    /// Re-registering the same type with an identical descriptor is
    /// idempotent and returns the existing id.
    pub fn register(
        &mut self,
        rust_type: std::any::TypeId,
        desc: TypeDescriptor,
    ) -> Result<ComponentTypeId, RegistryError> {
        if let Some(existing) = self.by_rust_type.get(&rust_type) {
            let known = &self.descriptors[existing.0 as usize];
            if known.storage == desc.storage
                && known.elem_size == desc.elem_size
                && known.policy == desc.policy
            {
                return Ok(*existing);
            }
            return Err(RegistryError::AlreadyRegistered { name: desc.name });
        }
        if self.descriptors.len() >= MAX_COMPONENT_TYPES {
            return Err(RegistryError::TypeIdExhausted);
        }
        #[allow(clippy::cast_possible_truncation)]
        let id = ComponentTypeId(self.descriptors.len() as u8);
        self.descriptors.push(desc);
        self.by_rust_type.insert(rust_type, id);
        Ok(id)
    }

    /// Looks up the dense id for a Rust type.
    #[must_use]
    pub fn id_of(&self, rust_type: std::any::TypeId) -> Option<ComponentTypeId> {
        self.by_rust_type.get(&rust_type).copied()
    }

    /// Descriptor for `id`, if registered.
    #[must_use]
    pub fn descriptor(&self, id: ComponentTypeId) -> Option<&TypeDescriptor> {
        self.descriptors.get(id.0 as usize)
    }

    /// Number of registered types, the header included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Always false: the header type is registered at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates `(id, descriptor)` pairs in dense-id order.
    pub fn iter(&self) -> impl Iterator<Item = (ComponentTypeId, &TypeDescriptor)> {
        self.descriptors.iter().enumerate().map(|(ix, desc)| {
            #[allow(clippy::cast_possible_truncation)]
            let id = ComponentTypeId(ix as u8);
            (id, desc)
        })
    }

    /// Registers a descriptor without a Rust-type key. Exhaustion tests only.
    #[cfg(test)]
    pub(crate) fn register_unkeyed(
        &mut self,
        desc: TypeDescriptor,
    ) -> Result<ComponentTypeId, RegistryError> {
        if self.descriptors.len() >= MAX_COMPONENT_TYPES {
            return Err(RegistryError::TypeIdExhausted);
        }
        #[allow(clippy::cast_possible_truncation)]
        let id = ComponentTypeId(self.descriptors.len() as u8);
        self.descriptors.push(desc);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    fn inline_desc(name: &'static str, size: usize) -> TypeDescriptor {
        TypeDescriptor {
            name,
            storage: StorageClass::InlineValue,
            elem_size: size,
            policy: DataPolicy::ALL,
        }
    }

    #[test]
    fn ids_are_dense_and_start_after_the_header() {
        let mut reg = ComponentRegistry::new(96);
        let a = reg
            .register(std::any::TypeId::of::<Alpha>(), inline_desc("Alpha", 8))
            .expect("register alpha");
        let b = reg
            .register(std::any::TypeId::of::<Beta>(), inline_desc("Beta", 4))
            .expect("register beta");
        assert_eq!(a, ComponentTypeId(1));
        assert_eq!(b, ComponentTypeId(2));
        assert_eq!(reg.id_of(std::any::TypeId::of::<Alpha>()), Some(a));
    }

    #[test]
    fn identical_reregistration_is_idempotent() {
        let mut reg = ComponentRegistry::new(96);
        let first = reg
            .register(std::any::TypeId::of::<Alpha>(), inline_desc("Alpha", 8))
            .expect("register");
        let second = reg
            .register(std::any::TypeId::of::<Alpha>(), inline_desc("Alpha", 8))
            .expect("reregister");
        assert_eq!(first, second);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn conflicting_reregistration_is_rejected() {
        let mut reg = ComponentRegistry::new(96);
        reg.register(std::any::TypeId::of::<Alpha>(), inline_desc("Alpha", 8))
            .expect("register");
        let err = reg
            .register(std::any::TypeId::of::<Alpha>(), inline_desc("Alpha", 16))
            .expect_err("conflict");
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn the_type_id_space_is_bounded() {
        let mut reg = ComponentRegistry::new(96);
        // The header occupies id 0; 255 more fit.
        for _ in 0..(MAX_COMPONENT_TYPES - 1) {
            reg.register_unkeyed(inline_desc("filler", 4)).expect("fits");
        }
        assert_eq!(reg.len(), MAX_COMPONENT_TYPES);
        let overflow = reg.register_unkeyed(inline_desc("overflow", 4));
        assert!(matches!(overflow, Err(RegistryError::TypeIdExhausted)));
    }
}
