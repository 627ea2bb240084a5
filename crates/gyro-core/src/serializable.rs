// SPDX-License-Identifier: Apache-2.0

//! Name-keyed object serialization for boxed components and object events.
//!
//! Recordings carry a fully-qualified type name per object stream; the
//! producing side encodes payloads with deterministic CBOR and the consuming
//! side looks the name up in an [`ObjectRegistry`] populated at startup.
//! JSON is banned here: map ordering would leak nondeterminism into
//! recordings.

use std::any::Any;
use std::marker::PhantomData;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors crossing the serialize/deserialize boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization of a payload failed.
    #[error("failed to encode {type_name}: {detail}")]
    Encode {
        /// Fully-qualified name of the payload type.
        type_name: &'static str,
        /// Encoder diagnostic.
        detail: String,
    },

    /// Deserialization of recorded bytes failed.
    #[error("failed to decode {type_name}: {detail}")]
    Decode {
        /// Fully-qualified name of the payload type.
        type_name: String,
        /// Decoder diagnostic.
        detail: String,
    },

    /// No deserializer is registered under the recorded name.
    #[error("unknown object type name: {name}")]
    UnknownTypeName {
        /// The name found in the recording.
        name: String,
    },
}

/// An owned, serializable, clonable payload held by an object slot or an
/// object-event stream.
pub trait ObjectPayload: Any + Send + Sync {
    /// Stable, fully-qualified name written into recordings.
    fn type_name(&self) -> &'static str;

    /// Encodes the payload with the type's declared serializer.
    fn to_bytes(&self) -> Result<Bytes, CodecError>;

    /// Clones the payload for an off-thread snapshot.
    fn clone_payload(&self) -> Box<dyn ObjectPayload>;

    /// Type-erased view for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable type-erased view for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl std::fmt::Debug for dyn ObjectPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPayload")
            .field("type_name", &self.type_name())
            .finish()
    }
}

/// Wrapper giving a concrete `T` the [`ObjectPayload`] surface.
pub(crate) struct TypedPayload<T>(pub(crate) T);

impl<T> ObjectPayload for TypedPayload<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.0, &mut buf).map_err(|e| CodecError::Encode {
            type_name: std::any::type_name::<T>(),
            detail: e.to_string(),
        })?;
        Ok(Bytes::from(buf))
    }

    fn clone_payload(&self) -> Box<dyn ObjectPayload> {
        Box::new(Self(self.0.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

trait ErasedDecoder: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn ObjectPayload>, CodecError>;
}

struct TypedDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ErasedDecoder for TypedDecoder<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn ObjectPayload>, CodecError> {
        let value: T = ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode {
            type_name: std::any::type_name::<T>().to_owned(),
            detail: e.to_string(),
        })?;
        Ok(Box::new(TypedPayload(value)))
    }
}

/// The name→deserializer table consulted by playback.
///
/// Registration is idempotent; registering two different types that share a
/// fully-qualified name is impossible by construction.
#[derive(Default)]
pub struct ObjectRegistry {
    decoders: FxHashMap<&'static str, Box<dyn ErasedDecoder>>,
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("types", &self.decoders.len())
            .finish()
    }
}

impl ObjectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its fully-qualified type name.
    pub fn register<T>(&mut self)
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.decoders
            .entry(std::any::type_name::<T>())
            .or_insert_with(|| {
                Box::new(TypedDecoder::<T> {
                    _marker: PhantomData,
                })
            });
    }

    /// Whether a deserializer exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// Decodes recorded bytes under the deserializer registered for `name`.
    pub fn decode(&self, name: &str, bytes: &[u8]) -> Result<Box<dyn ObjectPayload>, CodecError> {
        let decoder = self
            .decoders
            .get(name)
            .ok_or_else(|| CodecError::UnknownTypeName {
                name: name.to_owned(),
            })?;
        decoder.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Blast {
        x: f32,
        y: f32,
        radius: f32,
    }

    #[test]
    fn payload_round_trips_through_the_registry() {
        let mut registry = ObjectRegistry::new();
        registry.register::<Blast>();

        let original = Blast {
            x: 1.0,
            y: -2.0,
            radius: 3.5,
        };
        let payload = TypedPayload(original.clone());
        let bytes = payload.to_bytes().expect("encode");

        let decoded = registry
            .decode(std::any::type_name::<Blast>(), &bytes)
            .expect("decode");
        let round_tripped = decoded
            .as_any()
            .downcast_ref::<TypedPayload<Blast>>()
            .expect("downcast");
        assert_eq!(round_tripped.0, original);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = ObjectRegistry::new();
        let err = registry.decode("nope::Missing", &[]).expect_err("unknown");
        assert!(matches!(err, CodecError::UnknownTypeName { .. }));
    }

    #[test]
    fn clones_preserve_content() {
        let payload = TypedPayload(Blast {
            x: 0.5,
            y: 0.5,
            radius: 9.0,
        });
        let cloned = payload.clone_payload();
        assert_eq!(cloned.type_name(), std::any::type_name::<Blast>());
        assert_eq!(
            cloned.to_bytes().expect("encode clone"),
            payload.to_bytes().expect("encode original")
        );
    }
}
