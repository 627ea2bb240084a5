// SPDX-License-Identifier: Apache-2.0

//! Double-buffered event streams.
//!
//! Publishers append to `pending` under a per-stream lock; consumers read
//! `current` without locking anything but the stream map. The bus swaps the
//! two once per frame, so an event published in frame N is visible exactly
//! once, in frame N+1. Playback bypasses `pending` entirely and injects
//! recorded bytes straight into `current`.

use std::sync::{Mutex, PoisonError, RwLock};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serializable::{CodecError, ObjectPayload, ObjectRegistry, TypedPayload};

/// A fixed-size value event, published by copy.
///
/// The `EVENT_TYPE_ID` is declared by the event type and identifies its
/// stream in the bus and in recordings.
pub trait ValueEvent: bytemuck::Pod + Send + Sync + 'static {
    /// Stream identity for this event type.
    const EVENT_TYPE_ID: u16;
}

/// A serialized object event, published by move.
pub trait ObjectEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stream identity for this event type.
    const EVENT_TYPE_ID: u16;

    /// Stable, fully-qualified name written into recordings.
    #[must_use]
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Byte buffer whose base is 8-aligned so packed Pod elements can be viewed
/// in place.
#[derive(Debug, Default)]
struct AlignedBuf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    fn push_bytes(&mut self, bytes: &[u8]) {
        let new_len = self.len + bytes.len();
        let words = new_len.div_ceil(8);
        if self.words.len() < words {
            self.words.resize(words, 0);
        }
        bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[self.len..new_len]
            .copy_from_slice(bytes);
        self.len = new_len;
    }

    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
struct ValueStream {
    elem_size: usize,
    pending: Mutex<AlignedBuf>,
    current: AlignedBuf,
}

impl ValueStream {
    fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            pending: Mutex::new(AlignedBuf::default()),
            current: AlignedBuf::default(),
        }
    }
}

struct ObjectStream {
    type_name: String,
    pending: Mutex<Vec<Box<dyn ObjectPayload>>>,
    current: Vec<Box<dyn ObjectPayload>>,
}

impl ObjectStream {
    fn new(type_name: String) -> Self {
        Self {
            type_name,
            pending: Mutex::new(Vec::new()),
            current: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("type_name", &self.type_name)
            .field("current", &self.current.len())
            .finish()
    }
}

/// Snapshot of one value stream's current buffer, taken by the recorder.
#[derive(Debug, Clone)]
pub(crate) struct ValueStreamSnap {
    pub(crate) type_id: u16,
    pub(crate) elem_size: u32,
    pub(crate) count: u32,
    pub(crate) bytes: Bytes,
}

/// Snapshot of one object stream's current list, serialized.
#[derive(Debug, Clone)]
pub(crate) struct ObjectStreamSnap {
    pub(crate) type_id: u16,
    pub(crate) type_name: String,
    pub(crate) payloads: Vec<Bytes>,
}

/// The event bus: value and object streams plus the object decoder table.
#[derive(Debug, Default)]
pub struct EventBus {
    values: RwLock<FxHashMap<u16, ValueStream>>,
    objects: RwLock<FxHashMap<u16, ObjectStream>>,
    decoders: ObjectRegistry,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the deserializer playback needs for object event `E`.
    ///
    /// Publishing does not require this, but a recording containing `E`
    /// cannot be injected without it.
    pub fn register_object_event<E: ObjectEvent>(&mut self) {
        self.decoders.register::<E>();
    }

    /// Publishes a value event into the pending buffer.
    ///
    /// Callable from any thread; publishers in the same frame never observe
    /// each other's events.
    pub fn publish<E: ValueEvent>(&self, event: &E) {
        let bytes = bytemuck::bytes_of(event);
        {
            let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stream) = values.get(&E::EVENT_TYPE_ID) {
                debug_assert_eq!(stream.elem_size, std::mem::size_of::<E>());
                stream
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_bytes(bytes);
                return;
            }
        }
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        let stream = values
            .entry(E::EVENT_TYPE_ID)
            .or_insert_with(|| ValueStream::new(std::mem::size_of::<E>()));
        stream
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push_bytes(bytes);
    }

    /// Publishes an object event into the pending list.
    pub fn publish_object<E: ObjectEvent>(&self, event: E) {
        let boxed: Box<dyn ObjectPayload> = Box::new(TypedPayload(event));
        {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stream) = objects.get(&E::EVENT_TYPE_ID) {
                stream
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(boxed);
                return;
            }
        }
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let stream = objects
            .entry(E::EVENT_TYPE_ID)
            .or_insert_with(|| ObjectStream::new(E::type_name().to_owned()));
        stream
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed);
    }

    /// Reads the current value events of type `E` as one ordered view.
    pub fn read<E: ValueEvent, R>(&self, f: impl FnOnce(&[E]) -> R) -> R {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        match values.get(&E::EVENT_TYPE_ID) {
            Some(stream) => f(bytemuck::cast_slice(stream.current.as_bytes())),
            None => f(&[]),
        }
    }

    /// Copies the current value events of type `E` out of the bus.
    pub fn collect<E: ValueEvent>(&self) -> Vec<E> {
        self.read::<E, Vec<E>>(<[E]>::to_vec)
    }

    /// Visits every current object event of type `E` in publish order.
    pub fn for_each_object<E: ObjectEvent>(&self, mut f: impl FnMut(&E)) {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = objects.get(&E::EVENT_TYPE_ID) {
            for payload in &stream.current {
                if let Some(typed) = payload.as_any().downcast_ref::<TypedPayload<E>>() {
                    f(&typed.0);
                }
            }
        }
    }

    /// Swaps pending and current for every stream. Called once per frame.
    ///
    /// After the swap, `current` holds everything published since the last
    /// swap and the new `pending` is empty.
    pub fn swap_buffers(&mut self) {
        let values = self.values.get_mut().unwrap_or_else(PoisonError::into_inner);
        for stream in values.values_mut() {
            let pending = stream.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
            std::mem::swap(pending, &mut stream.current);
            pending.clear();
        }
        let objects = self.objects.get_mut().unwrap_or_else(PoisonError::into_inner);
        for stream in objects.values_mut() {
            let pending = stream.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
            std::mem::swap(pending, &mut stream.current);
            pending.clear();
        }
    }

    // ── Playback injection ──────────────────────────────────────────

    /// Clears `current` across all streams. Pending buffers are untouched.
    pub(crate) fn clear_current(&mut self) {
        let values = self.values.get_mut().unwrap_or_else(PoisonError::into_inner);
        for stream in values.values_mut() {
            stream.current.clear();
        }
        let objects = self.objects.get_mut().unwrap_or_else(PoisonError::into_inner);
        for stream in objects.values_mut() {
            stream.current.clear();
        }
    }

    /// Appends recorded value-event bytes directly to `current`, creating
    /// the stream if it does not exist.
    pub(crate) fn inject_value(&mut self, type_id: u16, elem_size: usize, bytes: &[u8]) {
        let values = self.values.get_mut().unwrap_or_else(PoisonError::into_inner);
        let stream = values
            .entry(type_id)
            .or_insert_with(|| ValueStream::new(elem_size));
        stream.current.push_bytes(bytes);
    }

    /// Deserializes recorded object payloads into `current` by type name.
    pub(crate) fn inject_object(
        &mut self,
        type_id: u16,
        type_name: &str,
        payloads: &[Bytes],
    ) -> Result<(), CodecError> {
        let objects = self.objects.get_mut().unwrap_or_else(PoisonError::into_inner);
        let stream = objects
            .entry(type_id)
            .or_insert_with(|| ObjectStream::new(type_name.to_owned()));
        for payload in payloads {
            stream.current.push(self.decoders.decode(type_name, payload)?);
        }
        Ok(())
    }

    /// Whether a decoder exists for `type_name`.
    pub(crate) fn can_decode(&self, type_name: &str) -> bool {
        self.decoders.contains(type_name)
    }

    /// Snapshots every non-empty value stream, ascending by type id.
    pub(crate) fn value_snapshots(&self) -> Vec<ValueStreamSnap> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut snaps: Vec<ValueStreamSnap> = values
            .iter()
            .filter(|(_, stream)| !stream.current.is_empty())
            .map(|(type_id, stream)| {
                let bytes = Bytes::copy_from_slice(stream.current.as_bytes());
                #[allow(clippy::cast_possible_truncation)]
                let elem_size = stream.elem_size as u32;
                #[allow(clippy::cast_possible_truncation)]
                let count = (bytes.len() / stream.elem_size) as u32;
                ValueStreamSnap {
                    type_id: *type_id,
                    elem_size,
                    count,
                    bytes,
                }
            })
            .collect();
        snaps.sort_by_key(|snap| snap.type_id);
        snaps
    }

    /// Snapshots every non-empty object stream, serializing payloads.
    pub(crate) fn object_snapshots(&self) -> Result<Vec<ObjectStreamSnap>, CodecError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut snaps = Vec::new();
        for (type_id, stream) in objects.iter() {
            if stream.current.is_empty() {
                continue;
            }
            let mut payloads = Vec::with_capacity(stream.current.len());
            for payload in &stream.current {
                payloads.push(payload.to_bytes()?);
            }
            snaps.push(ObjectStreamSnap {
                type_id: *type_id,
                type_name: stream.type_name.clone(),
                payloads,
            });
        }
        snaps.sort_by_key(|snap| snap.type_id);
        Ok(snaps)
    }
}
