// SPDX-License-Identifier: Apache-2.0
//! gyro-core: deterministic chunked ECS kernel with an integrated flight
//! recorder.
//!
//! The kernel is a direct-mapped, chunked, structure-of-arrays repository:
//! generational entity handles, 256-bit component and authority masks,
//! change-version tracking at chunk granularity, a deferred command buffer,
//! and a phase-ordered scheduler. The flight recorder captures keyframes
//! and deltas of component state plus per-frame event streams into a
//! versioned binary file, and the playback path reconstructs recorded
//! chunk bytes exactly.
//!
//! The per-frame contract every host must follow:
//! `tick(); mutate…; capture_frame(previous_tick)`. Mutations made before
//! the tick carry the previous clock value and are silently absent from
//! the next delta frame.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod arena;
mod chunk;
mod command;
/// Build-time sizing constants (chunk capacity, entity and type ceilings).
pub mod constants;
mod entity;
mod event;
mod flight;
mod mask;
mod query;
mod registry;
mod repo;
mod schedule;
mod serializable;
mod store;

// Re-exports for the stable public API.
/// Reserve/commit arena errors.
pub use arena::{ArenaError, Region};
/// Deferred structural mutations and their playback.
pub use command::CommandBuffer;
/// Generational handles and the chunked entity header row.
pub use entity::{Entity, EntityHeader, HEADER_SIZE};
/// Double-buffered value/object event streams.
pub use event::{EventBus, ObjectEvent, ValueEvent};
/// Recording, playback and repository save/load.
pub use flight::{
    FrameStats, Playback, PlaybackError, QueuePolicy, RecordError, Recorder, FORMAT_VERSION,
    FRAME_KIND_DELTA, FRAME_KIND_KEYFRAME, MAGIC,
};
/// 256-bit component masks.
pub use mask::Mask256;
/// Query building, iteration and the reusable key sorter.
pub use query::{KeySorter, Query, QueryBuilder, QueryIter};
/// Type registration surface: ids, storage classes, capture policies.
pub use registry::{
    ComponentTypeId, DataPolicy, RegistryError, StorageClass, TypeDescriptor, HEADER_TYPE_ID,
};
/// The repository and its error type.
pub use repo::{RepoError, Repository};
/// Phase-ordered system scheduling.
pub use schedule::{Constraint, Phase, Schedule, ScheduleError, System, SystemContext, SystemId};
/// Object payload codec boundary.
pub use serializable::{CodecError, ObjectPayload, ObjectRegistry};
