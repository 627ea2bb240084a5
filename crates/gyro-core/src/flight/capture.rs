// SPDX-License-Identifier: Apache-2.0

//! Frame capture: selecting and copying repository state for one frame.
//!
//! Runs on the caller's thread. Only the chunks the frame will carry are
//! copied; for a delta that is exactly the set whose change version
//! exceeds the baseline tick. Object payloads are serialized here, because
//! the writer thread must never touch the repository.

use bytes::Bytes;

use crate::constants::MAX_CHUNKS;
use crate::event::EventBus;
use crate::registry::{ComponentTypeId, HEADER_TYPE_ID};
use crate::repo::Repository;
use crate::serializable::CodecError;
use crate::store::Store;

use super::format::{ChunkSnap, FramePayload, ObjectChunkSnap, ARENA_LANE_BIT, SINGLETON_CHUNK_INDEX};

/// What a capture is for; selects the policy gate and the chunk filter.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CaptureMode {
    /// Recorder keyframe: every populated chunk of recordable types.
    Keyframe,
    /// Recorder delta: chunks whose version exceeds the baseline.
    Delta(u64),
    /// Repository save: every populated chunk of saveable types.
    Save,
}

impl CaptureMode {
    fn baseline(self) -> Option<u64> {
        match self {
            Self::Delta(previous_tick) => Some(previous_tick),
            Self::Keyframe | Self::Save => None,
        }
    }

    fn is_keyframe(self) -> bool {
        matches!(self, Self::Keyframe | Self::Save)
    }
}

/// Builds the frame payload for `mode` from the repository and bus.
pub(crate) fn collect_frame(
    repo: &Repository,
    bus: Option<&EventBus>,
    mode: CaptureMode,
) -> Result<FramePayload, CodecError> {
    let mut frame = FramePayload {
        tick: repo.clock(),
        keyframe: mode.is_keyframe(),
        destroyed: repo.destroyed_this_frame().to_vec(),
        value_streams: Vec::new(),
        object_streams: Vec::new(),
        chunks: Vec::new(),
        object_chunks: Vec::new(),
    };

    if let Some(bus) = bus {
        frame.value_streams = bus.value_snapshots();
        frame.object_streams = bus.object_snapshots()?;
    }

    // Entity headers travel as reserved type 0.
    collect_table_chunks(
        &mut frame.chunks,
        HEADER_TYPE_ID,
        repo.entity_index().headers_table(),
        0,
        mode,
    );

    for (type_id, desc) in repo.registry().iter() {
        if type_id == HEADER_TYPE_ID {
            continue;
        }
        let included = match mode {
            CaptureMode::Keyframe | CaptureMode::Delta(_) => desc.policy.recordable,
            CaptureMode::Save => desc.policy.saveable,
        };
        if !included {
            continue;
        }
        match repo.store(type_id) {
            Some(Store::Inline(store)) => {
                collect_table_chunks(&mut frame.chunks, type_id, store.table(), 0, mode);
            }
            Some(Store::Singleton(store)) => {
                if !store.is_present() {
                    continue;
                }
                if let Some(baseline) = mode.baseline() {
                    if store.version() <= baseline {
                        continue;
                    }
                }
                if let Some(bytes) = store.get() {
                    #[allow(clippy::cast_possible_truncation)]
                    frame.chunks.push(ChunkSnap {
                        type_id: type_id.0,
                        chunk_index: SINGLETON_CHUNK_INDEX,
                        version: store.version(),
                        elem_size: store.elem_size() as u32,
                        bytes: Bytes::copy_from_slice(bytes),
                    });
                }
            }
            Some(Store::MultiPart(store)) => {
                collect_table_chunks(&mut frame.chunks, type_id, store.refs_table(), 0, mode);
                collect_table_chunks(
                    &mut frame.chunks,
                    type_id,
                    store.arena_table(),
                    ARENA_LANE_BIT,
                    mode,
                );
            }
            Some(Store::Object(store)) => {
                let snapshotable = match mode {
                    CaptureMode::Keyframe | CaptureMode::Delta(_) => desc.policy.snapshotable,
                    CaptureMode::Save => true,
                };
                if !snapshotable {
                    continue;
                }
                collect_object_chunks(&mut frame.object_chunks, repo, type_id, desc.name, store, mode)?;
            }
            None => {} // Tags carry no storage.
        }
    }

    Ok(frame)
}

fn collect_table_chunks(
    out: &mut Vec<ChunkSnap>,
    type_id: ComponentTypeId,
    table: &crate::chunk::ChunkTable,
    lane_bit: u32,
    mode: CaptureMode,
) {
    for chunk_ix in table.committed_chunks() {
        let version = table.version(chunk_ix);
        if let Some(baseline) = mode.baseline() {
            if version <= baseline {
                continue;
            }
        }
        let Some(chunk) = table.chunk(chunk_ix) else {
            continue;
        };
        #[allow(clippy::cast_possible_truncation)]
        out.push(ChunkSnap {
            type_id: type_id.0,
            chunk_index: chunk_ix as u32 | lane_bit,
            version,
            elem_size: table.elem_size() as u32,
            bytes: Bytes::copy_from_slice(chunk),
        });
    }
}

fn collect_object_chunks(
    out: &mut Vec<ObjectChunkSnap>,
    repo: &Repository,
    type_id: ComponentTypeId,
    type_name: &str,
    store: &crate::store::ObjectStore,
    mode: CaptureMode,
) -> Result<(), CodecError> {
    let chunk_set: Vec<usize> = match mode.baseline() {
        // Deltas must also cover chunks that became empty, so the filter is
        // the version array, not current occupancy.
        Some(baseline) => (0..MAX_CHUNKS)
            .filter(|chunk_ix| store.version(*chunk_ix) > baseline)
            .collect(),
        None => store.occupied_chunks(),
    };

    for chunk_ix in chunk_set {
        let mut items = Vec::new();
        for (index, payload) in store.slots_in_chunk(chunk_ix) {
            let live = repo
                .entity_index()
                .header(index)
                .map_or(false, |h| h.is_active() && h.component_mask.test(type_id));
            if !live {
                continue;
            }
            items.push((index, payload.to_bytes()?));
        }
        #[allow(clippy::cast_possible_truncation)]
        out.push(ObjectChunkSnap {
            type_id: type_id.0,
            chunk_index: chunk_ix as u32,
            version: store.version(chunk_ix),
            type_name: type_name.to_owned(),
            items,
        });
    }
    Ok(())
}
