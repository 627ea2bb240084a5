// SPDX-License-Identifier: Apache-2.0

//! Playback: reading recordings and applying frames exactly.
//!
//! The controller never executes simulation; it applies recorded state
//! only. Intermediate frames visited during a seek are applied with
//! `process_events = false`: component chunks still land (they are state),
//! but event sections are skipped in O(1) using their declared block
//! lengths, so seeking is not dominated by event deserialization.

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::constants::CHUNK_CAPACITY;
use crate::entity::HEADER_SIZE;
use crate::event::EventBus;
use crate::registry::{ComponentTypeId, StorageClass, HEADER_TYPE_ID};
use crate::repo::{RepoError, Repository};
use crate::serializable::CodecError;
use crate::store::Store;

use super::format::{
    ChunkRecordHeader, FileHeader, FrameHeader, KeyframeEntry, TrailerFooter, ARENA_LANE_BIT,
    FORMAT_VERSION, FRAME_KIND_KEYFRAME, MAGIC, SINGLETON_CHUNK_INDEX, TRAILER_MAGIC,
};

/// Errors surfaced while opening or applying a recording.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// Reading the source failed.
    #[error("playback source failed")]
    Io(#[from] std::io::Error),

    /// The file does not open with the recording magic.
    #[error("bad magic: found {found:?}")]
    BadMagic {
        /// The four bytes found instead.
        found: [u8; 4],
    },

    /// The file's format version is not readable by this build.
    #[error("unsupported recording format version {0} (supported: {FORMAT_VERSION})")]
    UnsupportedVersion(u32),

    /// The file ends in the middle of a structure.
    #[error("recording truncated at byte {offset}")]
    Truncated {
        /// File offset where data ran out.
        offset: u64,
    },

    /// A frame structure is internally inconsistent.
    #[error("malformed recording at byte {offset}: {what}")]
    Malformed {
        /// File offset of the offending structure.
        offset: u64,
        /// What was wrong.
        what: &'static str,
    },

    /// An object stream or record names a type this process cannot decode.
    #[error("unknown object type name {name} in frame {frame}")]
    UnknownTypeName {
        /// The recorded type name.
        name: String,
        /// Frame number being applied.
        frame: usize,
    },

    /// A chunk record names a dense type id with no registration.
    #[error("recorded type id {type_id} is not registered in frame {frame}")]
    UnknownTypeId {
        /// The recorded dense id.
        type_id: u8,
        /// Frame number being applied.
        frame: usize,
    },

    /// The requested frame does not exist.
    #[error("frame {frame} out of range; recording has {available} frames")]
    FrameOutOfRange {
        /// Requested frame number.
        frame: usize,
        /// Frames available.
        available: usize,
    },

    /// Payload deserialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Applying recorded state to the repository failed.
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, Copy)]
struct FrameEntry {
    offset: u64,
    len: u64,
    tick: u64,
    keyframe: bool,
}

/// A playback controller over a seekable recording source.
#[derive(Debug)]
pub struct Playback<R: Read + Seek> {
    source: R,
    index: Vec<FrameEntry>,
    cursor: usize,
    current_tick: Option<u64>,
}

impl<R: Read + Seek> Playback<R> {
    /// Opens a recording: validates the header and indexes every frame.
    ///
    /// When the recorder wrote a keyframe trailer it bounds the frame
    /// region; the frame index itself always comes from a header scan, so
    /// an unfinished recording (no trailer) opens fine.
    pub fn open(mut source: R) -> Result<Self, PlaybackError> {
        source.seek(SeekFrom::Start(0))?;
        let mut header_bytes = [0u8; std::mem::size_of::<FileHeader>()];
        read_exact(&mut source, &mut header_bytes, 0)?;
        let header: FileHeader = bytemuck::pod_read_unaligned(&header_bytes);
        if header.magic != MAGIC {
            return Err(PlaybackError::BadMagic {
                found: header.magic,
            });
        }
        if header.version() != FORMAT_VERSION {
            return Err(PlaybackError::UnsupportedVersion(header.version()));
        }

        let file_len = source.seek(SeekFrom::End(0))?;
        let trailer = read_trailer(&mut source, file_len)?;
        let frames_end = trailer.as_ref().map_or(file_len, |t| t.frames_end);

        let mut index = Vec::new();
        let mut offset = std::mem::size_of::<FileHeader>() as u64;
        while offset < frames_end {
            let entry = scan_frame(&mut source, offset)?;
            index.push(entry);
            offset += entry.len;
        }

        // A finished recording's trailer must agree with the header scan.
        if let Some(trailer) = trailer {
            let scanned: Vec<(u64, u64)> = index
                .iter()
                .filter(|entry| entry.keyframe)
                .map(|entry| (entry.offset, entry.tick))
                .collect();
            if scanned != trailer.keyframes {
                return Err(PlaybackError::Malformed {
                    offset: trailer.frames_end,
                    what: "keyframe table disagrees with frame headers",
                });
            }
        }

        Ok(Self {
            source,
            index,
            cursor: 0,
            current_tick: None,
        })
    }

    /// Number of frames in the recording.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    /// The next frame [`Self::step_forward`] would apply.
    #[must_use]
    pub fn frame(&self) -> usize {
        self.cursor
    }

    /// Tick of the most recently applied frame.
    #[must_use]
    pub fn tick(&self) -> Option<u64> {
        self.current_tick
    }

    /// Ticks of every keyframe, in frame order.
    #[must_use]
    pub fn keyframe_ticks(&self) -> Vec<u64> {
        self.index
            .iter()
            .filter(|entry| entry.keyframe)
            .map(|entry| entry.tick)
            .collect()
    }

    /// Applies the next frame. Returns `false` at end of recording.
    pub fn step_forward(
        &mut self,
        repo: &mut Repository,
        bus: &mut EventBus,
    ) -> Result<bool, PlaybackError> {
        if self.cursor >= self.index.len() {
            return Ok(false);
        }
        self.apply_frame(self.cursor, repo, bus, true)?;
        self.cursor += 1;
        Ok(true)
    }

    /// Moves the cursor back to frame 0. State is not touched until the
    /// next step applies the opening keyframe.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.current_tick = None;
    }

    /// Seeks so that frame `target` is applied and the cursor rests after
    /// it.
    ///
    /// Applies the nearest keyframe at or before `target`, then the deltas
    /// up to `target`. Only the target frame processes events; the
    /// intermediate frames skip their event sections via block lengths.
    pub fn seek_to_frame(
        &mut self,
        repo: &mut Repository,
        bus: &mut EventBus,
        target: usize,
    ) -> Result<(), PlaybackError> {
        if target >= self.index.len() {
            return Err(PlaybackError::FrameOutOfRange {
                frame: target,
                available: self.index.len(),
            });
        }
        let start = self.index[..=target]
            .iter()
            .rposition(|entry| entry.keyframe)
            .unwrap_or(0);
        for frame_ix in start..=target {
            self.apply_frame(frame_ix, repo, bus, frame_ix == target)?;
        }
        self.cursor = target + 1;
        Ok(())
    }

    fn apply_frame(
        &mut self,
        frame_ix: usize,
        repo: &mut Repository,
        bus: &mut EventBus,
        process_events: bool,
    ) -> Result<(), PlaybackError> {
        let entry = self.index[frame_ix];
        let mut buf = vec![0u8; usize::try_from(entry.len).map_err(|_| {
            PlaybackError::Malformed {
                offset: entry.offset,
                what: "frame too large for this platform",
            }
        })?];
        self.source.seek(SeekFrom::Start(entry.offset))?;
        read_exact(&mut self.source, &mut buf, entry.offset)?;
        let mut reader = FrameReader {
            buf: &buf,
            pos: 0,
            base: entry.offset,
        };

        let header_bytes = reader.take(std::mem::size_of::<FrameHeader>())?;
        let header: FrameHeader = bytemuck::pod_read_unaligned(header_bytes);
        if header.reserved != [0; 3] {
            return Err(PlaybackError::Malformed {
                offset: entry.offset,
                what: "frame header reserved bytes are not zero",
            });
        }
        let tick = header.tick();
        let keyframe = header.kind == FRAME_KIND_KEYFRAME;

        if keyframe {
            repo.reset_state();
        }

        // Destructions: header bits arrive via chunk records; here we drop
        // payloads the records may no longer mention.
        for _ in 0..header.destruction_count() {
            let index = reader.u32()?;
            let _generation = reader.u32()?;
            repo.clear_entity_slots(index);
        }

        if process_events {
            bus.clear_current();
        }

        // Value events.
        let value_streams = reader.u32()?;
        for _ in 0..value_streams {
            let type_id = reader.u32()?;
            let elem_size = reader.u32()? as usize;
            let count = reader.u32()? as usize;
            if elem_size == 0 {
                return Err(PlaybackError::Malformed {
                    offset: reader.abs(),
                    what: "value stream with zero element size",
                });
            }
            let bytes = reader.take(count * elem_size)?;
            if process_events {
                #[allow(clippy::cast_possible_truncation)]
                bus.inject_value(type_id as u16, elem_size, bytes);
            }
        }

        // Object events.
        let object_streams = reader.u32()?;
        for _ in 0..object_streams {
            let type_id = reader.u32()?;
            let marker = reader.u32()?;
            if marker != 0 {
                return Err(PlaybackError::Malformed {
                    offset: reader.abs(),
                    what: "object stream marker element size must be zero",
                });
            }
            let name = reader.name()?;
            let block_len = reader.u32()? as usize;
            if process_events {
                let block_end = reader.pos + block_len;
                let count = reader.u32()? as usize;
                let mut payloads = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = reader.u32()? as usize;
                    payloads.push(Bytes::copy_from_slice(reader.take(len)?));
                }
                if reader.pos != block_end {
                    return Err(PlaybackError::Malformed {
                        offset: reader.abs(),
                        what: "object stream block length disagrees with payloads",
                    });
                }
                #[allow(clippy::cast_possible_truncation)]
                bus.inject_object(type_id as u16, &name, &payloads)
                    .map_err(|err| match err {
                        CodecError::UnknownTypeName { name } => PlaybackError::UnknownTypeName {
                            name,
                            frame: frame_ix,
                        },
                        other => PlaybackError::Codec(other),
                    })?;
            } else {
                // O(1) skip; an unknown type name is recoverable here.
                if !bus.can_decode(&name) {
                    warn!(type_name = %name, frame = frame_ix, "skipping undecodable object stream");
                }
                reader.skip(block_len)?;
            }
        }

        // Chunk records.
        let mut touched_headers = keyframe;
        let mut touched_multipart: Vec<ComponentTypeId> = Vec::new();
        let chunk_count = reader.u32()?;
        for _ in 0..chunk_count {
            let record_bytes = reader.take(std::mem::size_of::<ChunkRecordHeader>())?;
            let record: ChunkRecordHeader = bytemuck::pod_read_unaligned(record_bytes);
            #[allow(clippy::cast_possible_truncation)]
            let type_id = ComponentTypeId(record.type_id() as u8);
            if type_id == HEADER_TYPE_ID {
                touched_headers = true;
            }
            apply_chunk_record(
                repo,
                &mut reader,
                &record,
                type_id,
                tick,
                frame_ix,
                &mut touched_multipart,
            )?;
        }
        if reader.pos != buf.len() {
            return Err(PlaybackError::Malformed {
                offset: reader.abs(),
                what: "trailing bytes after chunk block",
            });
        }

        if touched_headers {
            repo.entity_index_mut().rebuild_metadata();
        }
        for type_id in touched_multipart {
            if let Some(Store::MultiPart(store)) = repo.store_mut(type_id) {
                store.rebuild_tail();
            }
        }
        repo.set_clock(tick);
        self.current_tick = Some(tick);
        Ok(())
    }
}

fn apply_chunk_record(
    repo: &mut Repository,
    reader: &mut FrameReader<'_>,
    record: &ChunkRecordHeader,
    type_id: ComponentTypeId,
    tick: u64,
    frame_ix: usize,
    touched_multipart: &mut Vec<ComponentTypeId>,
) -> Result<(), PlaybackError> {
    if record.reserved != 0 {
        return Err(PlaybackError::Malformed {
            offset: reader.abs(),
            what: "chunk record reserved field is not zero",
        });
    }
    let elem_size = record.elem_size() as usize;
    let chunk_index = record.chunk_index();

    let Some(desc) = repo.registry().descriptor(type_id) else {
        return Err(PlaybackError::UnknownTypeId {
            type_id: type_id.0,
            frame: frame_ix,
        });
    };
    let storage = desc.storage;
    let desc_elem = desc.elem_size;

    // Serialized object-component record.
    if elem_size == 0 {
        let name = reader.name()?;
        let block_len = reader.u32()? as usize;
        let block_end = reader.pos + block_len;
        let count = reader.u32()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let index = reader.u32()?;
            let len = reader.u32()? as usize;
            items.push((index, Bytes::copy_from_slice(reader.take(len)?)));
        }
        if reader.pos != block_end {
            return Err(PlaybackError::Malformed {
                offset: reader.abs(),
                what: "object chunk block length disagrees with items",
            });
        }
        if !repo.object_registry().contains(&name) {
            return Err(PlaybackError::UnknownTypeName {
                name,
                frame: frame_ix,
            });
        }
        let mut decoded = Vec::with_capacity(items.len());
        for (index, payload) in &items {
            decoded.push((*index, repo.object_registry().decode(&name, payload)?));
        }
        let Some(Store::Object(store)) = repo.store_mut(type_id) else {
            return Err(PlaybackError::Malformed {
                offset: reader.abs(),
                what: "object record targets a non-object type",
            });
        };
        store.clear_chunk(chunk_index as usize);
        for (index, payload) in decoded {
            store.insert(index, payload, tick);
        }
        store.set_version(chunk_index as usize, tick);
        return Ok(());
    }

    // Singleton record: exactly one element.
    if chunk_index == SINGLETON_CHUNK_INDEX {
        if storage != StorageClass::Singleton || elem_size != desc_elem {
            return Err(PlaybackError::Malformed {
                offset: reader.abs(),
                what: "singleton record disagrees with registration",
            });
        }
        let bytes = reader.take(elem_size)?;
        let Some(Store::Singleton(store)) = repo.store_mut(type_id) else {
            return Err(PlaybackError::Malformed {
                offset: reader.abs(),
                what: "singleton record targets a non-singleton type",
            });
        };
        store.get_mut(tick).copy_from_slice(bytes);
        return Ok(());
    }

    // Ordinary chunk payload: a full chunk of elements.
    let payload_len = elem_size
        .checked_mul(CHUNK_CAPACITY)
        .ok_or(PlaybackError::Malformed {
            offset: reader.abs(),
            what: "chunk payload size overflow",
        })?;
    let bytes = reader.take(payload_len)?;
    let lane_is_arena = chunk_index & ARENA_LANE_BIT != 0;
    let chunk_ix = (chunk_index & !ARENA_LANE_BIT) as usize;

    let table = if type_id == HEADER_TYPE_ID {
        if elem_size != HEADER_SIZE {
            return Err(PlaybackError::Malformed {
                offset: reader.abs(),
                what: "header record element size mismatch",
            });
        }
        repo.entity_index_mut().headers_table_mut()
    } else {
        match (storage, lane_is_arena) {
            (StorageClass::InlineValue, false) => {
                if elem_size != desc_elem {
                    return Err(PlaybackError::Malformed {
                        offset: reader.abs(),
                        what: "inline record element size mismatch",
                    });
                }
                match repo.store_mut(type_id) {
                    Some(Store::Inline(store)) => store.table_mut(),
                    _ => {
                        return Err(PlaybackError::Malformed {
                            offset: reader.abs(),
                            what: "inline record targets a non-inline type",
                        })
                    }
                }
            }
            (StorageClass::MultiPart, arena) => {
                touched_multipart.push(type_id);
                match repo.store_mut(type_id) {
                    Some(Store::MultiPart(store)) => {
                        if arena {
                            if elem_size != store.elem_size() {
                                return Err(PlaybackError::Malformed {
                                    offset: reader.abs(),
                                    what: "arena record element size mismatch",
                                });
                            }
                            store.arena_table_mut()
                        } else {
                            if elem_size != std::mem::size_of::<crate::store::PartRef>() {
                                return Err(PlaybackError::Malformed {
                                    offset: reader.abs(),
                                    what: "indirection record element size mismatch",
                                });
                            }
                            store.refs_table_mut()
                        }
                    }
                    _ => {
                        return Err(PlaybackError::Malformed {
                            offset: reader.abs(),
                            what: "multi-part record targets a non-multi-part type",
                        })
                    }
                }
            }
            _ => {
                return Err(PlaybackError::Malformed {
                    offset: reader.abs(),
                    what: "chunk record disagrees with the type's storage class",
                })
            }
        }
    };

    table
        .chunk_mut(chunk_ix, tick)
        .map_err(RepoError::from)?
        .copy_from_slice(bytes);
    Ok(())
}

// ── Low-level reading ───────────────────────────────────────────────

fn read_exact<R: Read>(source: &mut R, buf: &mut [u8], offset: u64) -> Result<(), PlaybackError> {
    source.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            PlaybackError::Truncated { offset }
        } else {
            PlaybackError::Io(err)
        }
    })
}

struct Trailer {
    frames_end: u64,
    keyframes: Vec<(u64, u64)>,
}

/// Reads the trailer footer and keyframe table, if present.
fn read_trailer<R: Read + Seek>(
    source: &mut R,
    file_len: u64,
) -> Result<Option<Trailer>, PlaybackError> {
    let footer_len = std::mem::size_of::<TrailerFooter>() as u64;
    let header_len = std::mem::size_of::<FileHeader>() as u64;
    if file_len < header_len + footer_len {
        return Ok(None);
    }
    source.seek(SeekFrom::Start(file_len - footer_len))?;
    let mut bytes = [0u8; std::mem::size_of::<TrailerFooter>()];
    read_exact(source, &mut bytes, file_len - footer_len)?;
    let footer: TrailerFooter = bytemuck::pod_read_unaligned(&bytes);
    if footer.magic != TRAILER_MAGIC {
        return Ok(None);
    }
    let entry_len = std::mem::size_of::<KeyframeEntry>() as u64;
    let table_len = u64::from(footer.keyframe_count()) * entry_len;
    let table_offset = footer.table_offset();
    if table_offset + table_len + footer_len != file_len || table_offset < header_len {
        return Err(PlaybackError::Malformed {
            offset: file_len - footer_len,
            what: "trailer table bounds disagree with file size",
        });
    }

    source.seek(SeekFrom::Start(table_offset))?;
    let mut keyframes = Vec::with_capacity(footer.keyframe_count() as usize);
    let mut entry_bytes = [0u8; std::mem::size_of::<KeyframeEntry>()];
    for i in 0..footer.keyframe_count() {
        read_exact(source, &mut entry_bytes, table_offset + u64::from(i) * entry_len)?;
        let entry: KeyframeEntry = bytemuck::pod_read_unaligned(&entry_bytes);
        keyframes.push((u64::from_le(entry.offset_le), u64::from_le(entry.tick_le)));
    }
    Ok(Some(Trailer {
        frames_end: table_offset,
        keyframes,
    }))
}

/// Parses one frame's skeleton without decoding payloads.
fn scan_frame<R: Read + Seek>(source: &mut R, start: u64) -> Result<FrameEntry, PlaybackError> {
    let mut scanner = Scanner {
        source,
        offset: start,
    };
    let mut header_bytes = [0u8; std::mem::size_of::<FrameHeader>()];
    scanner.read(&mut header_bytes)?;
    let header: FrameHeader = bytemuck::pod_read_unaligned(&header_bytes);

    scanner.skip(u64::from(header.destruction_count()) * 8)?;

    let value_streams = scanner.u32()?;
    for _ in 0..value_streams {
        let _type_id = scanner.u32()?;
        let elem_size = scanner.u32()?;
        let count = scanner.u32()?;
        scanner.skip(u64::from(elem_size) * u64::from(count))?;
    }

    let object_streams = scanner.u32()?;
    for _ in 0..object_streams {
        let _type_id = scanner.u32()?;
        let _marker = scanner.u32()?;
        let name_len = scanner.u32()?;
        scanner.skip(u64::from(name_len))?;
        let block_len = scanner.u32()?;
        scanner.skip(u64::from(block_len))?;
    }

    let chunk_count = scanner.u32()?;
    for _ in 0..chunk_count {
        let mut record_bytes = [0u8; std::mem::size_of::<ChunkRecordHeader>()];
        scanner.read(&mut record_bytes)?;
        let record: ChunkRecordHeader = bytemuck::pod_read_unaligned(&record_bytes);
        if record.elem_size() == 0 {
            let name_len = scanner.u32()?;
            scanner.skip(u64::from(name_len))?;
            let block_len = scanner.u32()?;
            scanner.skip(u64::from(block_len))?;
        } else if record.chunk_index() == SINGLETON_CHUNK_INDEX {
            scanner.skip(u64::from(record.elem_size()))?;
        } else {
            scanner.skip(u64::from(record.elem_size()) * CHUNK_CAPACITY as u64)?;
        }
    }

    Ok(FrameEntry {
        offset: start,
        len: scanner.offset - start,
        tick: header.tick(),
        keyframe: header.kind == FRAME_KIND_KEYFRAME,
    })
}

struct Scanner<'a, R: Read + Seek> {
    source: &'a mut R,
    offset: u64,
}

impl<R: Read + Seek> Scanner<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), PlaybackError> {
        read_exact(self.source, buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, PlaybackError> {
        let mut bytes = [0u8; 4];
        self.read(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn skip(&mut self, bytes: u64) -> Result<(), PlaybackError> {
        let skip = i64::try_from(bytes).map_err(|_| PlaybackError::Malformed {
            offset: self.offset,
            what: "skip length overflow",
        })?;
        self.source.seek(SeekFrom::Current(skip))?;
        self.offset += bytes;
        Ok(())
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> FrameReader<'a> {
    fn abs(&self) -> u64 {
        self.base + self.pos as u64
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PlaybackError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(PlaybackError::Truncated { offset: self.abs() })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, PlaybackError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, len: usize) -> Result<(), PlaybackError> {
        let _ = self.take(len)?;
        Ok(())
    }

    fn name(&mut self) -> Result<String, PlaybackError> {
        let len = self.u32()? as usize;
        let offset = self.abs();
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PlaybackError::Malformed {
            offset,
            what: "type name is not UTF-8",
        })
    }
}
