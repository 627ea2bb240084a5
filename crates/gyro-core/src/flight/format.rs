// SPDX-License-Identifier: Apache-2.0

//! Recording file format, version 2.
//!
//! All integers are little-endian. Fixed-size rows are `#[repr(C)]`
//! `bytemuck::Pod` structs with explicit padding and compile-time size
//! pins; variable-size sections are length-prefixed so a reader can skip
//! them without decoding.
//!
//! File layout:
//! - [`FileHeader`]: magic + format version.
//! - Frames, back to back. Each frame: [`FrameHeader`], destruction list,
//!   value-event block, object-event block (every stream carries a block
//!   byte length for O(1) skip), chunk block.
//! - Optionally a keyframe table plus [`TrailerFooter`] written at close;
//!   the footer points back at the table.
//!
//! Chunk records double for three shapes discriminated by header fields:
//! ordinary chunks (`elem_size > 0`), singletons (`chunk_index` equals
//! [`SINGLETON_CHUNK_INDEX`], payload is one element), and serialized
//! object-component chunks (`elem_size == 0`, payload is a name plus
//! length-prefixed items). Multi-part arena chunks are ordinary chunks
//! whose index carries [`ARENA_LANE_BIT`].

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};

use crate::entity::Entity;
use crate::event::{ObjectStreamSnap, ValueStreamSnap};

/// Magic bytes opening every recording.
pub const MAGIC: [u8; 4] = *b"GYRO";

/// Current format version. Version 1 (no object block lengths) is not
/// read or written.
pub const FORMAT_VERSION: u32 = 2;

/// Frame kind byte for delta frames.
pub const FRAME_KIND_DELTA: u8 = 0;

/// Frame kind byte for keyframes.
pub const FRAME_KIND_KEYFRAME: u8 = 1;

/// Magic bytes of the keyframe-index trailer footer.
pub(crate) const TRAILER_MAGIC: [u8; 4] = *b"GYRX";

/// Sentinel chunk index marking a singleton record (one element payload).
pub(crate) const SINGLETON_CHUNK_INDEX: u32 = u32::MAX;

/// Set on chunk indices of a multi-part type's arena lane.
pub(crate) const ARENA_LANE_BIT: u32 = 1 << 31;

/// File header row (8 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct FileHeader {
    /// Magic bytes, [`MAGIC`].
    pub magic: [u8; 4],
    /// Format version (little-endian).
    pub version_le: u32,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == 8);

impl FileHeader {
    pub(crate) fn new() -> Self {
        Self {
            magic: MAGIC,
            version_le: FORMAT_VERSION.to_le(),
        }
    }

    pub(crate) fn version(&self) -> u32 {
        u32::from_le(self.version_le)
    }
}

/// Byte length of the file header.
pub(crate) fn file_header_len() -> usize {
    std::mem::size_of::<FileHeader>()
}

/// Frame header row (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct FrameHeader {
    /// Repository clock value this frame was captured at.
    pub tick_le: u64,
    /// [`FRAME_KIND_DELTA`] or [`FRAME_KIND_KEYFRAME`].
    pub kind: u8,
    /// Must be zero.
    pub reserved: [u8; 3],
    /// Number of destruction entries following the header.
    pub destruction_count_le: u32,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == 16);

impl FrameHeader {
    pub(crate) fn tick(&self) -> u64 {
        u64::from_le(self.tick_le)
    }

    pub(crate) fn destruction_count(&self) -> u32 {
        u32::from_le(self.destruction_count_le)
    }
}

/// Chunk record header row (24 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct ChunkRecordHeader {
    /// Dense component type id (fits in a byte, stored wide).
    pub type_id_le: u32,
    /// Chunk index, possibly carrying [`ARENA_LANE_BIT`] or the singleton
    /// sentinel.
    pub chunk_index_le: u32,
    /// Change version the chunk carried at capture.
    pub change_version_le: u64,
    /// Element size; 0 marks a serialized object-component record.
    pub elem_size_le: u32,
    /// Must be zero.
    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<ChunkRecordHeader>() == 24);

impl ChunkRecordHeader {
    pub(crate) fn type_id(&self) -> u32 {
        u32::from_le(self.type_id_le)
    }

    pub(crate) fn chunk_index(&self) -> u32 {
        u32::from_le(self.chunk_index_le)
    }

    pub(crate) fn change_version(&self) -> u64 {
        u64::from_le(self.change_version_le)
    }

    pub(crate) fn elem_size(&self) -> u32 {
        u32::from_le(self.elem_size_le)
    }
}

/// Trailer footer row (16 bytes), last bytes of a finished recording.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct TrailerFooter {
    /// Absolute offset of the keyframe table.
    pub table_offset_le: u64,
    /// Number of keyframe entries in the table.
    pub keyframe_count_le: u32,
    /// [`TRAILER_MAGIC`].
    pub magic: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<TrailerFooter>() == 16);

impl TrailerFooter {
    pub(crate) fn table_offset(&self) -> u64 {
        u64::from_le(self.table_offset_le)
    }

    pub(crate) fn keyframe_count(&self) -> u32 {
        u32::from_le(self.keyframe_count_le)
    }
}

/// Keyframe table entry (16 bytes): absolute frame offset and tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct KeyframeEntry {
    /// Absolute offset of the keyframe's frame header.
    pub offset_le: u64,
    /// The keyframe's tick.
    pub tick_le: u64,
}

const _: () = assert!(std::mem::size_of::<KeyframeEntry>() == 16);

/// A captured inline/singleton/arena chunk, bytes already copied.
#[derive(Debug, Clone)]
pub(crate) struct ChunkSnap {
    pub type_id: u8,
    pub chunk_index: u32,
    pub version: u64,
    pub elem_size: u32,
    pub bytes: Bytes,
}

/// A captured object-component chunk: serialized slots of one index range.
#[derive(Debug, Clone)]
pub(crate) struct ObjectChunkSnap {
    pub type_id: u8,
    pub chunk_index: u32,
    pub version: u64,
    pub type_name: String,
    pub items: Vec<(u32, Bytes)>,
}

/// Everything one frame carries, snapshotted and ready to encode.
#[derive(Debug, Clone)]
pub(crate) struct FramePayload {
    pub tick: u64,
    pub keyframe: bool,
    pub destroyed: Vec<Entity>,
    pub value_streams: Vec<ValueStreamSnap>,
    pub object_streams: Vec<ObjectStreamSnap>,
    pub chunks: Vec<ChunkSnap>,
    pub object_chunks: Vec<ObjectChunkSnap>,
}

/// Encodes one frame into a single contiguous buffer.
///
/// Writing a frame as one buffer is what keeps the header-before-payload
/// ordering trivially true on the writer thread: a truncated file ends on
/// a frame boundary at worst.
pub(crate) fn encode_frame(frame: &FramePayload) -> Bytes {
    let mut buf = BytesMut::new();

    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        tick_le: frame.tick.to_le(),
        kind: if frame.keyframe {
            FRAME_KIND_KEYFRAME
        } else {
            FRAME_KIND_DELTA
        },
        reserved: [0; 3],
        destruction_count_le: (frame.destroyed.len() as u32).to_le(),
    };
    buf.put_slice(bytemuck::bytes_of(&header));
    for entity in &frame.destroyed {
        buf.put_u32_le(entity.index());
        buf.put_u32_le(entity.generation());
    }

    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(frame.value_streams.len() as u32);
    for stream in &frame.value_streams {
        buf.put_u32_le(u32::from(stream.type_id));
        buf.put_u32_le(stream.elem_size);
        buf.put_u32_le(stream.count);
        buf.put_slice(&stream.bytes);
    }

    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(frame.object_streams.len() as u32);
    for stream in &frame.object_streams {
        buf.put_u32_le(u32::from(stream.type_id));
        buf.put_u32_le(0); // element size marker for object streams
        put_name(&mut buf, &stream.type_name);
        let block_len: usize = 4 + stream.payloads.iter().map(|p| 4 + p.len()).sum::<usize>();
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(block_len as u32);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(stream.payloads.len() as u32);
        for payload in &stream.payloads {
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(payload);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le((frame.chunks.len() + frame.object_chunks.len()) as u32);
    for chunk in &frame.chunks {
        let header = ChunkRecordHeader {
            type_id_le: u32::from(chunk.type_id).to_le(),
            chunk_index_le: chunk.chunk_index.to_le(),
            change_version_le: chunk.version.to_le(),
            elem_size_le: chunk.elem_size.to_le(),
            reserved: 0,
        };
        buf.put_slice(bytemuck::bytes_of(&header));
        buf.put_slice(&chunk.bytes);
    }
    for chunk in &frame.object_chunks {
        let header = ChunkRecordHeader {
            type_id_le: u32::from(chunk.type_id).to_le(),
            chunk_index_le: chunk.chunk_index.to_le(),
            change_version_le: chunk.version.to_le(),
            elem_size_le: 0,
            reserved: 0,
        };
        buf.put_slice(bytemuck::bytes_of(&header));
        put_name(&mut buf, &chunk.type_name);
        let block_len: usize = 4 + chunk.items.iter().map(|(_, p)| 8 + p.len()).sum::<usize>();
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(block_len as u32);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(chunk.items.len() as u32);
        for (index, payload) in &chunk.items {
            buf.put_u32_le(*index);
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(payload);
        }
    }

    buf.freeze()
}

/// Writes the keyframe table and trailer footer at the end of a recording.
pub(crate) fn write_trailer<W: std::io::Write>(
    sink: &mut W,
    table_offset: u64,
    keyframes: &[(u64, u64)],
) -> std::io::Result<()> {
    for (offset, tick) in keyframes {
        let entry = KeyframeEntry {
            offset_le: offset.to_le(),
            tick_le: tick.to_le(),
        };
        sink.write_all(bytemuck::bytes_of(&entry))?;
    }
    #[allow(clippy::cast_possible_truncation)]
    let footer = TrailerFooter {
        table_offset_le: table_offset.to_le(),
        keyframe_count_le: (keyframes.len() as u32).to_le(),
        magic: TRAILER_MAGIC,
    };
    sink.write_all(bytemuck::bytes_of(&footer))
}

fn put_name(buf: &mut BytesMut, name: &str) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(name.len() as u32);
    buf.put_slice(name.as_bytes());
}
