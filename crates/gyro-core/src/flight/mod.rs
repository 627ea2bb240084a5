// SPDX-License-Identifier: Apache-2.0

//! The flight recorder: versioned binary recordings and exact playback.
//!
//! A recording is a header, a sequence of frames (keyframes carrying every
//! populated chunk, deltas carrying only chunks whose change version moved),
//! and an optional keyframe index trailer written at close. Playback applies
//! frames back onto a repository whose type registrations mirror the
//! source's, reconstructing chunk bytes bit-exactly.
//!
//! Capture runs on the caller's thread and only copies the selected chunk
//! bytes and event buffers; encoding and I/O happen on the recorder's
//! writer thread, fed through a bounded queue.

mod capture;
mod format;
mod playback;
mod recorder;

pub use format::{FORMAT_VERSION, FRAME_KIND_DELTA, FRAME_KIND_KEYFRAME, MAGIC};
pub use playback::{Playback, PlaybackError};
pub use recorder::{FrameStats, QueuePolicy, RecordError, Recorder};

use std::io::{Read, Seek, Write};

use crate::event::EventBus;
use crate::repo::Repository;

impl Repository {
    /// Saves the repository as a single-keyframe recording.
    ///
    /// Only types whose policy is `saveable` are written; event streams are
    /// not part of a save.
    pub fn save<W: Write>(&self, mut sink: W) -> Result<(), RecordError> {
        let frame = capture::collect_frame(self, None, capture::CaptureMode::Save)?;
        let bytes = format::encode_frame(&frame);
        sink.write_all(bytemuck::bytes_of(&format::FileHeader::new()))
            .map_err(RecordError::Sink)?;
        sink.write_all(&bytes).map_err(RecordError::Sink)?;
        format::write_trailer(
            &mut sink,
            format::file_header_len() as u64 + bytes.len() as u64,
            &[(format::file_header_len() as u64, frame.tick)],
        )
        .map_err(RecordError::Sink)?;
        sink.flush().map_err(RecordError::Sink)?;
        Ok(())
    }

    /// Loads a saved recording into this repository.
    ///
    /// The repository must carry the same type registrations, in the same
    /// order, as the one that produced the save.
    pub fn load<R: Read + Seek>(&mut self, source: R) -> Result<(), PlaybackError> {
        let mut playback = Playback::open(source)?;
        let mut scratch_bus = EventBus::new();
        playback.step_forward(self, &mut scratch_bus)?;
        Ok(())
    }
}
