// SPDX-License-Identifier: Apache-2.0

//! The recorder: frame capture feeding a background writer thread.
//!
//! `capture_*` snapshots frame contents on the caller's thread, encodes
//! them into one contiguous buffer, and queues the buffer on a bounded
//! channel. The writer thread owns the sink, tracks keyframe offsets, and
//! appends the keyframe table and trailer when the recorder finishes. It
//! never touches the repository.

use std::io::Write;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::event::EventBus;
use crate::repo::Repository;
use crate::serializable::CodecError;

use super::capture::{collect_frame, CaptureMode};
use super::format::{encode_frame, write_trailer, FileHeader};

/// What a capture does when the writer queue is full.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueuePolicy {
    /// Block the caller until the writer drains a slot.
    Block,
    /// Drop the frame and count it; the capture still succeeds.
    Drop,
}

/// Summary of one successful capture.
#[derive(Clone, Copy, Debug)]
pub struct FrameStats {
    /// Tick the frame was captured at.
    pub tick: u64,
    /// Whether the frame is a keyframe.
    pub keyframe: bool,
    /// Chunk records in the frame (all shapes).
    pub chunks: usize,
    /// Value-event streams in the frame.
    pub value_streams: usize,
    /// Object-event streams in the frame.
    pub object_streams: usize,
    /// Destruction entries in the frame.
    pub destroyed: usize,
    /// Whether the frame was dropped by queue backpressure.
    pub dropped: bool,
}

/// Errors surfaced by the recorder.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The underlying sink failed; the recorder is now poisoned.
    #[error("recording sink failed")]
    Sink(#[source] std::io::Error),

    /// The recorder already failed; no further frames are accepted.
    #[error("recorder is poisoned by an earlier sink failure")]
    Poisoned,

    /// An object payload refused to serialize.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

struct WriterFrame {
    bytes: Bytes,
    tick: u64,
    keyframe: bool,
}

/// A recorder: owns its sink through a background writer thread.
#[derive(Debug)]
pub struct Recorder {
    tx: Option<Sender<WriterFrame>>,
    err_rx: Receiver<std::io::Error>,
    handle: Option<JoinHandle<()>>,
    policy: QueuePolicy,
    dropped: u64,
    poisoned: bool,
}

impl Recorder {
    /// Starts a recorder writing to `sink` with a queue of `queue_frames`
    /// in-flight frames.
    ///
    /// The file header is written by the writer thread before any frame.
    pub fn create<W: Write + Send + 'static>(
        sink: W,
        policy: QueuePolicy,
        queue_frames: usize,
    ) -> Self {
        let (tx, rx) = bounded::<WriterFrame>(queue_frames.max(1));
        let (err_tx, err_rx) = bounded::<std::io::Error>(1);
        let err_tx_thread = err_tx.clone();
        let handle = std::thread::Builder::new()
            .name("gyro-recorder".to_owned())
            .spawn(move || writer_loop(sink, &rx, &err_tx_thread));
        match handle {
            Ok(handle) => Self {
                tx: Some(tx),
                err_rx,
                handle: Some(handle),
                policy,
                dropped: 0,
                poisoned: false,
            },
            Err(spawn_err) => {
                error!(error = %spawn_err, "failed to spawn recorder writer thread");
                let _ = err_tx.try_send(spawn_err);
                Self {
                    tx: None,
                    err_rx,
                    handle: None,
                    policy,
                    dropped: 0,
                    poisoned: false,
                }
            }
        }
    }

    /// Captures a keyframe: every populated chunk of recordable types.
    pub fn capture_keyframe(
        &mut self,
        repo: &Repository,
        bus: &EventBus,
    ) -> Result<FrameStats, RecordError> {
        self.capture(repo, bus, CaptureMode::Keyframe)
    }

    /// Captures a delta frame against `previous_tick`.
    ///
    /// A chunk is written iff its change version exceeds `previous_tick`.
    /// This relies on the `tick(); mutate…; capture_frame(previous_tick)`
    /// ordering contract; mutations made before the tick are not captured.
    pub fn capture_frame(
        &mut self,
        repo: &Repository,
        bus: &EventBus,
        previous_tick: u64,
    ) -> Result<FrameStats, RecordError> {
        self.capture(repo, bus, CaptureMode::Delta(previous_tick))
    }

    /// Frames dropped by queue backpressure so far.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Stops accepting frames, drains the queue, writes the keyframe index
    /// trailer, and joins the writer thread.
    pub fn finish(mut self) -> Result<(), RecordError> {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match self.err_rx.try_recv() {
            Ok(err) => Err(RecordError::Sink(err)),
            Err(_) => Ok(()),
        }
    }

    fn capture(
        &mut self,
        repo: &Repository,
        bus: &EventBus,
        mode: CaptureMode,
    ) -> Result<FrameStats, RecordError> {
        if self.poisoned {
            return Err(RecordError::Poisoned);
        }
        if let Ok(err) = self.err_rx.try_recv() {
            self.poisoned = true;
            return Err(RecordError::Sink(err));
        }
        let Some(tx) = self.tx.as_ref() else {
            self.poisoned = true;
            return Err(RecordError::Poisoned);
        };

        let frame = collect_frame(repo, Some(bus), mode)?;
        debug_assert!(
            frame.keyframe || frame.destroyed.is_empty() || !frame.chunks.is_empty(),
            "delta captured destructions but no changed chunks; \
             was tick() called before this frame's mutations?"
        );
        let mut stats = FrameStats {
            tick: frame.tick,
            keyframe: frame.keyframe,
            chunks: frame.chunks.len() + frame.object_chunks.len(),
            value_streams: frame.value_streams.len(),
            object_streams: frame.object_streams.len(),
            destroyed: frame.destroyed.len(),
            dropped: false,
        };
        let message = WriterFrame {
            bytes: encode_frame(&frame),
            tick: frame.tick,
            keyframe: frame.keyframe,
        };

        match self.policy {
            QueuePolicy::Block => {
                if tx.send(message).is_err() {
                    self.poisoned = true;
                    return match self.err_rx.try_recv() {
                        Ok(err) => Err(RecordError::Sink(err)),
                        Err(_) => Err(RecordError::Poisoned),
                    };
                }
            }
            QueuePolicy::Drop => match tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    stats.dropped = true;
                    warn!(tick = stats.tick, dropped = self.dropped, "writer queue full, frame dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.poisoned = true;
                    return match self.err_rx.try_recv() {
                        Ok(err) => Err(RecordError::Sink(err)),
                        Err(_) => Err(RecordError::Poisoned),
                    };
                }
            },
        }
        trace!(tick = stats.tick, keyframe = stats.keyframe, chunks = stats.chunks, "frame captured");
        Ok(stats)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Writer thread body: header first, then frames in order, then trailer.
fn writer_loop<W: Write>(mut sink: W, rx: &Receiver<WriterFrame>, err_tx: &Sender<std::io::Error>) {
    let header = FileHeader::new();
    if let Err(err) = sink.write_all(bytemuck::bytes_of(&header)) {
        let _ = err_tx.try_send(err);
        // Drain so producers with a Block policy are not wedged.
        for _frame in rx.iter() {}
        return;
    }
    let mut offset = std::mem::size_of::<FileHeader>() as u64;
    let mut keyframes: Vec<(u64, u64)> = Vec::new();

    for frame in rx.iter() {
        if frame.keyframe {
            keyframes.push((offset, frame.tick));
        }
        if let Err(err) = sink.write_all(&frame.bytes) {
            let _ = err_tx.try_send(err);
            for _frame in rx.iter() {}
            return;
        }
        offset += frame.bytes.len() as u64;
    }

    if let Err(err) = write_trailer(&mut sink, offset, &keyframes) {
        let _ = err_tx.try_send(err);
        return;
    }
    if let Err(err) = sink.flush() {
        let _ = err_tx.try_send(err);
    }
}
