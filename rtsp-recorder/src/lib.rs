//! Per-stream RTSP recording pipeline.
//!
//! Each stream gets one long-lived worker thread that keeps a single RTSP
//! input session alive across segments and emits a contiguous sequence of
//! fixed-duration fragmented MP4 files, keyframe-bracketed, with normalized
//! timestamps. Recording metadata is kept consistent with the on-disk files
//! through the `recording-catalog` crate.
//!
//! # Layering
//!
//! - [`timestamp`]: pure per-track timestamp normalization
//! - [`fmp4`]: fragmented MP4 box serialization
//! - [`input`]: the RTSP input session behind a trait seam
//! - [`segment`]: one input session → one MP4 file, keyframe-bracketed
//! - [`recorder`]: the per-stream worker (rotation, catalog, backoff)

pub mod fmp4;
pub mod input;
pub mod recorder;
pub mod segment;
pub mod timestamp;

mod error;

pub use error::{InputError, MuxerError, SegmentError};
pub use input::{AudioTrackInfo, InputOpener, InputSession, MediaPacket, PacketPoll, TrackKind, VideoTrackInfo};
pub use recorder::{spawn_recorder, RecorderHandle, StopSignal};
pub use segment::{record_segment, ContinuityState, SegmentOptions, SegmentOutcome};
pub use timestamp::TimestampNormalizer;
