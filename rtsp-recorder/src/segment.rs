//! The segment writer: one input session in, one keyframe-bracketed
//! fragmented MP4 file out.
//!
//! Segment progress is an explicit state machine driven by a single thread
//! reading from a blocking packet source:
//!
//! ```text
//! WaitFirstKeyframe -> Recording -> WaitFinalKeyframe -> done
//! ```
//!
//! A shutdown signal is observed between packets and moves the machine to
//! `WaitFinalKeyframe` so the file still closes on a clean cut point.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{InputError, SegmentError};
use crate::fmp4::Fmp4Writer;
use crate::input::{InputOpener, InputSession, MediaPacket, PacketPoll, TrackKind};
use crate::recorder::StopSignal;
use crate::timestamp::TimestampNormalizer;

/// Sleep between reads when the source has nothing for us yet.
const POLL_SLEEP: Duration = Duration::from_millis(10);

/// How long to keep recording past the duration limit while hunting for a
/// closing keyframe.
const DEFAULT_FINAL_KEYFRAME_GRACE: Duration = Duration::from_secs(2);

/// Options for one segment.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// Target segment length. The writer starts looking for a closing
    /// keyframe one second early to tolerate slow keyframe cadence.
    pub max_duration: Duration,
    pub include_audio: bool,
    pub final_keyframe_grace: Duration,
}

impl SegmentOptions {
    pub fn new(max_duration: Duration, include_audio: bool) -> Self {
        Self {
            max_duration,
            include_audio,
            final_keyframe_grace: DEFAULT_FINAL_KEYFRAME_GRACE,
        }
    }
}

/// Cross-segment state owned by one recorder. Reset whenever the input
/// connection is abandoned.
#[derive(Debug, Clone, Default)]
pub struct ContinuityState {
    /// 0-based segment index within the current ingest session.
    pub segment_index: u32,
    /// Sticky after the first segment of a session.
    pub has_audio: bool,
    /// True iff the previous segment's last written packet was a keyframe,
    /// letting the next segment start mid-GOP-boundary without waiting.
    pub last_frame_was_key: bool,
}

/// How a segment ended. Read errors and EOF close the segment short rather
/// than failing it; the partial file is still sealed normally.
#[derive(Debug, Default)]
pub struct SegmentOutcome {
    pub video_packets: u64,
    pub audio_packets: u64,
    pub ended_on_keyframe: bool,
    /// The input session hit end-of-stream and must be discarded.
    pub discard_input: bool,
    /// A non-EOF read error closed the segment short.
    pub read_failed: bool,
    /// A shutdown signal ended the segment.
    pub shutdown: bool,
}

impl SegmentOutcome {
    /// True when the recorder should count this segment as a failure and
    /// back off before reconnecting.
    pub fn failed(&self) -> bool {
        self.discard_input || self.read_failed
    }
}

#[derive(Debug, Clone, Copy)]
enum SegmentPhase {
    WaitFirstKeyframe,
    Recording,
    WaitFinalKeyframe { since: Instant },
}

fn open_error(err: InputError) -> SegmentError {
    match err {
        InputError::Open(msg) => SegmentError::InputOpen(msg),
        InputError::StreamInfo(msg) => SegmentError::StreamInfo(msg),
        InputError::NoVideoStream => SegmentError::NoVideoStream,
        InputError::Eof => SegmentError::InputOpen("end of stream during open".to_string()),
        InputError::Read(msg) => SegmentError::InputOpen(msg),
    }
}

/// Record one segment from `rtsp_url` into `output_path`.
///
/// On first call `session` is `None` and the source is opened and handed
/// back for the next segment to reuse. If opening fails, `session` stays
/// `None` and the caller retries with backoff.
pub fn record_segment<O: InputOpener>(
    opener: &O,
    rtsp_url: &str,
    output_path: &Path,
    session: &mut Option<O::Session>,
    continuity: &mut ContinuityState,
    options: &SegmentOptions,
    stop: &StopSignal,
) -> Result<SegmentOutcome, SegmentError> {
    if session.is_none() {
        debug!(url = rtsp_url, "opening RTSP input");
        *session = Some(opener.open(rtsp_url, options.include_audio).map_err(open_error)?);
    }
    let Some(input) = session.as_mut() else {
        unreachable!()
    };

    // Audio presence is decided on the first segment of a session and
    // sticks: a mid-session track change cannot restructure the output.
    let has_audio = if continuity.segment_index == 0 {
        options.include_audio && input.audio().is_some()
    } else {
        continuity.has_audio
    };

    let video_info = input.video().clone();
    let audio_info = if has_audio { input.audio().cloned() } else { None };

    let file = File::create(output_path).map_err(|e| SegmentError::OutputOpen {
        path: output_path.to_path_buf(),
        source: e,
    })?;
    let mut muxer = Fmp4Writer::new(BufWriter::new(file), &video_info, audio_info.as_ref())
        .map_err(SegmentError::HeaderWrite)?;
    let mut normalizer =
        TimestampNormalizer::new(continuity.segment_index, &video_info, audio_info.as_ref());

    // The duration clock starts when recording actually starts, not when
    // the segment is requested; waiting for the first keyframe is free.
    let mut segment_start = Instant::now();
    let mut phase = SegmentPhase::WaitFirstKeyframe;
    let mut outcome = SegmentOutcome::default();
    let close_after = options.max_duration.saturating_sub(Duration::from_secs(1));

    loop {
        // Safe point (a): between packets.
        if stop.is_raised() && !outcome.shutdown {
            outcome.shutdown = true;
            match phase {
                SegmentPhase::WaitFirstKeyframe => {
                    info!("shutdown before first keyframe, abandoning empty segment");
                    break;
                }
                SegmentPhase::Recording => {
                    info!("shutdown initiated, waiting for closing keyframe");
                    phase = SegmentPhase::WaitFinalKeyframe {
                        since: Instant::now(),
                    };
                }
                SegmentPhase::WaitFinalKeyframe { .. } => {}
            }
        }
        if matches!(phase, SegmentPhase::Recording) && segment_start.elapsed() >= close_after {
            debug!("segment duration reached, waiting for closing keyframe");
            phase = SegmentPhase::WaitFinalKeyframe {
                since: Instant::now(),
            };
        }

        let pkt = match input.read_packet() {
            Ok(PacketPoll::Packet(pkt)) => pkt,
            Ok(PacketPoll::Again) => {
                std::thread::sleep(POLL_SLEEP);
                continue;
            }
            Err(InputError::Eof) => {
                info!("end of stream, closing segment");
                outcome.discard_input = true;
                break;
            }
            Err(err) => {
                warn!(error = %err, "packet read error, closing segment short");
                outcome.read_failed = true;
                break;
            }
        };

        match pkt.track {
            TrackKind::Video => {
                if matches!(phase, SegmentPhase::WaitFirstKeyframe) {
                    // Start on a keyframe, or immediately when the previous
                    // segment handed over at a GOP boundary.
                    let handover =
                        continuity.segment_index > 0 && continuity.last_frame_was_key;
                    if !pkt.is_keyframe && !handover {
                        continue;
                    }
                    debug!(
                        keyframe = pkt.is_keyframe,
                        handover, "starting segment recording"
                    );
                    phase = SegmentPhase::Recording;
                    segment_start = Instant::now();
                }

                let closing = match phase {
                    SegmentPhase::WaitFinalKeyframe { since } => {
                        if pkt.is_keyframe {
                            Some(true)
                        } else if since.elapsed() > options.final_keyframe_grace {
                            warn!(
                                waited_ms = since.elapsed().as_millis() as u64,
                                "no closing keyframe within grace, ending on non-keyframe"
                            );
                            Some(false)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };

                let mut pkt = pkt;
                normalizer.normalize(&mut pkt);
                if let Err(e) = muxer.push_video(&pkt) {
                    warn!(error = %e, "failed to write video packet, closing segment short");
                    outcome.read_failed = true;
                    break;
                }
                outcome.video_packets += 1;

                if let Some(on_keyframe) = closing {
                    continuity.last_frame_was_key = on_keyframe;
                    outcome.ended_on_keyframe = on_keyframe;
                    break;
                }
            }
            TrackKind::Audio => {
                // Audio is synchronized to video GOP boundaries: dropped
                // until video reaches Recording, never a reason to extend
                // the segment.
                if !has_audio || matches!(phase, SegmentPhase::WaitFirstKeyframe) {
                    continue;
                }
                let mut pkt = pkt;
                normalizer.normalize(&mut pkt);
                if let Err(e) = muxer.push_audio(&pkt) {
                    warn!(error = %e, "failed to write audio packet, closing segment short");
                    outcome.read_failed = true;
                    break;
                }
                outcome.audio_packets += 1;
            }
        }
    }

    info!(
        video = outcome.video_packets,
        audio = outcome.audio_packets,
        ended_on_keyframe = outcome.ended_on_keyframe,
        "segment complete"
    );

    // A failed finalization leaves the file in whatever state the muxer
    // reached; the recorder still seals the catalog row with the on-disk
    // size.
    if let Err(e) = muxer.finish() {
        warn!(error = %e, path = %output_path.display(), "failed to finalize MP4 file");
    }

    continuity.has_audio = has_audio;
    continuity.segment_index += 1;
    Ok(outcome)
}
