//! Per-track timestamp normalization.
//!
//! Input timestamps from an RTSP source are arbitrary: they start wherever
//! the camera's clock happens to be, can run backwards after a camera-side
//! hiccup, and grow without bound across a long ingest session. MP4
//! fragments additionally cap timestamps at 2^31 - 1. This module coerces
//! every packet into a stream that is safe to hand to the muxer:
//!
//! - DTS is non-decreasing within a segment and always in [0, 2^31 - 1]
//! - PTS >= DTS on every packet
//! - the first packet of segment N (N > 0) starts from a small fixed
//!   offset instead of inheriting segment N-1's running timestamps, so
//!   timestamps cannot inflate over days of recording
//! - every packet leaves with a usable duration
//!
//! Nothing here fails: every input is coerced into the contract, with
//! warn-level events for the recovery paths.

use tracing::{debug, warn};

use crate::input::{AudioTrackInfo, MediaPacket, TrackKind, VideoTrackInfo};

/// Soft ceiling on outgoing DTS, ~75% of the MP4 fragment limit. Crossing
/// it triggers a rebase rather than waiting to hit the hard limit.
const DTS_SOFT_LIMIT: i64 = 0x7000_0000;

/// Where a rebased track restarts.
const OVERFLOW_RESTART: i64 = 1000;

/// Input durations above this are presumed garbage.
const DURATION_SANITY_LIMIT: i64 = 10_000_000;

/// Replacement for garbage durations: one second in the 90 kHz video
/// timebase.
const DURATION_CAP: i64 = 90_000;

/// Offset applied to the first packet of every segment after the first,
/// keeping segment N+1 distinct from the tail of segment N.
const SEGMENT_START_OFFSET: i64 = 1;

/// Fallback samples-per-frame for audio codecs that don't declare one.
const DEFAULT_AUDIO_FRAME_SAMPLES: i64 = 1024;

#[derive(Debug, Default)]
struct TrackState {
    /// Baselines, captured from the first packet seen in this segment.
    first_dts: Option<i64>,
    first_pts: Option<i64>,
    /// Correction applied on top of baseline subtraction; moves when an
    /// overflow rebase happens.
    rebase: i64,
    last_dts: i64,
    last_pts: i64,
    packets: u64,
}

/// Normalizes one segment's worth of packets. Create a fresh one per
/// segment; the cross-segment continuity lives entirely in `segment_index`.
pub struct TimestampNormalizer {
    segment_index: u32,
    video: TrackState,
    audio: TrackState,
    video_default_duration: i64,
    audio_default_duration: i64,
}

impl TimestampNormalizer {
    pub fn new(
        segment_index: u32,
        video: &VideoTrackInfo,
        audio: Option<&AudioTrackInfo>,
    ) -> Self {
        // Synthesized duration for packets that arrive without one:
        // one frame interval in timestamp units for video, one codec frame
        // for audio (sample rate equals the clock rate, so a frame length
        // is already a duration), 1 as the last resort.
        let video_default_duration = match video.frame_interval {
            Some((num, den)) if num > 0 && den > 0 => {
                (i64::from(video.clock_rate) * i64::from(num) / i64::from(den)).max(1)
            }
            _ => 1,
        };
        let audio_default_duration = audio
            .map(|a| i64::from(a.frame_length.unwrap_or(DEFAULT_AUDIO_FRAME_SAMPLES as u32)).max(1))
            .unwrap_or(1);

        Self {
            segment_index,
            video: TrackState::default(),
            audio: TrackState::default(),
            video_default_duration,
            audio_default_duration,
        }
    }

    /// Rewrite `pkt`'s timestamps and duration in place.
    pub fn normalize(&mut self, pkt: &mut MediaPacket) {
        let start_offset = if self.segment_index > 0 {
            SEGMENT_START_OFFSET
        } else {
            0
        };
        let (track, default_duration) = match pkt.track {
            TrackKind::Video => (&mut self.video, self.video_default_duration),
            TrackKind::Audio => (&mut self.audio, self.audio_default_duration),
        };

        // Lazily capture this segment's baselines from the first packet.
        let first_dts = *track.first_dts.get_or_insert(pkt.dts);
        let first_pts = *track.first_pts.get_or_insert(pkt.pts);

        let mut dts = (pkt.dts - first_dts + start_offset + track.rebase).max(0);
        let mut pts = (pkt.pts - first_pts + start_offset + track.rebase).max(0);

        // Audio interleaving can legitimately deliver equal timestamps;
        // force strict progress so the muxer never sees a step backwards.
        if pkt.track == TrackKind::Audio && track.packets > 0 {
            if dts <= track.last_dts {
                dts = track.last_dts + 1;
            }
            if pts <= track.last_pts {
                pts = track.last_pts + 1;
            }
        }

        if pts < dts {
            debug!(pts, dts, "raising PTS to DTS");
            pts = dts;
        }

        // Approaching the 32-bit fragment limit: rebase so this packet
        // lands at the restart value and later packets keep growing from
        // there. Recovery only; a normal segment never gets close.
        if dts > DTS_SOFT_LIMIT {
            let shift = dts - OVERFLOW_RESTART;
            warn!(
                dts,
                restart = OVERFLOW_RESTART,
                "DTS approaching MP4 fragment limit, rebasing track"
            );
            track.rebase -= shift;
            pts = (pts - shift).max(OVERFLOW_RESTART);
            dts = OVERFLOW_RESTART;
        }

        let mut duration = pkt.duration;
        if duration > DURATION_SANITY_LIMIT {
            warn!(duration, cap = DURATION_CAP, "capping out-of-range packet duration");
            duration = DURATION_CAP;
        } else if duration <= 0 {
            duration = default_duration;
        }

        track.last_dts = dts;
        track.last_pts = pts;
        track.packets += 1;

        pkt.dts = dts;
        pkt.pts = pts;
        pkt.duration = duration;
    }
}
