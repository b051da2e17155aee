//! Fragmented MP4 (ISO BMFF) serialization.
//!
//! Output layout: `ftyp` and a `moov` with empty sample tables and an
//! `mvex` up front, then one `moof`+`mdat` pair per group of pictures.
//! Fragments are flushed at keyframe boundaries, so after a hard kill the
//! file is playable up to the last flushed fragment; nothing ever needs to
//! be relocated after close. There is deliberately no faststart pass.
//!
//! See ISO/IEC 14496-12:2015 for the box definitions.

use std::io::Write;

use bytes::{BufMut, BytesMut};

use crate::error::MuxerError;
use crate::input::{AudioTrackInfo, MediaPacket, VideoTrackInfo};

const MOVIE_TIMESCALE: u32 = 90_000;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

mod sample_flags {
    /// sample_depends_on = 2: an I-frame, usable as a sync sample.
    pub const RAP: u32 = 0x0200_0000;
    /// sample_is_non_sync_sample = 1.
    pub const NON_SYNC: u32 = 0x0001_0000;
}

/// Writes a box length for everything appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = $buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        {
            $b;
        }
        let pos_end = $buf.len();
        let len = u32::try_from(pos_end - pos_start).map_err(|_| MuxerError::Oversize("box"))?;
        $buf[pos_start..pos_start + 4].copy_from_slice(&len.to_be_bytes());
    }};
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration: u32,
    size: u32,
    /// pts - dts; the normalizer guarantees it is non-negative.
    cts_offset: u32,
    is_keyframe: bool,
}

#[derive(Debug)]
struct FragTrack {
    track_id: u32,
    samples: Vec<Sample>,
    data: Vec<u8>,
    /// DTS of the first sample buffered for the pending fragment.
    first_dts: Option<i64>,
}

impl FragTrack {
    fn new(track_id: u32) -> Self {
        Self {
            track_id,
            samples: Vec::new(),
            data: Vec::new(),
            first_dts: None,
        }
    }

    fn push(&mut self, pkt: &MediaPacket) -> Result<(), MuxerError> {
        let size = u32::try_from(pkt.data.len()).map_err(|_| MuxerError::Oversize("sample"))?;
        self.first_dts.get_or_insert(pkt.dts);
        self.samples.push(Sample {
            duration: u32::try_from(pkt.duration.max(1)).unwrap_or(1),
            size,
            cts_offset: u32::try_from(pkt.pts - pkt.dts).unwrap_or(0),
            is_keyframe: pkt.is_keyframe,
        });
        self.data.extend_from_slice(&pkt.data);
        Ok(())
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.data.clear();
        self.first_dts = None;
    }

    /// Writes tfhd + tfdt + trun inside a traf. Returns the buffer position
    /// of the trun's i32 data_offset placeholder.
    fn write_traf(&self, buf: &mut BytesMut) -> Result<usize, MuxerError> {
        let mut data_offset_pos = 0;
        write_box!(buf, b"traf", {
            write_box!(buf, b"tfhd", {
                buf.put_u32(0x02_0000); // default-base-is-moof
                buf.put_u32(self.track_id);
            });
            write_box!(buf, b"tfdt", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(self.first_dts.unwrap_or(0).max(0) as u64);
            });
            write_box!(buf, b"trun", {
                const DATA_OFFSET: u32 = 0x000001;
                const FIRST_SAMPLE_FLAGS: u32 = 0x000004;
                const SAMPLE_DURATION: u32 = 0x000100;
                const SAMPLE_SIZE: u32 = 0x000200;
                const SAMPLE_CTS: u32 = 0x000800;
                buf.put_u32(DATA_OFFSET | FIRST_SAMPLE_FLAGS | SAMPLE_DURATION | SAMPLE_SIZE | SAMPLE_CTS);
                buf.put_u32(self.samples.len() as u32);
                data_offset_pos = buf.len();
                buf.put_i32(0); // patched once the moof length is known
                let first_flags = if self.samples.first().is_some_and(|s| s.is_keyframe) {
                    sample_flags::RAP
                } else {
                    sample_flags::NON_SYNC
                };
                buf.put_u32(first_flags);
                for sample in &self.samples {
                    buf.put_u32(sample.duration);
                    buf.put_u32(sample.size);
                    buf.put_u32(sample.cts_offset);
                }
            });
        });
        Ok(data_offset_pos)
    }
}

/// Writes one fragmented MP4 file.
pub struct Fmp4Writer<W: Write> {
    inner: W,
    video: FragTrack,
    audio: Option<FragTrack>,
    seq_no: u32,
    fragments_written: u64,
}

impl<W: Write> Fmp4Writer<W> {
    /// Create the writer and emit `ftyp` + `moov`. Everything after this
    /// is fragments.
    pub fn new(
        mut inner: W,
        video: &VideoTrackInfo,
        audio: Option<&AudioTrackInfo>,
    ) -> Result<Self, MuxerError> {
        let mut buf = BytesMut::with_capacity(1024);
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(b"isom"); // major_brand
            buf.put_u32(0x200); // minor_version
            buf.extend_from_slice(b"isom");
            buf.extend_from_slice(b"iso6");
            buf.extend_from_slice(b"avc1");
            buf.extend_from_slice(b"mp41");
        });
        write_moov(&mut buf, video, audio)?;
        inner.write_all(&buf)?;

        Ok(Self {
            inner,
            video: FragTrack::new(VIDEO_TRACK_ID),
            audio: audio.map(|_| FragTrack::new(AUDIO_TRACK_ID)),
            seq_no: 1,
            fragments_written: 0,
        })
    }

    /// Buffer a video sample. A keyframe closes the pending fragment
    /// first, so every fragment starts at a random access point.
    pub fn push_video(&mut self, pkt: &MediaPacket) -> Result<(), MuxerError> {
        if pkt.is_keyframe && self.has_pending() {
            self.flush_fragment()?;
        }
        self.video.push(pkt)
    }

    /// Buffer an audio sample into the pending fragment.
    pub fn push_audio(&mut self, pkt: &MediaPacket) -> Result<(), MuxerError> {
        match &mut self.audio {
            Some(track) => track.push(pkt),
            // The caller gates audio on the session's tracks, so this is a
            // programming error, not a stream condition; drop the packet.
            None => Ok(()),
        }
    }

    fn has_pending(&self) -> bool {
        !self.video.samples.is_empty()
            || self.audio.as_ref().is_some_and(|a| !a.samples.is_empty())
    }

    /// Write the pending samples as one `moof`+`mdat` pair.
    pub fn flush_fragment(&mut self) -> Result<(), MuxerError> {
        if !self.has_pending() {
            return Ok(());
        }

        let mut moof = BytesMut::with_capacity(
            256 + 12 * self.video.samples.len()
                + 12 * self.audio.as_ref().map_or(0, |a| a.samples.len()),
        );
        let mut video_offset_pos = None;
        let mut audio_offset_pos = None;
        write_box!(&mut moof, b"moof", {
            write_box!(&mut moof, b"mfhd", {
                moof.put_u32(0);
                moof.put_u32(self.seq_no);
            });
            if !self.video.samples.is_empty() {
                video_offset_pos = Some(self.video.write_traf(&mut moof)?);
            }
            if let Some(audio) = &self.audio {
                if !audio.samples.is_empty() {
                    audio_offset_pos = Some(audio.write_traf(&mut moof)?);
                }
            }
        });

        // Patch the trun data offsets now that the moof length is known:
        // video payload starts right after the mdat header, audio follows
        // the video bytes.
        let base = moof.len() as i32 + 8;
        if let Some(pos) = video_offset_pos {
            moof[pos..pos + 4].copy_from_slice(&base.to_be_bytes());
        }
        if let Some(pos) = audio_offset_pos {
            let offset = base + self.video.data.len() as i32;
            moof[pos..pos + 4].copy_from_slice(&offset.to_be_bytes());
        }

        let audio_len = self.audio.as_ref().map_or(0, |a| a.data.len());
        let mdat_size = u32::try_from(8 + self.video.data.len() + audio_len)
            .map_err(|_| MuxerError::Oversize("mdat"))?;

        self.inner.write_all(&moof)?;
        self.inner.write_all(&mdat_size.to_be_bytes())?;
        self.inner.write_all(b"mdat")?;
        self.inner.write_all(&self.video.data)?;
        if let Some(audio) = &self.audio {
            self.inner.write_all(&audio.data)?;
        }
        self.inner.flush()?;

        self.seq_no = self.seq_no.wrapping_add(1);
        self.fragments_written += 1;
        self.video.clear();
        if let Some(audio) = &mut self.audio {
            audio.clear();
        }
        Ok(())
    }

    /// Flush the trailing fragment and the underlying file. The finalized
    /// file needs no further rewriting.
    pub fn finish(mut self) -> Result<u64, MuxerError> {
        self.flush_fragment()?;
        self.inner.flush()?;
        Ok(self.fragments_written)
    }
}

fn write_moov(
    buf: &mut BytesMut,
    video: &VideoTrackInfo,
    audio: Option<&AudioTrackInfo>,
) -> Result<(), MuxerError> {
    write_box!(buf, b"moov", {
        write_box!(buf, b"mvhd", {
            buf.put_u32(1 << 24); // version 1
            buf.put_u64(0); // creation_time
            buf.put_u64(0); // modification_time
            buf.put_u32(MOVIE_TIMESCALE);
            buf.put_u64(0); // duration: unknown, fragments follow
            buf.put_u32(0x0001_0000); // rate
            buf.put_u16(0x0100); // volume
            buf.put_u16(0); // reserved
            buf.put_u64(0); // reserved
            for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_u32(v); // matrix
            }
            for _ in 0..6 {
                buf.put_u32(0); // pre_defined
            }
            buf.put_u32(if audio.is_some() { 3 } else { 2 }); // next_track_id
        });

        write_video_trak(buf, video)?;
        if let Some(audio) = audio {
            write_audio_trak(buf, audio)?;
        }

        write_box!(buf, b"mvex", {
            write_box!(buf, b"mehd", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(0); // open-ended duration
            });
            write_trex(buf, VIDEO_TRACK_ID)?;
            if audio.is_some() {
                write_trex(buf, AUDIO_TRACK_ID)?;
            }
        });
    });
    Ok(())
}

fn write_trex(buf: &mut BytesMut, track_id: u32) -> Result<(), MuxerError> {
    write_box!(buf, b"trex", {
        buf.put_u32(0); // version, flags
        buf.put_u32(track_id);
        buf.put_u32(1); // default sample description index
        buf.put_u32(0); // default sample duration: use trun
        buf.put_u32(0); // default sample size: use trun
        buf.put_u32(sample_flags::NON_SYNC);
    });
    Ok(())
}

fn write_video_trak(buf: &mut BytesMut, video: &VideoTrackInfo) -> Result<(), MuxerError> {
    write_box!(buf, b"trak", {
        write_box!(buf, b"tkhd", {
            buf.put_u32((1 << 24) | 7); // version 1, enabled | in-movie | in-preview
            buf.put_u64(0); // creation_time
            buf.put_u64(0); // modification_time
            buf.put_u32(VIDEO_TRACK_ID);
            buf.put_u32(0); // reserved
            buf.put_u64(0); // duration
            buf.put_u64(0); // reserved
            buf.put_u16(0); // layer
            buf.put_u16(0); // alternate_group
            buf.put_u16(0); // volume
            buf.put_u16(0); // reserved
            for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_u32(v); // matrix
            }
            buf.put_u32(u32::from(video.width) << 16); // fixed-point 16.16
            buf.put_u32(u32::from(video.height) << 16);
        });
        write_box!(buf, b"mdia", {
            write_box!(buf, b"mdhd", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(0);
                buf.put_u64(0);
                buf.put_u32(video.clock_rate);
                buf.put_u64(0); // duration
                buf.put_u16(0x55c4); // language: und
                buf.put_u16(0); // pre_defined
            });
            write_box!(buf, b"hdlr", {
                buf.put_u32(0);
                buf.put_u32(0); // pre_defined
                buf.extend_from_slice(b"vide");
                buf.put_u64(0); // reserved
                buf.put_u32(0);
                buf.extend_from_slice(b"VideoHandler\0");
            });
            write_box!(buf, b"minf", {
                write_box!(buf, b"vmhd", {
                    buf.put_u32(1); // flags
                    buf.put_u64(0); // graphicsmode, opcolor
                });
                write_dinf(buf)?;
                write_stbl(buf, &video.sample_entry)?;
            });
        });
    });
    Ok(())
}

fn write_audio_trak(buf: &mut BytesMut, audio: &AudioTrackInfo) -> Result<(), MuxerError> {
    write_box!(buf, b"trak", {
        write_box!(buf, b"tkhd", {
            buf.put_u32((1 << 24) | 7);
            buf.put_u64(0);
            buf.put_u64(0);
            buf.put_u32(AUDIO_TRACK_ID);
            buf.put_u32(0);
            buf.put_u64(0);
            buf.put_u64(0);
            buf.put_u16(0);
            buf.put_u16(0);
            buf.put_u16(0x0100); // volume
            buf.put_u16(0);
            for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_u32(v);
            }
            buf.put_u32(0); // width
            buf.put_u32(0); // height
        });
        write_box!(buf, b"mdia", {
            write_box!(buf, b"mdhd", {
                buf.put_u32(1 << 24);
                buf.put_u64(0);
                buf.put_u64(0);
                buf.put_u32(audio.clock_rate);
                buf.put_u64(0);
                buf.put_u16(0x55c4);
                buf.put_u16(0);
            });
            write_box!(buf, b"hdlr", {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.extend_from_slice(b"soun");
                buf.put_u64(0);
                buf.put_u32(0);
                buf.extend_from_slice(b"SoundHandler\0");
            });
            write_box!(buf, b"minf", {
                write_box!(buf, b"smhd", {
                    buf.put_u32(0);
                    buf.put_u32(0); // balance, reserved
                });
                write_dinf(buf)?;
                write_stbl(buf, &audio.sample_entry)?;
            });
        });
    });
    Ok(())
}

fn write_dinf(buf: &mut BytesMut) -> Result<(), MuxerError> {
    write_box!(buf, b"dinf", {
        write_box!(buf, b"dref", {
            buf.put_u32(0);
            buf.put_u32(1); // entry_count
            write_box!(buf, b"url ", {
                buf.put_u32(1); // media data in same file
            });
        });
    });
    Ok(())
}

/// Sample tables are empty in a fragmented file; all sample metadata lives
/// in the truns.
fn write_stbl(buf: &mut BytesMut, sample_entry: &[u8]) -> Result<(), MuxerError> {
    write_box!(buf, b"stbl", {
        write_box!(buf, b"stsd", {
            buf.put_u32(0);
            buf.put_u32(1); // entry_count
            buf.extend_from_slice(sample_entry);
        });
        write_box!(buf, b"stts", {
            buf.put_u64(0);
        });
        write_box!(buf, b"stsc", {
            buf.put_u64(0);
        });
        write_box!(buf, b"stsz", {
            buf.put_u32(0);
            buf.put_u64(0);
        });
        write_box!(buf, b"stco", {
            buf.put_u64(0);
        });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::TrackKind;
    use bytes::Bytes;

    fn fake_sample_entry(fourcc: &[u8; 4]) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&16u32.to_be_bytes());
        entry.extend_from_slice(fourcc);
        entry.extend_from_slice(&[0u8; 8]);
        entry
    }

    fn video_info() -> VideoTrackInfo {
        VideoTrackInfo {
            clock_rate: 90_000,
            frame_interval: Some((1, 30)),
            width: 1280,
            height: 720,
            sample_entry: fake_sample_entry(b"avc1"),
        }
    }

    fn audio_info() -> AudioTrackInfo {
        AudioTrackInfo {
            clock_rate: 48_000,
            frame_length: Some(1024),
            sample_entry: fake_sample_entry(b"mp4a"),
        }
    }

    fn video_packet(dts: i64, is_keyframe: bool, payload: &[u8]) -> MediaPacket {
        MediaPacket {
            track: TrackKind::Video,
            data: Bytes::copy_from_slice(payload),
            dts,
            pts: dts,
            duration: 3000,
            is_keyframe,
        }
    }

    fn audio_packet(dts: i64, payload: &[u8]) -> MediaPacket {
        MediaPacket {
            track: TrackKind::Audio,
            data: Bytes::copy_from_slice(payload),
            dts,
            pts: dts,
            duration: 1024,
            is_keyframe: false,
        }
    }

    /// Walk top-level boxes, returning (fourcc, total size) pairs.
    fn top_level_boxes(data: &[u8]) -> Vec<(String, usize)> {
        let mut boxes = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let fourcc = String::from_utf8_lossy(&data[pos + 4..pos + 8]).into_owned();
            assert!(size >= 8, "bad box size {size} at {pos}");
            boxes.push((fourcc, size));
            pos += size;
        }
        assert_eq!(pos, data.len(), "trailing garbage after last box");
        boxes
    }

    /// Find the payload of the first box with the given fourcc anywhere in
    /// the file (boxes never contain the fourcc bytes of a sibling at the
    /// exact header position by construction of these tests).
    fn find_box<'a>(data: &'a [u8], fourcc: &str) -> Option<&'a [u8]> {
        let needle = fourcc.as_bytes();
        (0..data.len().saturating_sub(8)).find_map(|pos| {
            if &data[pos + 4..pos + 8] == needle {
                let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
                if size >= 8 && pos + size <= data.len() {
                    return Some(&data[pos + 8..pos + size]);
                }
            }
            None
        })
    }

    #[test]
    fn test_header_layout() {
        let mut out = Vec::new();
        let writer = Fmp4Writer::new(&mut out, &video_info(), Some(&audio_info())).unwrap();
        drop(writer);
        let boxes = top_level_boxes(&out);
        assert_eq!(boxes[0].0, "ftyp");
        assert_eq!(boxes[1].0, "moov");
        assert_eq!(boxes.len(), 2);
        // Both tracks and the fragment defaults are declared up front.
        assert!(find_box(&out, "mvex").is_some());
        assert!(find_box(&out, "avc1").is_some());
        assert!(find_box(&out, "mp4a").is_some());
    }

    #[test]
    fn test_video_only_header_has_single_trak() {
        let mut out = Vec::new();
        let writer = Fmp4Writer::new(&mut out, &video_info(), None).unwrap();
        drop(writer);
        assert!(find_box(&out, "avc1").is_some());
        assert!(find_box(&out, "mp4a").is_none());
        assert!(find_box(&out, "smhd").is_none());
    }

    #[test]
    fn test_keyframe_closes_fragment() {
        let mut out = Vec::new();
        let mut writer = Fmp4Writer::new(&mut out, &video_info(), None).unwrap();
        writer.push_video(&video_packet(0, true, b"kkkk")).unwrap();
        writer.push_video(&video_packet(3000, false, b"pp")).unwrap();
        // The next keyframe flushes the first GOP before being buffered.
        writer.push_video(&video_packet(6000, true, b"KK")).unwrap();
        writer.finish().unwrap();

        let boxes = top_level_boxes(&out);
        let fourccs: Vec<&str> = boxes.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(fourccs, ["ftyp", "moov", "moof", "mdat", "moof", "mdat"]);

        // First mdat carries the first GOP's payload bytes.
        let mdat = find_box(&out, "mdat").unwrap();
        assert_eq!(mdat, b"kkkkpp");
    }

    #[test]
    fn test_audio_rides_in_video_fragment() {
        let mut out = Vec::new();
        let mut writer = Fmp4Writer::new(&mut out, &video_info(), Some(&audio_info())).unwrap();
        writer.push_video(&video_packet(0, true, b"vvvv")).unwrap();
        writer.push_audio(&audio_packet(0, b"aa")).unwrap();
        writer.push_audio(&audio_packet(1024, b"bb")).unwrap();
        writer.finish().unwrap();

        let boxes = top_level_boxes(&out);
        let fourccs: Vec<&str> = boxes.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(fourccs, ["ftyp", "moov", "moof", "mdat"]);
        // Video bytes first, then audio.
        let mdat = find_box(&out, "mdat").unwrap();
        assert_eq!(mdat, b"vvvvaabb");
    }

    #[test]
    fn test_tfdt_carries_first_fragment_dts() {
        let mut out = Vec::new();
        let mut writer = Fmp4Writer::new(&mut out, &video_info(), None).unwrap();
        writer.push_video(&video_packet(0, true, b"k")).unwrap();
        writer.push_video(&video_packet(3000, false, b"p")).unwrap();
        writer.push_video(&video_packet(6000, true, b"K")).unwrap();
        writer.finish().unwrap();

        // Second fragment's tfdt must be the second keyframe's DTS.
        let header_end = {
            let boxes = top_level_boxes(&out);
            boxes[0].1 + boxes[1].1 // ftyp + moov
        };
        let first_moof = find_box(&out[header_end..], "tfdt").unwrap();
        assert_eq!(u64::from_be_bytes(first_moof[4..12].try_into().unwrap()), 0);

        // Skip past the first moof+mdat to the second fragment.
        let boxes = top_level_boxes(&out);
        let second_moof_start = boxes[..4].iter().map(|(_, s)| s).sum::<usize>();
        let tfdt = find_box(&out[second_moof_start..], "tfdt").unwrap();
        assert_eq!(u64::from_be_bytes(tfdt[4..12].try_into().unwrap()), 6000);
    }

    #[test]
    fn test_finish_without_samples_writes_no_fragment() {
        let mut out = Vec::new();
        let writer = Fmp4Writer::new(&mut out, &video_info(), None).unwrap();
        writer.finish().unwrap();
        let boxes = top_level_boxes(&out);
        assert_eq!(boxes.len(), 2); // ftyp + moov only
    }

    #[test]
    fn test_trun_sample_count() {
        let mut out = Vec::new();
        let mut writer = Fmp4Writer::new(&mut out, &video_info(), None).unwrap();
        writer.push_video(&video_packet(0, true, b"k")).unwrap();
        writer.push_video(&video_packet(3000, false, b"p")).unwrap();
        writer.push_video(&video_packet(6000, false, b"q")).unwrap();
        writer.finish().unwrap();

        let trun = find_box(&out, "trun").unwrap();
        let sample_count = u32::from_be_bytes(trun[4..8].try_into().unwrap());
        assert_eq!(sample_count, 3);
    }
}
