use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by an input session or its opener.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to open RTSP input: {0}")]
    Open(String),

    #[error("Failed to read stream info: {0}")]
    StreamInfo(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("End of stream")]
    Eof,

    #[error("Packet read error: {0}")]
    Read(String),
}

/// Errors the segment writer reports to the recorder. Read errors and EOF
/// are not here: they close the segment short and are reported through the
/// segment outcome so the partial file still gets sealed normally.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("Failed to open RTSP input: {0}")]
    InputOpen(String),

    #[error("Failed to read stream info: {0}")]
    StreamInfo(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Failed to open output file {path}: {source}")]
    OutputOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write MP4 header: {0}")]
    HeaderWrite(MuxerError),
}

impl SegmentError {
    /// True for errors no amount of retrying against the same URL can fix.
    pub fn is_fatal_for_url(&self) -> bool {
        matches!(self, SegmentError::NoVideoStream)
    }
}

/// Errors from the fragmented MP4 writer.
#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} too large for a 32-bit box")]
    Oversize(&'static str),
}
