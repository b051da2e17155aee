//! SQLite-backed catalog of recordings and stream configurations.
//!
//! Maps recording ids to on-disk MP4 files and tracks their lifecycle
//! (open → growing → sealed), plus the per-stream configuration the
//! recorders read at segment boundaries.

mod db;
mod error;

pub use db::{Catalog, RecordingRow, StreamConfig};
pub use error::CatalogError;
