//! SQLite-backed recording catalog

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::CatalogError;

/// Maximum length for a stream name
const MAX_STREAM_NAME_LEN: usize = 64;

/// Per-stream recording configuration, one row in the `streams` table.
///
/// Immutable from a recorder's point of view within a segment; the
/// supervisor writes changes and recorders pick them up at segment
/// boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    /// Target segment length in seconds (>= 1).
    pub segment_duration: u32,
    pub record_audio: bool,
    pub enabled: bool,
    /// Absolute directory segments for this stream are written into.
    pub output_dir: PathBuf,
}

/// One row in the `recordings` table.
#[derive(Debug, Clone)]
pub struct RecordingRow {
    pub id: i64,
    pub stream_name: String,
    pub file_path: PathBuf,
    /// Wall clock, Unix seconds.
    pub start_time: i64,
    /// 0 while the recording is still open.
    pub end_time: i64,
    pub size_bytes: u64,
    pub is_complete: bool,
}

/// SQLite-backed catalog shared by all recorders and the supervisor.
///
/// A single connection behind a mutex; every operation is one statement
/// (or a short statement pair), so contention stays low and no transaction
/// spans a segment.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open or create the catalog database at the given path.
    pub fn open_at(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory catalog, used by tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        // WAL lets recorder threads insert while the supervisor reads;
        // the busy timeout covers the remaining write/write collisions.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS recordings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_name TEXT NOT NULL,
                file_path TEXT NOT NULL UNIQUE,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                is_complete INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recordings_stream
             ON recordings(stream_name, start_time)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recordings_open
             ON recordings(is_complete, stream_name)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS streams (
                name TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                segment_duration INTEGER NOT NULL DEFAULT 30,
                record_audio INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                output_dir TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ========== Recordings ==========

    /// Insert a new open recording row and return its id.
    ///
    /// During rotation the recorder calls this for the next file *before*
    /// sealing the previous one, so a reader can briefly observe two open
    /// rows for the same stream. That ordering guarantees the stream never
    /// has zero open rows between segments.
    pub fn begin_recording(
        &self,
        stream_name: &str,
        file_path: &Path,
        start_time: i64,
    ) -> Result<i64, CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recordings (stream_name, file_path, start_time, end_time, size_bytes, is_complete)
             VALUES (?1, ?2, ?3, 0, 0, 0)",
            params![stream_name, path_str(file_path), start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Partial update of a recording row.
    ///
    /// `end_time_or_0 == 0` leaves the end time unchanged (growth
    /// tracking); a non-zero value is clamped to the row's start time.
    /// Sealing (`mark_complete`) is idempotent.
    pub fn update_recording(
        &self,
        id: i64,
        end_time_or_0: i64,
        size_bytes: u64,
        mark_complete: bool,
    ) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE recordings SET
                end_time = CASE WHEN ?2 = 0 THEN end_time ELSE MAX(?2, start_time) END,
                size_bytes = ?3,
                is_complete = CASE WHEN ?4 THEN 1 ELSE is_complete END
             WHERE id = ?1",
            params![id, end_time_or_0, size_bytes as i64, mark_complete],
        )?;
        if rows == 0 {
            return Err(CatalogError::RecordingNotFound(id));
        }
        Ok(())
    }

    /// Growth tracking: refresh the size of an open recording.
    pub fn update_size(&self, id: i64, size_bytes: u64) -> Result<(), CatalogError> {
        self.update_recording(id, 0, size_bytes, false)
    }

    /// Fetch a single recording row.
    pub fn get_recording(&self, id: i64) -> Result<Option<RecordingRow>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
                 FROM recordings WHERE id = ?",
                [id],
                row_to_recording,
            )
            .optional()?;
        Ok(row)
    }

    /// All rows still marked open, oldest first. Used by the startup
    /// recovery sweep and by invariant checks.
    pub fn open_recordings(&self) -> Result<Vec<RecordingRow>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
             FROM recordings WHERE is_complete = 0 ORDER BY start_time",
        )?;
        let rows = stmt
            .query_map([], row_to_recording)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Open rows for one stream, oldest first.
    pub fn open_recordings_for(&self, stream_name: &str) -> Result<Vec<RecordingRow>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
             FROM recordings WHERE is_complete = 0 AND stream_name = ? ORDER BY start_time",
        )?;
        let rows = stmt
            .query_map([stream_name], row_to_recording)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Sealed recordings that ended before the cutoff, oldest first.
    pub fn recordings_older_than(&self, cutoff: i64) -> Result<Vec<RecordingRow>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
             FROM recordings WHERE is_complete = 1 AND end_time < ? ORDER BY end_time",
        )?;
        let rows = stmt
            .query_map([cutoff], row_to_recording)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Oldest sealed recordings, for size-based retention.
    pub fn oldest_complete(&self, limit: usize) -> Result<Vec<RecordingRow>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
             FROM recordings WHERE is_complete = 1 ORDER BY start_time LIMIT ?",
        )?;
        let rows = stmt
            .query_map([limit as i64], row_to_recording)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Sum of all recorded bytes known to the catalog.
    pub fn total_recorded_bytes(&self) -> Result<u64, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM recordings",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    /// Remove a recording row. The caller is responsible for deleting the
    /// file within the same logical operation.
    pub fn delete_recording_row(&self, id: i64) -> Result<bool, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM recordings WHERE id = ?", [id])?;
        Ok(rows > 0)
    }

    // ========== Stream configurations ==========

    /// Read the current configuration for a stream.
    pub fn get_stream_config(&self, name: &str) -> Result<Option<StreamConfig>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let config = conn
            .query_row(
                "SELECT name, url, segment_duration, record_audio, enabled, output_dir
                 FROM streams WHERE name = ?",
                [name],
                row_to_stream,
            )
            .optional()?;
        Ok(config)
    }

    /// All configured streams, enabled or not.
    pub fn list_streams(&self) -> Result<Vec<StreamConfig>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, url, segment_duration, record_audio, enabled, output_dir
             FROM streams ORDER BY name",
        )?;
        let streams = stmt
            .query_map([], row_to_stream)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(streams)
    }

    /// Insert or update a stream configuration (the supervisor's admin path).
    pub fn upsert_stream(&self, config: &StreamConfig) -> Result<(), CatalogError> {
        if config.name.is_empty() || config.name.len() > MAX_STREAM_NAME_LEN {
            return Err(CatalogError::FieldTooLong {
                field: "name",
                max: MAX_STREAM_NAME_LEN,
                actual: config.name.len(),
            });
        }
        if config.segment_duration < 1 {
            return Err(CatalogError::InvalidStream(format!(
                "segment_duration must be >= 1, got {}",
                config.segment_duration
            )));
        }
        if !config.output_dir.is_absolute() {
            return Err(CatalogError::InvalidStream(format!(
                "output_dir must be absolute: {}",
                config.output_dir.display()
            )));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO streams (name, url, segment_duration, record_audio, enabled, output_dir)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                url = ?2,
                segment_duration = ?3,
                record_audio = ?4,
                enabled = ?5,
                output_dir = ?6",
            params![
                config.name,
                config.url,
                config.segment_duration,
                config.record_audio,
                config.enabled,
                path_str(&config.output_dir),
            ],
        )?;
        Ok(())
    }

    /// Remove a stream configuration. Recording rows are kept until
    /// retention removes them.
    pub fn delete_stream(&self, name: &str) -> Result<bool, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM streams WHERE name = ?", [name])?;
        Ok(rows > 0)
    }

    // ========== Startup recovery ==========

    /// Seal or delete rows orphaned by a hard kill: a row whose file still
    /// exists is sealed using the file's mtime and on-disk size; a row
    /// whose file is gone is deleted.
    ///
    /// Returns (sealed, deleted) counts.
    pub fn recover_orphans(&self) -> Result<(usize, usize), CatalogError> {
        let orphans = self.open_recordings()?;
        let mut sealed = 0;
        let mut deleted = 0;
        for row in orphans {
            match std::fs::metadata(&row.file_path) {
                Ok(meta) => {
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(row.start_time);
                    self.update_recording(row.id, mtime.max(row.start_time), meta.len(), true)?;
                    debug!(
                        id = row.id,
                        path = %row.file_path.display(),
                        "sealed orphaned recording"
                    );
                    sealed += 1;
                }
                Err(_) => {
                    warn!(
                        id = row.id,
                        path = %row.file_path.display(),
                        "deleting catalog row for missing file"
                    );
                    self.delete_recording_row(row.id)?;
                    deleted += 1;
                }
            }
        }
        Ok((sealed, deleted))
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_recording(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordingRow> {
    Ok(RecordingRow {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: PathBuf::from(row.get::<_, String>(2)?),
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)?.max(0) as u64,
        is_complete: row.get(6)?,
    })
}

fn row_to_stream(row: &rusqlite::Row<'_>) -> rusqlite::Result<StreamConfig> {
    Ok(StreamConfig {
        name: row.get(0)?,
        url: row.get(1)?,
        segment_duration: row.get(2)?,
        record_audio: row.get(3)?,
        enabled: row.get(4)?,
        output_dir: PathBuf::from(row.get::<_, String>(5)?),
    })
}
