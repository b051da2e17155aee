use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording not found: {0}")]
    RecordingNotFound(i64),

    #[error("Field too long: {field} (max {max} chars, got {actual})")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("Invalid stream configuration: {0}")]
    InvalidStream(String),
}
