// ── Intelsync Atoms: Error Types ───────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • The five sync-engine failures (unknown collection, dimension mismatch,
//     storage unavailable, corrupt document, invalid session state) each get
//     a dedicated variant so callers can match on them.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Lock contention, disk-full and I/O failures reported by SQLite are
//     reclassified as `StorageUnavailable` at the store boundary.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// The collection name is not declared in the schema registry.
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// An embedding's width differs from the width fixed for its collection.
    #[error("Dimension mismatch in {collection}: expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// The record store could not be written (lock contention, disk full, I/O).
    /// Prior committed state is intact; the whole session may be retried.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The mirror document could not be parsed.
    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    /// Session API misuse (double commit, commit after rollback, …).
    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),

    /// A record does not match its collection's declared shape.
    #[error("Invalid record in {collection}: {message}")]
    InvalidRecord { collection: String, message: String },

    /// The external embedding function could not produce a vector.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Store configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a record-shape error for a collection.
    pub fn invalid_record(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRecord { collection: collection.into(), message: message.into() }
    }

    /// Reclassify a rusqlite error raised while writing. Busy/locked/full/I/O
    /// failures become `StorageUnavailable`; everything else stays `Database`.
    pub fn from_write_failure(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::DiskFull
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly => Self::StorageUnavailable(err.to_string()),
                _ => Self::Database(err),
            },
            _ => Self::Database(err),
        }
    }

    /// Process exit code for a hook invocation that ended with this error.
    ///
    /// Shape and embedding problems degrade gracefully (logged, exit 0);
    /// storage and session-state failures must be visible to the hook harness.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StorageUnavailable(_) => 75,
            Self::InvalidSessionState(_) => 70,
            Self::Io(_) | Self::Database(_) | Self::Config(_) => 1,
            Self::UnknownCollection(_)
            | Self::DimensionMismatch { .. }
            | Self::CorruptDocument(_)
            | Self::InvalidRecord { .. }
            | Self::EmbeddingUnavailable(_)
            | Self::Serialization(_) => 0,
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
