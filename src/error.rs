use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Failures of the change log store itself.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Change log corruption in table \"{table}\": failed to decode \"{column}\": {message}")]
    Corruption {
        table: String,
        column: String,
        message: String,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Error reported by a dataset driver. `message` is the driver's own text.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DatasetError {
    pub message: String,
}

impl DatasetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

/// Fatal outcomes of synchronizing one dataset.
///
/// Errors raised before the remote commit leave the change log untouched.
/// `IdMapUpdateFailed`, and an `IdentifierMismatch` found while pairing the
/// committed additions, are raised after it: the log is already purged and
/// the remote keeps the replayed edits.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Change log store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Remote dataset \"{locator}\" unavailable: {message}")]
    RemoteUnavailable { locator: String, message: String },

    #[error(
        "Identifier mismatch for \"{dataset}\": expected {expected} new remote features, found {found}"
    )]
    IdentifierMismatch {
        dataset: String,
        expected: usize,
        found: usize,
    },

    #[error("Remote commit failed for \"{dataset}\": {message}")]
    RemoteCommitFailed { dataset: String, message: String },

    #[error("Remote {operation} failed for \"{dataset}\": {message}")]
    RemoteEditFailed {
        dataset: String,
        operation: &'static str,
        message: String,
    },

    #[error("Reading offline dataset \"{dataset}\" failed: {message}")]
    LocalReadFailed { dataset: String, message: String },

    #[error("Remote commit for \"{dataset}\" succeeded but its id mappings were not recorded: {message}")]
    IdMapUpdateFailed { dataset: String, message: String },

    #[error("Dataset \"{0}\" is still being recorded; stop recording before synchronizing")]
    StillRecording(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// OfflineError
// ---------------------------------------------------------------------------

/// Error of the change log, id map and facade bookkeeping calls. Replay
/// reports [`SyncError`] instead.
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for OfflineError {
    fn from(e: rusqlite::Error) -> Self {
        OfflineError::Storage(StorageError::Sqlite(e))
    }
}

/// Convenience alias; the default error type is `OfflineError`.
pub type Result<T, E = OfflineError> = std::result::Result<T, E>;

impl From<OfflineError> for SyncError {
    fn from(e: OfflineError) -> Self {
        let OfflineError::Storage(s) = e;
        SyncError::Storage(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
