pub mod codec;
pub mod dataset;
pub mod error;
pub mod offline;
pub mod recorder;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{DatasetError, OfflineError, Result, StorageError, SyncError};
pub use offline::{OfflineEditing, OfflineOptions};
