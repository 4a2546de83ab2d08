pub mod id_map;
pub mod sqlite;
pub mod traits;

pub use sqlite::{LogStoreOptions, SqliteLogStore};
pub use traits::{ChangeLogBackend, IdentifierMap, LogStore};
