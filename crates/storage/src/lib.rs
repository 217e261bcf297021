//! tidemark-storage: the time-ordered record store.
//!
//! A [`Collection`] maps document ids to sorted series of timestamped
//! records and carries a string key/value namespace on the side. All
//! operations are synchronous; the async boundary is at the caller
//! (server layer).

pub mod collection;
pub mod filter;
pub mod record;
pub mod series;

pub use collection::{Collection, StorageError};
pub use filter::KeyFilter;
pub use record::Record;
pub use series::DocumentSeries;

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
