//! Run stores and snapshot sinks for Distillery.
//!
//! - [`InMemoryStore`]: ephemeral runs, used by tests and the default gateway
//! - [`SqliteStore`]: durable runs with write-once enforcement in the schema
//! - [`FileSnapshotSink`] / [`InMemorySnapshotSink`]: snapshot JSON blobs

pub mod in_memory;
pub mod snapshot_files;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use snapshot_files::{FileSnapshotSink, InMemorySnapshotSink};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
