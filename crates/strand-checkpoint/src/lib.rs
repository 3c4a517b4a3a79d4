//! Checkpoint persistence for Strand runs.
//!
//! [`CheckpointManager`] serializes run snapshots into a pluggable
//! [`CheckpointStore`]; [`SqliteCheckpointStore`] is the durable default and
//! [`InMemoryCheckpointStore`] covers tests and ephemeral callers.

pub mod manager;
pub mod sqlite;
pub mod store;

pub use manager::CheckpointManager;
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointInfo, CheckpointStore, InMemoryCheckpointStore, StoredCheckpoint};
