//! State persistence and resume support for the flowrun workflow engine.
//!
//! Snapshots are keyed blobs addressed by workflow id. Three backends
//! implement the same [`StateStore`] contract: an atomic filesystem
//! store, a SQLite store with transactional compare-and-set, and an
//! in-memory store for tests.

pub mod file;
pub mod memory;
pub mod models;
pub mod retention;
pub mod sqlite;
pub mod store;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use models::{
    SnapshotStatus, SnapshotSummary, StepRecordStatus, StepState, WorkflowSnapshot,
};
pub use retention::RetentionManager;
pub use sqlite::SqliteStateStore;
pub use store::{Result, StateError, StateStore, StateStoreRef};
