//! Audited entity store: in-memory and (feature `sqlite`) SQLite backends.
//!
//! Each mutation writes the row and its audit record as one unit: both commit or neither does.

mod memory;
mod plan;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryTrackerStore;
pub use tracker_types::{
    AuditQuery, AuditRecord, AuditStore, AuditStoreError, EntityStore, ImportMode,
    MutationContext, Snapshot, StoreError, TableSchema, TrackerStore, UpsertSummary,
};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTrackerStore;
