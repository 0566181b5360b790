//! Traits for the audit log and the audited entity store.

use crate::{
    AuditQuery, AuditRecord, ImportMode, MutationContext, PendingAuditRecord, Snapshot,
    TableSchema, UpsertSummary,
};
use async_trait::async_trait;

/// Append-only audit log.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one record and return it with its assigned sequence id.
    async fn append(&self, record: PendingAuditRecord) -> Result<AuditRecord, AuditStoreError>;

    /// Read records matching the query, newest first.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, AuditStoreError>;
}

/// Storage for tracked rows. Every mutation commits together with exactly one audit record,
/// which is returned; if the audit write fails the row is left untouched.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Tables this store tracks.
    fn tables(&self) -> Vec<TableSchema>;

    /// Insert a new row. The row must carry every natural-key field.
    async fn insert(
        &self,
        entity_type: &str,
        row: Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError>;

    /// Merge `changes` into the row identified by `key` (natural-key values).
    /// Null values in `changes` are ignored.
    async fn update(
        &self,
        entity_type: &str,
        key: &Snapshot,
        changes: Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError>;

    /// Delete the row identified by `key`.
    async fn delete(
        &self,
        entity_type: &str,
        key: &Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError>;

    async fn get(&self, entity_type: &str, key: &Snapshot) -> Result<Option<Snapshot>, StoreError>;

    async fn list(&self, entity_type: &str) -> Result<Vec<Snapshot>, StoreError>;

    /// Import many rows in one unit of work. Rows are matched to existing rows on
    /// `match_fields` (natural key when `None`); the whole batch rolls back on any failure.
    async fn bulk_upsert(
        &self,
        entity_type: &str,
        rows: Vec<Snapshot>,
        mode: ImportMode,
        match_fields: Option<&[String]>,
        ctx: &MutationContext,
    ) -> Result<UpsertSummary, StoreError>;
}

/// A store that holds both the tracked rows and their audit log.
pub trait TrackerStore: EntityStore + AuditStore {}

impl<T: EntityStore + AuditStore + ?Sized> TrackerStore for T {}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("audit store error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("audit: {0}")]
    Audit(#[from] AuditError),
    #[error("audit log: {0}")]
    AuditStore(#[from] AuditStoreError),
    #[error("store error: {0}")]
    Other(String),
}
