//! In-memory tracker store. Rows and the audit log share one lock, so a row write and its
//! audit record become visible together.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracker_audit::{default_tables, AuditRecorder};
use tracker_types::{
    AuditQuery, AuditRecord, AuditStore, AuditStoreError, EntityStore, ImportMode,
    MutationContext, PendingAuditRecord, Snapshot, StoreError, TableSchema, UpsertSummary,
};

use crate::plan::{self, ImportStep, Mutation, Prepared, RowWrite};

/// storage key -> row, ordered by key.
type Table = BTreeMap<String, Snapshot>;

#[derive(Default)]
struct State {
    /// table tag -> rows.
    rows: HashMap<String, Table>,
    log: Vec<AuditRecord>,
    last_id: i64,
}

struct Checkpoint {
    table: Option<Table>,
    log_len: usize,
    last_id: i64,
}

impl State {
    fn checkpoint(&self, entity_type: &str) -> Checkpoint {
        Checkpoint {
            table: self.rows.get(entity_type).cloned(),
            log_len: self.log.len(),
            last_id: self.last_id,
        }
    }

    fn restore(&mut self, entity_type: &str, cp: Checkpoint) {
        match cp.table {
            Some(table) => {
                self.rows.insert(entity_type.to_string(), table);
            }
            None => {
                self.rows.remove(entity_type);
            }
        }
        self.log.truncate(cp.log_len);
        self.last_id = cp.last_id;
    }

    fn row(&self, entity_type: &str, key: &str) -> Option<Snapshot> {
        self.rows.get(entity_type).and_then(|t| t.get(key)).cloned()
    }
}

/// In-memory implementation of EntityStore + AuditStore (process lifetime only).
pub struct InMemoryTrackerStore {
    tables: Vec<TableSchema>,
    recorder: AuditRecorder,
    state: Arc<RwLock<State>>,
    fail_next_audit: AtomicBool,
}

impl InMemoryTrackerStore {
    /// Store over the default table catalog and identifier rules.
    pub fn new() -> Self {
        Self::with_catalog(default_tables(), AuditRecorder::default())
    }

    pub fn with_catalog(tables: Vec<TableSchema>, recorder: AuditRecorder) -> Self {
        Self {
            tables,
            recorder,
            state: Arc::new(RwLock::new(State::default())),
            fail_next_audit: AtomicBool::new(false),
        }
    }

    /// Track an additional table (replaces an existing schema with the same name).
    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.tables.retain(|t| t.name != schema.name);
        self.tables.push(schema);
        self
    }

    /// Make the next audit append fail, as if the audit table rejected the write.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_audit_append(&self) {
        self.fail_next_audit.store(true, Ordering::SeqCst);
    }

    fn schema(&self, entity_type: &str) -> Result<&TableSchema, StoreError> {
        self.tables
            .iter()
            .find(|t| t.name == entity_type)
            .ok_or_else(|| StoreError::UnknownTable(entity_type.to_string()))
    }

    fn append_audit(
        &self,
        state: &mut State,
        pending: PendingAuditRecord,
    ) -> Result<AuditRecord, AuditStoreError> {
        plan::check_identifier(&pending)?;
        if self.fail_next_audit.swap(false, Ordering::SeqCst) {
            return Err(AuditStoreError::Other(
                "audit log rejected the write".to_string(),
            ));
        }
        state.last_id += 1;
        let record = pending.into_record(state.last_id);
        state.log.push(record.clone());
        Ok(record)
    }

    /// Append the audit record, then apply the row write. The row write cannot fail, so a
    /// failed append leaves the table untouched.
    fn commit(
        &self,
        state: &mut State,
        entity_type: &str,
        key: String,
        prepared: Prepared,
    ) -> Result<AuditRecord, StoreError> {
        let record = self.append_audit(state, prepared.pending)?;
        let table = state.rows.entry(entity_type.to_string()).or_default();
        match prepared.write {
            RowWrite::Put(row) => {
                table.insert(key, row);
            }
            RowWrite::Remove => {
                table.remove(&key);
            }
        }
        tracing::debug!(
            audit_id = record.id,
            entity_type,
            operation = %record.operation,
            record_identifier = %record.record_identifier,
            "mutation committed"
        );
        Ok(record)
    }

    fn mutate(
        &self,
        state: &mut State,
        schema: &TableSchema,
        key: String,
        mutation: Mutation,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError> {
        let existing = state.row(&schema.name, &key);
        let prepared = plan::prepare(schema, &self.recorder, mutation, existing, ctx)?;
        self.commit(state, &schema.name, key, prepared)
    }

    fn import_rows(
        &self,
        state: &mut State,
        schema: &TableSchema,
        rows: Vec<Snapshot>,
        mode: ImportMode,
        match_fields: &[String],
        ctx: &MutationContext,
    ) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        for record in rows {
            let outcome = match state.rows.get(&schema.name) {
                Some(table) => plan::find_match(table.iter(), &record, match_fields),
                None => plan::find_match(std::iter::empty(), &record, match_fields),
            };
            match plan::plan_import_row(schema, mode, record, outcome)? {
                ImportStep::Skip => summary.skipped += 1,
                ImportStep::Insert { key, row } => {
                    self.mutate(state, schema, key, Mutation::Insert(row), ctx)?;
                    summary.inserted += 1;
                }
                ImportStep::Update { key, changes } => {
                    self.mutate(state, schema, key, Mutation::Update(changes), ctx)?;
                    summary.updated += 1;
                }
            }
        }
        Ok(summary)
    }
}

impl Default for InMemoryTrackerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryTrackerStore {
    fn tables(&self) -> Vec<TableSchema> {
        self.tables.clone()
    }

    async fn insert(
        &self,
        entity_type: &str,
        row: Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError> {
        let schema = self.schema(entity_type)?;
        let key = plan::storage_key(schema, &row)?;
        let mut state = self.state.write().await;
        self.mutate(&mut state, schema, key, Mutation::Insert(row), ctx)
    }

    async fn update(
        &self,
        entity_type: &str,
        key: &Snapshot,
        changes: Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError> {
        let schema = self.schema(entity_type)?;
        let key = plan::storage_key(schema, key)?;
        let mut state = self.state.write().await;
        self.mutate(&mut state, schema, key, Mutation::Update(changes), ctx)
    }

    async fn delete(
        &self,
        entity_type: &str,
        key: &Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError> {
        let schema = self.schema(entity_type)?;
        let key = plan::storage_key(schema, key)?;
        let mut state = self.state.write().await;
        self.mutate(&mut state, schema, key, Mutation::Delete, ctx)
    }

    async fn get(&self, entity_type: &str, key: &Snapshot) -> Result<Option<Snapshot>, StoreError> {
        let schema = self.schema(entity_type)?;
        let key = plan::storage_key(schema, key)?;
        let state = self.state.read().await;
        Ok(state.row(entity_type, &key))
    }

    async fn list(&self, entity_type: &str) -> Result<Vec<Snapshot>, StoreError> {
        self.schema(entity_type)?;
        let state = self.state.read().await;
        Ok(state
            .rows
            .get(entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn bulk_upsert(
        &self,
        entity_type: &str,
        rows: Vec<Snapshot>,
        mode: ImportMode,
        match_fields: Option<&[String]>,
        ctx: &MutationContext,
    ) -> Result<UpsertSummary, StoreError> {
        let schema = self.schema(entity_type)?;
        let match_fields = plan::match_fields_or_key(schema, match_fields);
        let mut state = self.state.write().await;
        let checkpoint = state.checkpoint(entity_type);
        match self.import_rows(&mut state, schema, rows, mode, match_fields, ctx) {
            Ok(summary) => {
                tracing::info!(
                    entity_type,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    skipped = summary.skipped,
                    "bulk import committed"
                );
                Ok(summary)
            }
            Err(e) => {
                state.restore(entity_type, checkpoint);
                tracing::warn!(entity_type, error = %e, "bulk import rolled back");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryTrackerStore {
    async fn append(&self, record: PendingAuditRecord) -> Result<AuditRecord, AuditStoreError> {
        let mut state = self.state.write().await;
        self.append_audit(&mut state, record)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, AuditStoreError> {
        let state = self.state.read().await;
        Ok(query.apply(&state.log))
    }
}
