//! SQLite-backed tracker store. Each mutation runs in one transaction that writes the row
//! and inserts into `master_logs`; a failed audit insert rolls the row write back.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::OptionalExtension;
use tracker_audit::{default_tables, AuditRecorder};
use tracker_types::{
    AuditOrder, AuditQuery, AuditRecord, AuditStore, AuditStoreError, EntityStore, ImportMode,
    MutationContext, Operation, PendingAuditRecord, Snapshot, StoreError, TableSchema,
    UpsertSummary,
};

use crate::plan::{self, ImportStep, Mutation, RowWrite};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_rows (
    entity_type TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, natural_key)
);

CREATE TABLE IF NOT EXISTS master_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('CREATE', 'UPDATE', 'DELETE')),
    record_identifier TEXT NOT NULL CHECK (record_identifier <> ''),
    old_data TEXT,
    new_data TEXT,
    timestamp TEXT NOT NULL,
    changed_by TEXT,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_master_logs_entity ON master_logs(entity_type);
CREATE INDEX IF NOT EXISTS idx_master_logs_operation ON master_logs(operation);
CREATE INDEX IF NOT EXISTS idx_master_logs_record ON master_logs(entity_type, record_identifier);
CREATE INDEX IF NOT EXISTS idx_master_logs_timestamp ON master_logs(timestamp);

CREATE TRIGGER IF NOT EXISTS master_logs_no_update BEFORE UPDATE ON master_logs
BEGIN
    SELECT RAISE(ABORT, 'master_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS master_logs_no_delete BEFORE DELETE ON master_logs
BEGIN
    SELECT RAISE(ABORT, 'master_logs is append-only');
END;
"#;

const AUDIT_COLUMNS: &str =
    "id, entity_type, operation, record_identifier, old_data, new_data, timestamp, changed_by, metadata";

/// SQLite-backed tracker store for persistence.
pub struct SqliteTrackerStore {
    conn: std::sync::Mutex<rusqlite::Connection>,
    tables: Vec<TableSchema>,
    recorder: AuditRecorder,
}

impl SqliteTrackerStore {
    /// Open (or create) a store at the given path over the default table catalog.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn, default_tables(), AuditRecorder::default())
    }

    /// Non-persistent store, mostly for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn, default_tables(), AuditRecorder::default())
    }

    pub fn from_connection(
        conn: rusqlite::Connection,
        tables: Vec<TableSchema>,
        recorder: AuditRecorder,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
            tables,
            recorder,
        })
    }

    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.tables.retain(|t| t.name != schema.name);
        self.tables.push(schema);
        self
    }

    fn schema(&self, entity_type: &str) -> Result<&TableSchema, StoreError> {
        self.tables
            .iter()
            .find(|t| t.name == entity_type)
            .ok_or_else(|| StoreError::UnknownTable(entity_type.to_string()))
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Other(format!("failed to acquire lock: {}", e)))?;
        f(&conn)
    }

    /// Run `f` in a transaction; commit only if it succeeds.
    fn in_transaction<T, F>(&self, entity_type: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit().map_err(db_err)?;
                    Ok(value)
                }
                Err(e) => {
                    tracing::warn!(entity_type, error = %e, "transaction rolled back");
                    Err(e)
                }
            }
        })
    }

    fn mutate(
        &self,
        tx: &rusqlite::Transaction<'_>,
        schema: &TableSchema,
        key: &str,
        mutation: Mutation,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError> {
        let existing = load_row(tx, &schema.name, key)?;
        let prepared = plan::prepare(schema, &self.recorder, mutation, existing, ctx)?;
        let now = now_text(&Utc::now());
        match prepared.write {
            RowWrite::Put(ref row) => {
                let data = serde_json::to_string(row).map_err(|e| StoreError::Other(e.to_string()))?;
                tx.execute(
                    "INSERT INTO entity_rows (entity_type, natural_key, data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT (entity_type, natural_key) DO UPDATE SET
                        data = excluded.data,
                        updated_at = excluded.updated_at",
                    rusqlite::params![schema.name, key, data, now],
                )
                .map_err(db_err)?;
            }
            RowWrite::Remove => {
                tx.execute(
                    "DELETE FROM entity_rows WHERE entity_type = ?1 AND natural_key = ?2",
                    rusqlite::params![schema.name, key],
                )
                .map_err(db_err)?;
            }
        }
        let record = insert_audit(tx, prepared.pending)?;
        tracing::debug!(
            audit_id = record.id,
            entity_type = %schema.name,
            operation = %record.operation,
            record_identifier = %record.record_identifier,
            "mutation written"
        );
        Ok(record)
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Other(e.to_string())
}

fn audit_err(e: rusqlite::Error) -> AuditStoreError {
    AuditStoreError::Other(e.to_string())
}

/// Fixed-width UTC text so that string order equals time order.
fn now_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, AuditStoreError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| AuditStoreError::Other(e.to_string()))
}

fn load_row(
    conn: &rusqlite::Connection,
    entity_type: &str,
    key: &str,
) -> Result<Option<Snapshot>, StoreError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM entity_rows WHERE entity_type = ?1 AND natural_key = ?2",
            rusqlite::params![entity_type, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    data.map(|d| serde_json::from_str(&d).map_err(|e| StoreError::Other(e.to_string())))
        .transpose()
}

fn load_table(
    conn: &rusqlite::Connection,
    entity_type: &str,
) -> Result<BTreeMap<String, Snapshot>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT natural_key, data FROM entity_rows WHERE entity_type = ?1 ORDER BY natural_key")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([entity_type], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(db_err)?;
    let mut table = BTreeMap::new();
    for row in rows {
        let (key, data) = row.map_err(db_err)?;
        let snapshot: Snapshot =
            serde_json::from_str(&data).map_err(|e| StoreError::Other(e.to_string()))?;
        table.insert(key, snapshot);
    }
    Ok(table)
}

fn insert_audit(
    conn: &rusqlite::Connection,
    mut pending: PendingAuditRecord,
) -> Result<AuditRecord, AuditStoreError> {
    plan::check_identifier(&pending)?;
    // Stored at microsecond precision; return what a later read will see.
    pending.timestamp = pending.timestamp.trunc_subsecs(6);
    let old_data = to_json(&pending.old_data)?;
    let new_data = to_json(&pending.new_data)?;
    let metadata = to_json(&pending.metadata)?;
    conn.execute(
        "INSERT INTO master_logs (entity_type, operation, record_identifier, old_data, new_data, timestamp, changed_by, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            pending.entity_type,
            pending.operation.as_str(),
            pending.record_identifier,
            old_data,
            new_data,
            now_text(&pending.timestamp),
            pending.changed_by,
            metadata,
        ],
    )
    .map_err(audit_err)?;
    Ok(pending.into_record(conn.last_insert_rowid()))
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<Option<T>, rusqlite::Error> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_audit_row(row: &rusqlite::Row) -> Result<AuditRecord, rusqlite::Error> {
    let operation: String = row.get(2)?;
    let timestamp: String = row.get(6)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        operation: operation
            .parse::<Operation>()
            .map_err(|e| conversion_err(2, e))?,
        record_identifier: row.get(3)?,
        old_data: parse_json_column(row, 4)?,
        new_data: parse_json_column(row, 5)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| conversion_err(6, e))?
            .with_timezone(&Utc),
        changed_by: row.get(7)?,
        metadata: parse_json_column(row, 8)?,
    })
}

#[async_trait]
impl EntityStore for SqliteTrackerStore {
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
        self.in_transaction(entity_type, |tx| {
            self.mutate(tx, schema, &key, Mutation::Insert(row), ctx)
        })
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
        self.in_transaction(entity_type, |tx| {
            self.mutate(tx, schema, &key, Mutation::Update(changes), ctx)
        })
    }

    async fn delete(
        &self,
        entity_type: &str,
        key: &Snapshot,
        ctx: &MutationContext,
    ) -> Result<AuditRecord, StoreError> {
        let schema = self.schema(entity_type)?;
        let key = plan::storage_key(schema, key)?;
        self.in_transaction(entity_type, |tx| {
            self.mutate(tx, schema, &key, Mutation::Delete, ctx)
        })
    }

    async fn get(&self, entity_type: &str, key: &Snapshot) -> Result<Option<Snapshot>, StoreError> {
        let schema = self.schema(entity_type)?;
        let key = plan::storage_key(schema, key)?;
        self.with_conn(|conn| load_row(conn, entity_type, &key))
    }

    async fn list(&self, entity_type: &str) -> Result<Vec<Snapshot>, StoreError> {
        self.schema(entity_type)?;
        self.with_conn(|conn| Ok(load_table(conn, entity_type)?.into_values().collect()))
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
        let summary = self.in_transaction(entity_type, |tx| {
            // Working copy of the table, kept in step with the writes made in this transaction.
            let mut table = load_table(tx, entity_type)?;
            let mut summary = UpsertSummary::default();
            for record in rows {
                let outcome = plan::find_match(table.iter(), &record, match_fields);
                match plan::plan_import_row(schema, mode, record, outcome)? {
                    ImportStep::Skip => summary.skipped += 1,
                    ImportStep::Insert { key, row } => {
                        let rec = self.mutate(tx, schema, &key, Mutation::Insert(row), ctx)?;
                        if let Some(new) = rec.new_data {
                            table.insert(key, new);
                        }
                        summary.inserted += 1;
                    }
                    ImportStep::Update { key, changes } => {
                        let rec = self.mutate(tx, schema, &key, Mutation::Update(changes), ctx)?;
                        if let Some(new) = rec.new_data {
                            table.insert(key, new);
                        }
                        summary.updated += 1;
                    }
                }
            }
            Ok(summary)
        })?;
        tracing::info!(
            entity_type,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "bulk import committed"
        );
        Ok(summary)
    }
}

#[async_trait]
impl AuditStore for SqliteTrackerStore {
    async fn append(&self, record: PendingAuditRecord) -> Result<AuditRecord, AuditStoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditStoreError::Other(format!("failed to acquire lock: {}", e)))?;
        insert_audit(&conn, record)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, AuditStoreError> {
        let mut sql = format!("SELECT {} FROM master_logs WHERE 1=1", AUDIT_COLUMNS);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref entity_type) = query.entity_type {
            params.push(Box::new(entity_type.clone()));
            sql.push_str(&format!(" AND entity_type = ?{}", params.len()));
        }
        if let Some(op) = query.operation {
            params.push(Box::new(op.as_str()));
            sql.push_str(&format!(" AND operation = ?{}", params.len()));
        }
        if let Some(ref ident) = query.record_identifier {
            params.push(Box::new(ident.clone()));
            sql.push_str(&format!(" AND record_identifier = ?{}", params.len()));
        }
        if let Some(ref since) = query.since {
            params.push(Box::new(now_text(since)));
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        if let Some(ref until) = query.until {
            params.push(Box::new(now_text(until)));
            sql.push_str(&format!(" AND timestamp <= ?{}", params.len()));
        }

        sql.push_str(match query.order {
            AuditOrder::IdDesc => " ORDER BY id DESC",
            AuditOrder::TimestampDesc => " ORDER BY timestamp DESC, id DESC",
        });
        params.push(Box::new(i64::from(query.effective_limit())));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        params.push(Box::new(i64::from(query.offset.unwrap_or(0))));
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditStoreError::Other(format!("failed to acquire lock: {}", e)))?;
        let mut stmt = conn.prepare(&sql).map_err(audit_err)?;
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(refs.as_slice(), parse_audit_row)
            .map_err(audit_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(audit_err)?);
        }
        Ok(out)
    }
}
