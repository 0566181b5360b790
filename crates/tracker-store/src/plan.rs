//! Backend-independent mutation planning: validate a write against the current row and
//! build its audit record before anything is persisted.

use tracker_audit::AuditRecorder;
use tracker_types::{
    same_text, AuditStoreError, ImportMode, MutationContext, Operation, PendingAuditRecord,
    Snapshot, StoreError, TableSchema,
};

pub(crate) enum Mutation {
    Insert(Snapshot),
    /// Changes to merge into the current row.
    Update(Snapshot),
    Delete,
}

pub(crate) enum RowWrite {
    Put(Snapshot),
    Remove,
}

/// A validated write plus the audit record that must commit with it.
pub(crate) struct Prepared {
    pub write: RowWrite,
    pub pending: PendingAuditRecord,
}

/// Storage key for a row or key snapshot.
pub(crate) fn storage_key(schema: &TableSchema, fields: &Snapshot) -> Result<String, StoreError> {
    schema.key_of(fields).ok_or_else(|| {
        StoreError::BadRequest(format!(
            "{} requires key fields [{}]",
            schema.name,
            schema.key_fields.join(", ")
        ))
    })
}

pub(crate) fn prepare(
    schema: &TableSchema,
    recorder: &AuditRecorder,
    mutation: Mutation,
    existing: Option<Snapshot>,
    ctx: &MutationContext,
) -> Result<Prepared, StoreError> {
    let table = schema.name.as_str();
    match mutation {
        Mutation::Insert(mut row) => {
            if existing.is_some() {
                return Err(StoreError::Conflict(format!(
                    "{} row with key {} already exists",
                    table,
                    describe_key(schema, &row)
                )));
            }
            schema.apply_create_defaults(&mut row);
            let pending =
                recorder.record_mutation(table, Operation::Create, None, Some(row.clone()), ctx)?;
            Ok(Prepared {
                write: RowWrite::Put(row),
                pending,
            })
        }
        Mutation::Update(changes) => {
            let existing = existing.ok_or_else(|| not_found(table))?;
            let merged = merge_changes(schema, &existing, changes)?;
            let pending = recorder.record_mutation(
                table,
                Operation::Update,
                Some(existing),
                Some(merged.clone()),
                ctx,
            )?;
            Ok(Prepared {
                write: RowWrite::Put(merged),
                pending,
            })
        }
        Mutation::Delete => {
            let existing = existing.ok_or_else(|| not_found(table))?;
            let pending =
                recorder.record_mutation(table, Operation::Delete, Some(existing), None, ctx)?;
            Ok(Prepared {
                write: RowWrite::Remove,
                pending,
            })
        }
    }
}

fn not_found(table: &str) -> StoreError {
    StoreError::NotFound(format!("no {} row with that key", table))
}

fn describe_key(schema: &TableSchema, row: &Snapshot) -> String {
    schema.key_of(row).unwrap_or_else(|| "?".to_string())
}

/// Merge non-null changes over `existing`. Key fields may be repeated but not changed.
pub(crate) fn merge_changes(
    schema: &TableSchema,
    existing: &Snapshot,
    changes: Snapshot,
) -> Result<Snapshot, StoreError> {
    let mut merged = existing.clone();
    let mut applied = 0usize;
    for (field, value) in changes {
        if value.is_null() {
            continue;
        }
        if schema.is_key_field(&field) {
            if !existing.get(&field).map_or(false, |old| same_text(old, &value)) {
                return Err(StoreError::BadRequest(format!(
                    "key field {} of {} cannot be changed",
                    field, schema.name
                )));
            }
            continue;
        }
        merged.insert(field, value);
        applied += 1;
    }
    if applied == 0 {
        return Err(StoreError::BadRequest("no fields to update".to_string()));
    }
    Ok(merged)
}

pub(crate) enum MatchOutcome {
    /// The record has none of the match fields set.
    Skip,
    Existing(String),
    Missing,
}

/// Find the first stored row equal to `record` on every match field the record sets.
pub(crate) fn find_match<'a, I>(rows: I, record: &Snapshot, match_fields: &[String]) -> MatchOutcome
where
    I: IntoIterator<Item = (&'a String, &'a Snapshot)>,
{
    let conditions: Vec<(&String, &serde_json::Value)> = match_fields
        .iter()
        .filter_map(|f| record.get(f).filter(|v| !v.is_null()).map(|v| (f, v)))
        .collect();
    if conditions.is_empty() {
        return MatchOutcome::Skip;
    }
    rows.into_iter()
        .find(|(_, row)| {
            conditions
                .iter()
                .all(|(f, v)| row.get(f.as_str()).map_or(false, |have| same_text(have, v)))
        })
        .map(|(key, _)| MatchOutcome::Existing(key.clone()))
        .unwrap_or(MatchOutcome::Missing)
}

pub(crate) enum ImportStep {
    Skip,
    Insert { key: String, row: Snapshot },
    Update { key: String, changes: Snapshot },
}

pub(crate) fn plan_import_row(
    schema: &TableSchema,
    mode: ImportMode,
    record: Snapshot,
    outcome: MatchOutcome,
) -> Result<ImportStep, StoreError> {
    match (outcome, mode) {
        (MatchOutcome::Skip, _) => Ok(ImportStep::Skip),
        (MatchOutcome::Existing(_), ImportMode::Create) => Ok(ImportStep::Skip),
        (MatchOutcome::Existing(key), ImportMode::Update | ImportMode::Upsert) => {
            if !has_changes(schema, &record) {
                return Ok(ImportStep::Skip);
            }
            Ok(ImportStep::Update {
                key,
                changes: record,
            })
        }
        (MatchOutcome::Missing, ImportMode::Update) => Ok(ImportStep::Skip),
        (MatchOutcome::Missing, ImportMode::Create | ImportMode::Upsert) => {
            let key = storage_key(schema, &record)?;
            Ok(ImportStep::Insert { key, row: record })
        }
    }
}

fn has_changes(schema: &TableSchema, record: &Snapshot) -> bool {
    record
        .iter()
        .any(|(field, value)| !value.is_null() && !schema.is_key_field(field))
}

/// Audit records reaching either backend must carry an identifier.
pub(crate) fn check_identifier(pending: &PendingAuditRecord) -> Result<(), AuditStoreError> {
    if pending.record_identifier.trim().is_empty() {
        return Err(AuditStoreError::Other(format!(
            "{} record for {} has an empty record identifier",
            pending.operation, pending.entity_type
        )));
    }
    Ok(())
}

pub(crate) fn match_fields_or_key<'a>(
    schema: &'a TableSchema,
    match_fields: Option<&'a [String]>,
) -> &'a [String] {
    match match_fields {
        Some(fields) if !fields.is_empty() => fields,
        _ => &schema.key_fields,
    }
}
