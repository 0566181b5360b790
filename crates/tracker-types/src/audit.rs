//! Audit records, mutation context, and audit log queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::AuditError;

/// Field snapshot of a tracked row (field name -> value).
pub type Snapshot = serde_json::Map<String, serde_json::Value>;

/// Convert an arbitrary JSON value into a snapshot. Only objects are valid row states.
pub fn snapshot_from_value(value: serde_json::Value) -> Result<Snapshot, AuditError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(AuditError::MalformedSnapshot(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Kind of mutation observed on a tracked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[serde(alias = "INSERT")]
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown operation: {0} (expected CREATE, UPDATE or DELETE)")]
pub struct ParseOperationError(pub String);

impl FromStr for Operation {
    type Err = ParseOperationError;

    /// Case-insensitive; `INSERT` is accepted as a synonym for `CREATE`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" | "INSERT" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            _ => Err(ParseOperationError(s.to_string())),
        }
    }
}

/// Who performed a mutation and any free-form context to keep with its audit record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationContext {
    #[serde(default)]
    pub changed_by: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl MutationContext {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            changed_by: Some(actor.into()),
            metadata: None,
        }
    }
}

/// Audit record built by the recorder, not yet persisted (no sequence id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuditRecord {
    pub entity_type: String,
    pub operation: Operation,
    pub record_identifier: String,
    pub old_data: Option<Snapshot>,
    pub new_data: Option<Snapshot>,
    pub timestamp: DateTime<Utc>,
    pub changed_by: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl PendingAuditRecord {
    /// Attach the sequence id assigned by the store.
    pub fn into_record(self, id: i64) -> AuditRecord {
        AuditRecord {
            id,
            entity_type: self.entity_type,
            operation: self.operation,
            record_identifier: self.record_identifier,
            old_data: self.old_data,
            new_data: self.new_data,
            timestamp: self.timestamp,
            changed_by: self.changed_by,
            metadata: self.metadata,
        }
    }
}

/// One persisted audit log entry. Immutable once written.
///
/// `id` is allocated by the store at commit time and is the authoritative ordering key;
/// timestamps of concurrent transactions may interleave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub entity_type: String,
    pub operation: Operation,
    pub record_identifier: String,
    #[serde(default)]
    pub old_data: Option<Snapshot>,
    #[serde(default)]
    pub new_data: Option<Snapshot>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result ordering for audit queries (always descending, newest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOrder {
    #[default]
    IdDesc,
    TimestampDesc,
}

pub const DEFAULT_AUDIT_QUERY_LIMIT: u32 = 100;
pub const MAX_AUDIT_QUERY_LIMIT: u32 = 1000;

/// Filters and pagination for reading the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub operation: Option<Operation>,
    pub record_identifier: Option<String>,
    /// Inclusive lower bound on `timestamp`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`.
    pub until: Option<DateTime<Utc>>,
    pub order: AuditOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditQuery {
    /// History of a single record, newest first.
    pub fn for_record(entity_type: impl Into<String>, record_identifier: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            record_identifier: Some(record_identifier.into()),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_AUDIT_QUERY_LIMIT)
            .min(MAX_AUDIT_QUERY_LIMIT)
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref t) = self.entity_type {
            if &record.entity_type != t {
                return false;
            }
        }
        if let Some(op) = self.operation {
            if record.operation != op {
                return false;
            }
        }
        if let Some(ref ident) = self.record_identifier {
            if &record.record_identifier != ident {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        true
    }

    /// Filter, order, and paginate an in-memory set of records.
    pub fn apply<'a, I>(&self, records: I) -> Vec<AuditRecord>
    where
        I: IntoIterator<Item = &'a AuditRecord>,
    {
        let mut out: Vec<AuditRecord> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        match self.order {
            AuditOrder::IdDesc => out.sort_by(|a, b| b.id.cmp(&a.id)),
            AuditOrder::TimestampDesc => {
                out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)))
            }
        }
        out.into_iter()
            .skip(self.offset.unwrap_or(0) as usize)
            .take(self.effective_limit() as usize)
            .collect()
    }
}
