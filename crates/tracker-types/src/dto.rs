//! Request and response DTOs for the tracker REST API.

use serde::{Deserialize, Serialize};

use crate::{AuditRecord, ImportMode, Snapshot, TableSchema, UpsertSummary};

/// Response envelope: `code` mirrors the HTTP status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseResponse<T> {
    #[serde(default = "default_code")]
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

fn default_code() -> i32 {
    200
}

impl<T> BaseResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

pub type MutationResponse = BaseResponse<AuditRecord>;
pub type RowResponse = BaseResponse<Snapshot>;
pub type RowListResponse = BaseResponse<Vec<Snapshot>>;
pub type TableListResponse = BaseResponse<Vec<TableSchema>>;
pub type ImportResponse = BaseResponse<UpsertSummary>;
pub type AuditListResponse = BaseResponse<Vec<AuditRecord>>;

/// Body for get/delete: the natural-key values of the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: serde_json::Value,
}

/// Body for update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub key: serde_json::Value,
    pub changes: serde_json::Value,
}

/// Body for bulk import of already-parsed rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub rows: Vec<serde_json::Value>,
    #[serde(default)]
    pub mode: ImportMode,
    #[serde(default)]
    pub match_fields: Option<Vec<String>>,
}
