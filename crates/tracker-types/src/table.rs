//! Table catalog entries and bulk import types.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::Snapshot;

/// Text form of a field value: strings verbatim, scalars in canonical form,
/// arrays/objects as compact JSON. Null has no text form.
pub fn render_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// True when both values have the same text form (`3` and `"3"` are equal).
pub fn same_text(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (render_value(a), render_value(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// A tracked table: its tag and the fields that make up its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub key_fields: Vec<String>,
    /// Fields set to the insert time when a new row leaves them absent or null.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_at_fields: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key_fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            key_fields: key_fields.iter().map(|f| f.to_string()).collect(),
            created_at_fields: Vec::new(),
        }
    }

    pub fn with_created_at(mut self, field: &str) -> Self {
        self.created_at_fields.push(field.to_string());
        self
    }

    /// Canonical storage key for a row: the text form of each key field value, as a JSON
    /// array. `None` when any key field is absent or null.
    pub fn key_of(&self, row: &Snapshot) -> Option<String> {
        let mut values = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            values.push(row.get(field).and_then(render_value)?);
        }
        serde_json::to_string(&values).ok()
    }

    /// Fill `created_at_fields` missing from a new row with the current UTC time.
    pub fn apply_create_defaults(&self, row: &mut Snapshot) {
        if self.created_at_fields.is_empty() {
            return;
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        for field in &self.created_at_fields {
            if row.get(field).map_or(true, serde_json::Value::is_null) {
                row.insert(field.clone(), serde_json::Value::String(now.clone()));
            }
        }
    }

    pub fn is_key_field(&self, field: &str) -> bool {
        self.key_fields.iter().any(|f| f == field)
    }
}

/// How a bulk import treats rows that do or do not match an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Insert unmatched rows; leave matched rows alone.
    Create,
    /// Update matched rows; ignore unmatched rows.
    Update,
    /// Update matched rows and insert unmatched ones.
    #[default]
    Upsert,
}

/// Counts returned by a bulk import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Rows that had no usable match fields, or that the mode did not apply to.
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_requires_every_key_field() {
        let schema = TableSchema::new("verification", &["workshop_name", "email"]);
        let row = json!({"workshop_name": "W1", "email": "a@x.com", "name": "A"});
        let key = schema.key_of(row.as_object().unwrap()).unwrap();
        assert_eq!(key, r#"["W1","a@x.com"]"#);

        let partial = json!({"workshop_name": "W1", "email": null});
        assert!(schema.key_of(partial.as_object().unwrap()).is_none());
        assert!(schema.is_key_field("email"));
        assert!(!schema.is_key_field("name"));
    }

    #[test]
    fn key_uses_text_form_of_values() {
        let schema = TableSchema::new("weekly_challenge", &["week_number", "email"]);
        let number = json!({"week_number": 3, "email": "b@x.com"});
        let text = json!({"week_number": "3", "email": "b@x.com"});
        assert_eq!(
            schema.key_of(number.as_object().unwrap()),
            schema.key_of(text.as_object().unwrap())
        );
        assert!(same_text(&json!(3), &json!("3")));
        assert!(!same_text(&json!(null), &json!(null)));
    }

    #[test]
    fn create_defaults_fill_only_missing_fields() {
        let schema = TableSchema::new("user_pii", &["email"]).with_created_at("registration_date_time");
        let mut row = json!({"email": "a@x.com", "registration_date_time": null})
            .as_object()
            .cloned()
            .unwrap();
        schema.apply_create_defaults(&mut row);
        assert!(row["registration_date_time"].is_string());

        let mut given = json!({"email": "a@x.com", "registration_date_time": "2024-01-01"})
            .as_object()
            .cloned()
            .unwrap();
        schema.apply_create_defaults(&mut given);
        assert_eq!(given["registration_date_time"], "2024-01-01");
    }
}
