//! Record identifier rules, keyed by table tag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracker_types::{render_value, Snapshot};

/// Field read by the generic rule for tables without a registered rule.
pub const CONTACT_FIELD: &str = "email";
/// Placeholder for a missing contact key or an empty identifier.
pub const UNKNOWN: &str = "unknown";
/// Text substituted for absent parts of a null-safe composite.
pub const NULL_TEXT: &str = "NULL";

const SEPARATOR: &str = "|";

type DeriveFn = dyn Fn(&Snapshot) -> Option<String> + Send + Sync;

/// How to derive a human-readable identifier from a row snapshot.
#[derive(Clone)]
pub enum IdentifierRule {
    /// One field's text value.
    Field(String),
    /// Pipe-joined field values; absent when any part is absent.
    Composite(Vec<String>),
    /// Pipe-joined field values with [`NULL_TEXT`] in place of absent parts.
    NullSafeComposite(Vec<String>),
    Custom(Arc<DeriveFn>),
}

impl IdentifierRule {
    pub fn field(name: &str) -> Self {
        IdentifierRule::Field(name.to_string())
    }

    pub fn composite(fields: &[&str]) -> Self {
        IdentifierRule::Composite(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn null_safe(fields: &[&str]) -> Self {
        IdentifierRule::NullSafeComposite(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Snapshot) -> Option<String> + Send + Sync + 'static,
    {
        IdentifierRule::Custom(Arc::new(f))
    }

    pub fn derive(&self, snapshot: &Snapshot) -> Option<String> {
        match self {
            IdentifierRule::Field(name) => field_text(snapshot, name),
            IdentifierRule::Composite(fields) => {
                let parts: Option<Vec<String>> =
                    fields.iter().map(|f| field_text(snapshot, f)).collect();
                parts.map(|p| p.join(SEPARATOR))
            }
            IdentifierRule::NullSafeComposite(fields) => Some(
                fields
                    .iter()
                    .map(|f| field_text(snapshot, f).unwrap_or_else(|| NULL_TEXT.to_string()))
                    .collect::<Vec<_>>()
                    .join(SEPARATOR),
            ),
            IdentifierRule::Custom(f) => f(snapshot),
        }
    }
}

impl fmt::Debug for IdentifierRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierRule::Field(name) => f.debug_tuple("Field").field(name).finish(),
            IdentifierRule::Composite(fields) => f.debug_tuple("Composite").field(fields).finish(),
            IdentifierRule::NullSafeComposite(fields) => {
                f.debug_tuple("NullSafeComposite").field(fields).finish()
            }
            IdentifierRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn field_text(snapshot: &Snapshot, name: &str) -> Option<String> {
    snapshot.get(name).and_then(render_value)
}

/// Table tag -> identifier rule. Tags without a rule use the generic
/// `<email or "unknown">|<tag>` form.
#[derive(Debug, Clone, Default)]
pub struct IdentifierRules {
    rules: HashMap<String, IdentifierRule>,
}

impl IdentifierRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: impl Into<String>, rule: IdentifierRule) -> &mut Self {
        self.rules.insert(entity_type.into(), rule);
        self
    }

    pub fn with(mut self, entity_type: impl Into<String>, rule: IdentifierRule) -> Self {
        self.register(entity_type, rule);
        self
    }

    pub fn get(&self, entity_type: &str) -> Option<&IdentifierRule> {
        self.rules.get(entity_type)
    }

    pub fn is_registered(&self, entity_type: &str) -> bool {
        self.rules.contains_key(entity_type)
    }

    /// Derive the record identifier for a snapshot of `entity_type`. Never empty.
    pub fn derive(&self, entity_type: &str, snapshot: &Snapshot) -> String {
        let derived = match self.rules.get(entity_type) {
            Some(rule) => rule.derive(snapshot),
            None => Some(generic_identifier(entity_type, snapshot)),
        };
        match derived {
            Some(ident) if !ident.is_empty() => ident,
            _ => format!("{}{}{}", entity_type, SEPARATOR, UNKNOWN),
        }
    }
}

fn generic_identifier(entity_type: &str, snapshot: &Snapshot) -> String {
    let contact = field_text(snapshot, CONTACT_FIELD).unwrap_or_else(|| UNKNOWN.to_string());
    format!("{}{}{}", contact, SEPARATOR, entity_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(v: serde_json::Value) -> Snapshot {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn composite_joins_in_declared_order() {
        let rule = IdentifierRule::composite(&["workshop_name", "email"]);
        let s = snap(json!({"email": "a@x.com", "workshop_name": "W1"}));
        assert_eq!(rule.derive(&s).as_deref(), Some("W1|a@x.com"));
    }

    #[test]
    fn composite_with_missing_part_is_absent() {
        let rule = IdentifierRule::composite(&["workshop_name", "email"]);
        let s = snap(json!({"workshop_name": "W1", "email": null}));
        assert_eq!(rule.derive(&s), None);
    }

    #[test]
    fn null_safe_composite_substitutes_null_text() {
        let rule = IdentifierRule::null_safe(&["week_number", "email"]);
        assert_eq!(
            rule.derive(&snap(json!({"week_number": 3}))).as_deref(),
            Some("3|NULL")
        );
        assert_eq!(
            rule.derive(&snap(json!({"email": "b@x.com"}))).as_deref(),
            Some("NULL|b@x.com")
        );
    }

    #[test]
    fn unregistered_type_uses_contact_key() {
        let rules = IdentifierRules::new();
        assert_eq!(rules.derive("badges", &snap(json!({"email": "x"}))), "x|badges");
        assert_eq!(rules.derive("badges", &snap(json!({"id": 7}))), "unknown|badges");
    }

    #[test]
    fn empty_identifier_falls_back() {
        let rules = IdentifierRules::new()
            .with("user_pii", IdentifierRule::field("email"))
            .with("notes", IdentifierRule::custom(|_| Some(String::new())));
        assert_eq!(rules.derive("user_pii", &snap(json!({"email": ""}))), "user_pii|unknown");
        assert_eq!(rules.derive("user_pii", &snap(json!({"name": "A"}))), "user_pii|unknown");
        assert_eq!(rules.derive("notes", &snap(json!({}))), "notes|unknown");
    }

    #[test]
    fn values_render_as_text() {
        assert_eq!(render_value(&json!(3)).as_deref(), Some("3"));
        assert_eq!(render_value(&json!(true)).as_deref(), Some("true"));
        assert_eq!(render_value(&json!("W1")).as_deref(), Some("W1"));
        assert_eq!(render_value(&json!([1, "a"])).as_deref(), Some(r#"[1,"a"]"#));
        assert_eq!(render_value(&json!(null)), None);
    }
}
