//! Audit log recorder: turns one mutation of a tracked row into one audit record.

mod catalog;
mod recorder;
mod rules;

pub use catalog::{default_rules, default_tables, tables};
pub use recorder::AuditRecorder;
pub use rules::{IdentifierRule, IdentifierRules, CONTACT_FIELD, NULL_TEXT, UNKNOWN};
pub use tracker_types::{render_value, AuditError, MutationContext, Operation, PendingAuditRecord, Snapshot};
