//! AuditRecorder: builds the audit record for one mutation.

use chrono::Utc;
use tracker_types::{AuditError, MutationContext, Operation, PendingAuditRecord, Snapshot};

use crate::{default_rules, IdentifierRules};

/// Stateless apart from its rule table; safe to share across concurrent mutations.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    rules: IdentifierRules,
}

impl AuditRecorder {
    pub fn new(rules: IdentifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &IdentifierRules {
        &self.rules
    }

    /// Identifier for a mutation: derived from `new` for CREATE/UPDATE, from `prior` for DELETE.
    pub fn record_identifier(
        &self,
        entity_type: &str,
        operation: Operation,
        prior: Option<&Snapshot>,
        new: Option<&Snapshot>,
    ) -> Result<String, AuditError> {
        let source = match operation {
            Operation::Create | Operation::Update => new,
            Operation::Delete => prior,
        };
        let source = source.ok_or_else(|| missing(entity_type, operation, source_name(operation)))?;
        Ok(self.rules.derive(entity_type, source))
    }

    /// Build the audit record for one mutation. Fails when a snapshot the operation
    /// requires is missing; the caller must then abandon the mutation.
    pub fn record_mutation(
        &self,
        entity_type: &str,
        operation: Operation,
        prior: Option<Snapshot>,
        new: Option<Snapshot>,
        ctx: &MutationContext,
    ) -> Result<PendingAuditRecord, AuditError> {
        if operation != Operation::Create && prior.is_none() {
            return Err(missing(entity_type, operation, "prior"));
        }
        if operation != Operation::Delete && new.is_none() {
            return Err(missing(entity_type, operation, "new"));
        }
        let record_identifier =
            self.record_identifier(entity_type, operation, prior.as_ref(), new.as_ref())?;

        let (old_data, new_data) = match operation {
            Operation::Create => (None, new),
            Operation::Update => (prior, new),
            Operation::Delete => (prior, None),
        };

        Ok(PendingAuditRecord {
            entity_type: entity_type.to_string(),
            operation,
            record_identifier,
            old_data,
            new_data,
            timestamp: Utc::now(),
            changed_by: ctx.changed_by.clone(),
            metadata: ctx.metadata.clone(),
        })
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

fn source_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Delete => "prior",
        _ => "new",
    }
}

fn missing(entity_type: &str, operation: Operation, which: &str) -> AuditError {
    tracing::warn!(entity_type, %operation, which, "snapshot missing for audited mutation");
    AuditError::MalformedSnapshot(format!(
        "{} on {} requires a {} snapshot",
        operation, entity_type, which
    ))
}
