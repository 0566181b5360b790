//! The program's tracked tables and their identifier rules.

use tracker_types::TableSchema;

use crate::{IdentifierRule, IdentifierRules};

/// Table tags.
pub mod tables {
    pub const USER_PII: &str = "user_pii";
    pub const FORM_RESPONSE: &str = "form_response";
    pub const AWS_TEAM_BUILDING: &str = "aws_team_building";
    pub const PROJECT_SUBMISSION: &str = "project_submission";
    pub const VERIFICATION: &str = "verification";
    pub const LAB_COMPLETION: &str = "lab_completion";
    pub const WEEKLY_CHALLENGE: &str = "weekly_challenge";
    pub const RBAC_USERS: &str = "rbac_users";
}

use tables::*;

pub fn default_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new(USER_PII, &["email"]).with_created_at("registration_date_time"),
        TableSchema::new(FORM_RESPONSE, &["form_name", "email"]),
        TableSchema::new(AWS_TEAM_BUILDING, &["workshop_name", "email"]),
        TableSchema::new(PROJECT_SUBMISSION, &["workshop_name", "email"]),
        TableSchema::new(VERIFICATION, &["workshop_name", "email"]),
        TableSchema::new(LAB_COMPLETION, &["lab_name", "email"]),
        TableSchema::new(WEEKLY_CHALLENGE, &["week_number", "email"]),
        TableSchema::new(RBAC_USERS, &["username"]),
    ]
}

/// `rbac_users` has no rule; its records use the generic `<email>|rbac_users` form.
pub fn default_rules() -> IdentifierRules {
    IdentifierRules::new()
        .with(USER_PII, IdentifierRule::field("email"))
        .with(FORM_RESPONSE, IdentifierRule::composite(&["form_name", "email"]))
        .with(AWS_TEAM_BUILDING, IdentifierRule::composite(&["workshop_name", "email"]))
        .with(PROJECT_SUBMISSION, IdentifierRule::composite(&["workshop_name", "email"]))
        .with(VERIFICATION, IdentifierRule::composite(&["workshop_name", "email"]))
        .with(LAB_COMPLETION, IdentifierRule::composite(&["lab_name", "email"]))
        .with(WEEKLY_CHALLENGE, IdentifierRule::null_safe(&["week_number", "email"]))
}
