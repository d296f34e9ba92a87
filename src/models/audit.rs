use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit trail entry for state-changing actions on clinical or financial
/// entities. Written alongside the mutation and mirrored to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub clinic_id: i64,
    pub actor_id: i64,
    pub entity: String,
    pub entity_id: String,
    pub action: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        clinic_id: i64,
        actor_id: i64,
        entity: impl Into<String>,
        entity_id: impl ToString,
        action: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            clinic_id,
            actor_id,
            entity: entity.into(),
            entity_id: entity_id.to_string(),
            action: action.into(),
            outcome: outcome.into(),
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
