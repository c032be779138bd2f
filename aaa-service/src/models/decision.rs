//! Decision model - the engine's answer to an access question.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One resolved role in an explanation, with its provenance tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTrace {
    pub role_name: String,
    pub source: String,
}

/// Attached when the caller asks for `explain=true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    /// The permission that matched, if any.
    pub matched: Option<String>,
    /// Roles that produced the matching permission, in resolution order.
    pub roles: Vec<RoleTrace>,
}

/// Allow/Deny answer. `consistency_token` lets clients pin follow-ups to
/// this decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub decision_id: String,
    pub consistency_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Explanation>,
    pub ts: DateTime<Utc>,
}

impl Decision {
    /// Time-ordered decision id; ids assigned by one process sort by
    /// assignment order.
    pub fn next_id() -> String {
        Uuid::now_v7().to_string()
    }

    pub fn allow(reason: impl Into<String>) -> Self {
        let id = Self::next_id();
        Self {
            allowed: true,
            reason: reason.into(),
            consistency_token: id.clone(),
            decision_id: id,
            explanation: None,
            ts: Utc::now(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        let id = Self::next_id();
        Self {
            allowed: false,
            reason: reason.into(),
            consistency_token: id.clone(),
            decision_id: id,
            explanation: None,
            ts: Utc::now(),
        }
    }

    pub fn with_explanation(mut self, explanation: Explanation) -> Self {
        self.explanation = Some(explanation);
        self
    }
}
