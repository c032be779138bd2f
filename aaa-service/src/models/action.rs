//! Action model - verbs a permission can grant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Action entity. `is_static` marks built-in actions that cannot be renamed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_static: bool,
    pub service_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(name: impl Into<String>, service_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            is_static: false,
            service_id,
            created_at: Utc::now(),
        }
    }

    pub fn builtin(name: impl Into<String>, service_id: Option<String>) -> Self {
        Self {
            is_static: true,
            ..Self::new(name, service_id)
        }
    }
}
