//! Resource model - hierarchical protected objects.
//!
//! Resources form a forest: each node has at most one parent. Cycle
//! rejection happens on insert, in the catalog service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub resource_type: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            resource_type: resource_type.into(),
            description: None,
            parent_id: None,
            owner_id: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}
