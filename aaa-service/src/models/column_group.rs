//! Column group model - named column sets backing column-level checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named set of columns of one table, attachable to roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnGroup {
    pub id: Uuid,
    pub name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ColumnGroup {
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            table_name: table_name.into(),
            columns,
            created_at: Utc::now(),
        }
    }
}
