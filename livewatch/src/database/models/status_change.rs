//! Raw status change log model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only record of a raw transition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StatusChangeDbModel {
    pub id: i64,
    pub site: String,
    pub entity_id: String,
    pub status: String,
    pub timestamp: i64,
}
