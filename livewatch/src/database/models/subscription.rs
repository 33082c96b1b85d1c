//! Subscription and subscriber preference models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A chat's subscription to an entity.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionDbModel {
    pub endpoint: String,
    pub chat_id: i64,
    pub site: String,
    pub entity_id: String,
    /// False until the entity passed its first status check.
    pub confirmed: bool,
    pub created_at: i64,
}

/// A subscriber of one entity joined with its preferences and block counter.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SubscriberDbModel {
    pub endpoint: String,
    pub chat_id: i64,
    pub offline_notifications: bool,
    pub block: i64,
}
