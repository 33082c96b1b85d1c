//! Notification queue models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::NotificationKind;

/// A row of the claim-based notification outbox.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationQueueDbModel {
    pub id: i64,
    pub endpoint: String,
    pub chat_id: i64,
    pub site: String,
    pub entity_id: String,
    /// Confirmed status carried by the notification
    pub status: String,
    /// Seconds spent in the previous state
    pub time_diff: Option<i64>,
    pub image_url: Option<String>,
    pub social: bool,
    pub priority: i64,
    pub sound: bool,
    /// status_change or profile_removed
    pub kind: String,
    /// 0 = eligible for dispatch, 1 = claimed
    pub sending: i64,
    /// Failed delivery attempts so far
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl NotificationQueueDbModel {
    pub fn notification_kind(&self) -> Option<NotificationKind> {
        NotificationKind::parse(&self.kind)
    }
}

/// Values for a row about to be appended to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub endpoint: String,
    pub chat_id: i64,
    pub site: String,
    pub entity_id: String,
    pub status: String,
    pub time_diff: Option<i64>,
    pub image_url: Option<String>,
    pub social: bool,
    pub priority: i64,
    pub sound: bool,
    pub kind: NotificationKind,
}
