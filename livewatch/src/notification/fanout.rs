//! Subscription fan-out.
//!
//! Turns one confirmed transition into one queued row per interested
//! subscriber. Runs inside the transaction that produced the transition, so
//! a promotion and its notifications commit together.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{NewNotification, SubscriberDbModel, SubscriptionDbModel};
use crate::database::repositories::{NotificationQueueTxOps, SubscriptionTxOps};
use crate::domain::{ConfirmedStatus, ConfirmedTransition, EntityKey, NotificationKind, StatusKind};

pub const PRIORITY_NORMAL: i64 = 0;
pub const PRIORITY_HIGH: i64 = 1;

/// Default block counter above which regular notifications are suppressed.
pub const DEFAULT_BLOCK_THRESHOLD: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutPolicy {
    /// Chats whose block counter exceeds this get no regular notifications.
    pub block_threshold: i64,
    /// Mark queued rows for social reposting.
    pub social: bool,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
            social: false,
        }
    }
}

/// The row to queue for `subscriber`, or `None` when it opted out or is
/// considered blocked.
pub fn notification_for(
    subscriber: &SubscriberDbModel,
    transition: &ConfirmedTransition,
    policy: &FanoutPolicy,
) -> Option<NewNotification> {
    let online = transition.status.is_online();
    if !online && !subscriber.offline_notifications {
        return None;
    }
    if subscriber.block > policy.block_threshold {
        return None;
    }

    Some(NewNotification {
        endpoint: subscriber.endpoint.clone(),
        chat_id: subscriber.chat_id,
        site: transition.key.site.clone(),
        entity_id: transition.key.entity_id.clone(),
        status: transition.status.as_str().to_string(),
        time_diff: transition.time_diff,
        image_url: transition.image_url.clone(),
        social: policy.social,
        priority: if online { PRIORITY_HIGH } else { PRIORITY_NORMAL },
        sound: online,
        kind: NotificationKind::StatusChange,
    })
}

/// Queue `transition` for every confirmed subscriber of its entity.
/// Returns the number of queued rows.
pub async fn enqueue_transition(
    tx: &mut SqliteConnection,
    transition: &ConfirmedTransition,
    policy: &FanoutPolicy,
    now_ms: i64,
) -> Result<usize> {
    debug_assert!(transition.status != ConfirmedStatus::Unknown);

    let subscribers = SubscriptionTxOps::subscribers(&mut *tx, &transition.key).await?;
    let mut queued = 0;
    for subscriber in &subscribers {
        if let Some(notification) = notification_for(subscriber, transition, policy) {
            NotificationQueueTxOps::insert(&mut *tx, &notification, now_ms).await?;
            queued += 1;
        }
    }

    tracing::debug!(
        entity = %transition.key,
        status = %transition.status,
        subscribers = subscribers.len(),
        queued,
        "Fanned out confirmed transition"
    );
    Ok(queued)
}

/// Queue one terminal notification per removed subscription.
///
/// These bypass preferences and the block threshold.
pub async fn enqueue_profile_removed(
    tx: &mut SqliteConnection,
    key: &EntityKey,
    removed: &[SubscriptionDbModel],
    now_ms: i64,
) -> Result<usize> {
    for subscription in removed {
        let notification = NewNotification {
            endpoint: subscription.endpoint.clone(),
            chat_id: subscription.chat_id,
            site: key.site.clone(),
            entity_id: key.entity_id.clone(),
            status: StatusKind::NotFound.as_str().to_string(),
            time_diff: None,
            image_url: None,
            social: false,
            priority: PRIORITY_HIGH,
            sound: true,
            kind: NotificationKind::ProfileRemoved,
        };
        NotificationQueueTxOps::insert(&mut *tx, &notification, now_ms).await?;
    }
    Ok(removed.len())
}
