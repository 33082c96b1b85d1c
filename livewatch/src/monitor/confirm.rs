//! Status confirmation engine.
//!
//! Raw observations are recorded as they arrive. A periodic sweep promotes
//! the confirmed status of every entity whose raw status has held for long
//! enough. Only promotions reach subscribers.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use super::diff::StatusEvent;
use crate::Result;
use crate::database::Store;
use crate::database::repositories::{
    EntityTxOps, PromotedRow, PromotionWindows, StatusLogTxOps, SubscriptionTxOps,
};
use crate::database::time::{ms_to_datetime, seconds_between};
use crate::domain::{ConfirmedStatus, ConfirmedTransition, EntityKey, StatusKind};
use crate::notification::fanout::{self, FanoutPolicy};

/// Debounce windows and the not-found removal threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub online: Duration,
    pub offline: Duration,
    pub not_found: Duration,
    pub denied: Duration,
    /// Remove an entity once its consecutive not-found count exceeds this.
    pub not_found_threshold: i64,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            online: Duration::from_secs(60),
            offline: Duration::from_secs(300),
            not_found: Duration::from_secs(300),
            denied: Duration::from_secs(300),
            not_found_threshold: 10,
        }
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl ConfirmationPolicy {
    /// How long `raw` must hold before it can be promoted; `None` if never.
    pub fn window_for(&self, raw: StatusKind) -> Option<Duration> {
        match raw {
            StatusKind::Online => Some(self.online),
            StatusKind::Offline => Some(self.offline),
            StatusKind::NotFound => Some(self.not_found),
            StatusKind::Denied => Some(self.denied),
            StatusKind::Unknown => Some(Duration::ZERO),
            StatusKind::Ambiguous => None,
        }
    }

    /// The promotion the sweep would apply to one entity, if any.
    ///
    /// Mirrors the predicate of the promotion statement.
    pub fn promotion(
        &self,
        confirmed: ConfirmedStatus,
        raw: StatusKind,
        raw_since_ms: i64,
        now_ms: i64,
    ) -> Option<ConfirmedStatus> {
        if raw.is_online() == confirmed.is_online() {
            return None;
        }
        let target = raw.settles_to()?;
        // Leaving online is only news for an entity confirmed online.
        if !raw.is_online() && confirmed != ConfirmedStatus::Online {
            return None;
        }
        let window = self.window_for(raw)?;
        (now_ms - raw_since_ms >= duration_ms(window)).then_some(target)
    }

    pub fn windows(&self) -> PromotionWindows {
        PromotionWindows {
            online_ms: duration_ms(self.online),
            offline_ms: duration_ms(self.offline),
            not_found_ms: duration_ms(self.not_found),
            denied_ms: duration_ms(self.denied),
        }
    }
}

/// One cycle's observations for a site.
#[derive(Debug, Clone, Default)]
pub struct ObservationBatch {
    pub site: String,
    pub events: Vec<StatusEvent>,
    pub images: HashMap<String, String>,
    /// Ids whose pending subscriptions passed their first check.
    pub confirmed_ids: Vec<String>,
    pub observed_at_ms: i64,
}

/// What recording a batch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub changed: usize,
    pub removed: Vec<EntityKey>,
    pub terminal_notifications: usize,
    pub subscriptions_confirmed: u64,
}

pub struct StatusConfirmer {
    store: Store,
    policy: ConfirmationPolicy,
    fanout: FanoutPolicy,
}

impl StatusConfirmer {
    pub fn new(store: Store, policy: ConfirmationPolicy, fanout: FanoutPolicy) -> Self {
        Self {
            store,
            policy,
            fanout,
        }
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    /// Record a cycle's raw observations in one write transaction.
    pub async fn apply_observations(&self, batch: &ObservationBatch) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        if batch.events.is_empty() && batch.confirmed_ids.is_empty() {
            return Ok(report);
        }

        let now = batch.observed_at_ms;
        let mut tx = self.store.begin_immediate().await?;

        for event in &batch.events {
            let key = EntityKey::new(&batch.site, &event.entity_id);
            let update = EntityTxOps::record_raw_status(&mut tx, &key, event.status, now).await?;

            if update.changed {
                StatusLogTxOps::append(&mut tx, &key, event.status, now).await?;
                report.changed += 1;
            }
            if let Some(image) = batch.images.get(&event.entity_id) {
                EntityTxOps::update_image(&mut tx, &key, image).await?;
            }

            if update.not_found_count > self.policy.not_found_threshold {
                let removed = SubscriptionTxOps::delete_for_entity(&mut tx, &key).await?;
                report.terminal_notifications +=
                    fanout::enqueue_profile_removed(&mut tx, &key, &removed, now).await?;
                EntityTxOps::reset_not_found(&mut tx, &key).await?;
                info!(
                    entity = %key,
                    subscribers = removed.len(),
                    "Removed entity after repeated not-found responses"
                );
                report.removed.push(key);
            }
        }

        for id in &batch.confirmed_ids {
            let key = EntityKey::new(&batch.site, id);
            report.subscriptions_confirmed += SubscriptionTxOps::confirm(&mut tx, &key).await?;
        }

        tx.commit().await?;

        debug!(
            site = %batch.site,
            events = batch.events.len(),
            changed = report.changed,
            "Applied raw observations"
        );
        Ok(report)
    }

    /// Promote every entity due for it and queue the resulting notifications,
    /// all in one write transaction.
    pub async fn sweep(&self, now_ms: i64) -> Result<Vec<ConfirmedTransition>> {
        let mut tx = self.store.begin_immediate().await?;

        let promoted = EntityTxOps::promote_due(&mut tx, now_ms, self.policy.windows()).await?;
        let mut transitions = Vec::with_capacity(promoted.len());
        let mut queued = 0;
        for row in promoted {
            let transition = transition_from_row(row, now_ms);
            queued += fanout::enqueue_transition(&mut tx, &transition, &self.fanout, now_ms).await?;
            transitions.push(transition);
        }

        tx.commit().await?;

        for transition in &transitions {
            info!(
                entity = %transition.key,
                status = %transition.status,
                time_diff = ?transition.time_diff,
                "Confirmed status change"
            );
        }
        if !transitions.is_empty() {
            debug!(
                promoted = transitions.len(),
                queued, "Confirmation sweep finished"
            );
        }
        Ok(transitions)
    }
}

fn transition_from_row(row: PromotedRow, now_ms: i64) -> ConfirmedTransition {
    let status = ConfirmedStatus::parse(&row.confirmed_status).unwrap_or(ConfirmedStatus::Offline);
    let since = if row.unconfirmed_timestamp > 0 {
        row.unconfirmed_timestamp
    } else {
        now_ms
    };
    ConfirmedTransition {
        key: EntityKey::new(row.site, row.entity_id),
        status,
        timestamp: ms_to_datetime(since),
        time_diff: seconds_between(row.prev_unconfirmed_timestamp, row.unconfirmed_timestamp),
        image_url: row.image_url,
    }
}
