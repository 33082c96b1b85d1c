//! Dispatch sweep over the notification queue.
//!
//! Each sweep claims a batch of rows, hands every row to the sink for its
//! endpoint, updates block counters from the outcome and deletes the rows
//! that were delivered or blocked. Failed rows go back to the queue until
//! they reach [`MAX_DELIVERY_ATTEMPTS`]. A crash between claim and delete
//! leaves rows claimed; they are released on the next start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::{DeliveryOutcome, NotificationSink};
use crate::Result;
use crate::database::Store;
use crate::database::repositories::{
    BlockRepository, NotificationQueueRepository, SqlxBlockRepository,
    SqlxNotificationQueueRepository,
};

/// Default number of rows claimed per sweep.
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Failed deliveries after which a row is dropped.
pub const MAX_DELIVERY_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub blocked: usize,
    pub failed: usize,
    /// Failed rows dropped at the attempt cap
    pub dropped: usize,
}

pub struct Dispatcher {
    queue: SqlxNotificationQueueRepository,
    blocks: SqlxBlockRepository,
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
    batch_size: i64,
    max_attempts: i64,
}

impl Dispatcher {
    pub fn new(store: Store, batch_size: i64) -> Self {
        Self {
            queue: SqlxNotificationQueueRepository::new(store.clone()),
            blocks: SqlxBlockRepository::new(store),
            sinks: HashMap::new(),
            batch_size: batch_size.max(1),
            max_attempts: MAX_DELIVERY_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Register the sink for its endpoint, replacing any previous one.
    pub fn register_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        info!(endpoint = sink.endpoint(), "Notification sink registered");
        self.sinks.insert(sink.endpoint().to_string(), sink);
    }

    /// Put rows left claimed by a previous run back into the queue.
    pub async fn recover(&self) -> Result<u64> {
        let released = self.queue.release_claimed().await?;
        if released > 0 {
            warn!("Released {} notifications claimed by a previous run", released);
        }
        Ok(released)
    }

    /// Claim and deliver one batch.
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        let claimed = self.queue.claim_pending(self.batch_size).await?;
        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut finished = Vec::with_capacity(claimed.len());
        for notification in &claimed {
            let outcome = match self.sinks.get(&notification.endpoint) {
                Some(sink) => sink.deliver(notification).await,
                None => DeliveryOutcome::Failed(format!(
                    "no sink for endpoint {}",
                    notification.endpoint
                )),
            };

            match outcome {
                DeliveryOutcome::Delivered => {
                    self.blocks
                        .reset_block(&notification.endpoint, notification.chat_id)
                        .await?;
                    report.delivered += 1;
                    finished.push(notification.id);
                }
                DeliveryOutcome::Blocked => {
                    let block = self
                        .blocks
                        .increment_block(&notification.endpoint, notification.chat_id)
                        .await?;
                    debug!(
                        endpoint = %notification.endpoint,
                        chat_id = notification.chat_id,
                        block,
                        "Recipient blocked delivery"
                    );
                    report.blocked += 1;
                    finished.push(notification.id);
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(
                        id = notification.id,
                        endpoint = %notification.endpoint,
                        chat_id = notification.chat_id,
                        attempts = notification.attempts + 1,
                        "Notification delivery failed: {}",
                        reason
                    );
                    report.failed += 1;
                    if self
                        .queue
                        .record_failure(notification.id, &reason, self.max_attempts)
                        .await?
                    {
                        warn!(
                            id = notification.id,
                            "Dropping notification after {} failed attempts",
                            self.max_attempts
                        );
                        report.dropped += 1;
                    }
                }
            }
        }

        self.queue.complete(&finished).await?;
        debug!(?report, "Dispatch sweep finished");
        Ok(report)
    }

    /// Run dispatch sweeps every `period` until cancelled.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Dispatcher stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        // Drain full batches back to back. Failed rows wait for the next tick.
                        loop {
                            match self.dispatch_once().await {
                                Ok(report)
                                    if report.claimed as i64 >= self.batch_size
                                        && report.failed == 0 =>
                                {
                                    continue;
                                }
                                Ok(_) => break,
                                Err(e) => {
                                    error!("Dispatch sweep failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::models::{NewNotification, NotificationQueueDbModel};
    use crate::database::repositories::NotificationQueueTxOps;
    use crate::domain::NotificationKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Sink answering from a per-chat table and recording deliveries.
    pub(crate) struct RecordingSink {
        pub outcomes: HashMap<i64, DeliveryOutcome>,
        pub delivered: Mutex<Vec<NotificationQueueDbModel>>,
    }

    impl RecordingSink {
        pub fn new(outcomes: HashMap<i64, DeliveryOutcome>) -> Self {
            Self {
                outcomes,
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn endpoint(&self) -> &str {
            "telegram"
        }

        async fn deliver(&self, notification: &NotificationQueueDbModel) -> DeliveryOutcome {
            self.delivered.lock().push(notification.clone());
            self.outcomes
                .get(&notification.chat_id)
                .cloned()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    async fn seed(store: &Store, endpoint: &str, chat_ids: &[i64]) {
        let mut tx = store.begin_immediate().await.unwrap();
        for chat_id in chat_ids {
            let row = NewNotification {
                endpoint: endpoint.to_string(),
                chat_id: *chat_id,
                site: "site".to_string(),
                entity_id: "a".to_string(),
                status: "online".to_string(),
                time_diff: None,
                image_url: None,
                social: false,
                priority: 1,
                sound: true,
                kind: NotificationKind::StatusChange,
            };
            NotificationQueueTxOps::insert(&mut tx, &row, 1).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_updates_block_counters_and_requeues_failures() {
        let store = Store::in_memory().await.unwrap();
        let blocks = SqlxBlockRepository::new(store.clone());
        let queue = SqlxNotificationQueueRepository::new(store.clone());
        seed(&store, "telegram", &[1, 2, 3]).await;
        seed(&store, "unknown", &[4]).await;
        blocks.increment_block("telegram", 1).await.unwrap();

        let sink = Arc::new(RecordingSink::new(HashMap::from([
            (2, DeliveryOutcome::Blocked),
            (3, DeliveryOutcome::Failed("boom".to_string())),
        ])));
        let mut dispatcher = Dispatcher::new(store.clone(), 10);
        dispatcher.register_sink(sink.clone());

        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(
            report,
            DispatchReport {
                claimed: 4,
                delivered: 1,
                blocked: 1,
                failed: 2,
                dropped: 0,
            }
        );
        assert_eq!(sink.delivered.lock().len(), 3);
        assert_eq!(blocks.get_block("telegram", 1).await.unwrap(), 0);
        assert_eq!(blocks.get_block("telegram", 2).await.unwrap(), 1);

        let left = queue.list_all().await.unwrap();
        let chats: Vec<_> = left.iter().map(|r| r.chat_id).collect();
        assert_eq!(chats, vec![3, 4]);
        assert!(left.iter().all(|r| r.sending == 0 && r.attempts == 1));
        assert_eq!(left[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_failed_rows_are_retried_then_dropped_at_cap() {
        let store = Store::in_memory().await.unwrap();
        let queue = SqlxNotificationQueueRepository::new(store.clone());
        seed(&store, "unknown", &[7]).await;

        let dispatcher = Dispatcher::new(store.clone(), 10).with_max_attempts(3);

        for attempt in 1..3 {
            let report = dispatcher.dispatch_once().await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(report.dropped, 0);
            let rows = queue.list_all().await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].attempts, attempt);
        }

        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(queue.list_all().await.unwrap().is_empty());
        assert_eq!(dispatcher.dispatch_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_delivered_on_next_sweep() {
        let store = Store::in_memory().await.unwrap();
        let queue = SqlxNotificationQueueRepository::new(store.clone());
        seed(&store, "telegram", &[5]).await;

        let mut failing = Dispatcher::new(store.clone(), 10);
        failing.register_sink(Arc::new(RecordingSink::new(HashMap::from([(
            5,
            DeliveryOutcome::Failed("rate limited".to_string()),
        )]))));
        assert_eq!(failing.dispatch_once().await.unwrap().failed, 1);

        let mut healthy = Dispatcher::new(store.clone(), 10);
        let sink = Arc::new(RecordingSink::new(HashMap::new()));
        healthy.register_sink(sink.clone());
        let report = healthy.dispatch_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sink.delivered.lock()[0].attempts, 1);
        assert!(queue.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_makes_claimed_rows_dispatchable() {
        let store = Store::in_memory().await.unwrap();
        let queue = SqlxNotificationQueueRepository::new(store.clone());
        seed(&store, "telegram", &[1]).await;
        // A previous run claimed the row and died.
        assert_eq!(queue.claim_pending(10).await.unwrap().len(), 1);

        let sink = Arc::new(RecordingSink::new(HashMap::new()));
        let mut dispatcher = Dispatcher::new(store.clone(), 10);
        dispatcher.register_sink(sink.clone());

        assert_eq!(dispatcher.dispatch_once().await.unwrap().claimed, 0);
        assert_eq!(dispatcher.recover().await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch_once().await.unwrap().delivered, 1);
        assert_eq!(sink.delivered.lock().len(), 1);
    }
}
