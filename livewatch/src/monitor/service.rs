//! Pipeline wiring.
//!
//! A [`SitePoller`] drives one site's poll → diff → record cycle through its
//! [`CheckerDaemon`]. The [`StatusMonitor`] owns every background task: the
//! per-site daemons and pollers, the confirmation sweep, the dispatcher and
//! maintenance.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::confirm::{ApplyReport, ObservationBatch, StatusConfirmer};
use super::daemon::{CheckerDaemon, DaemonHandle, PollOutcome, PollRequest};
use super::diff::SiteDiff;
use crate::database::repositories::{
    EntityRepository, SqlxEntityRepository, SqlxSubscriptionRepository, SubscriptionRepository,
};
use crate::database::time::now_ms;
use crate::database::{MaintenanceScheduler, Store};
use crate::domain::{EntityKey, StatusKind};
use crate::notification::Dispatcher;
use crate::sites::{CheckMode, SiteChecker};
use crate::{Error, Result};

/// Poll settings for one site.
#[derive(Debug, Clone)]
pub struct SitePollSettings {
    pub poll_interval: Duration,
    /// Pause between consecutive upstream queries of one request.
    pub query_interval: Duration,
    pub queue_capacity: usize,
    /// Ids always polled individually.
    pub specials: Vec<String>,
}

impl Default for SitePollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            query_interval: Duration::from_millis(500),
            queue_capacity: super::daemon::DEFAULT_QUEUE_CAPACITY,
            specials: Vec::new(),
        }
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The daemon's queue was full or the cycle was cancelled.
    Skipped,
    /// The multi-entity query failed; nothing was recorded.
    Failed,
    Applied(ApplyReport),
}

pub struct SitePoller {
    site: String,
    fixed_list: bool,
    handle: DaemonHandle,
    subscriptions: SqlxSubscriptionRepository,
    entities: SqlxEntityRepository,
    confirmer: Arc<StatusConfirmer>,
    diff: SiteDiff,
}

impl SitePoller {
    pub fn new(
        handle: DaemonHandle,
        fixed_list: bool,
        store: Store,
        confirmer: Arc<StatusConfirmer>,
        diff: SiteDiff,
    ) -> Self {
        Self {
            site: handle.site().to_string(),
            fixed_list,
            handle,
            subscriptions: SqlxSubscriptionRepository::new(store.clone()),
            entities: SqlxEntityRepository::new(store),
            confirmer,
            diff,
        }
    }

    /// Run one poll cycle.
    ///
    /// Full-listing sites fetch their listing; selective sites ask about
    /// every confirmed id in existence mode. Pending and special ids are
    /// always checked one by one.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let confirmed = self.subscriptions.confirmed_entity_ids(&self.site).await?;
        let unconfirmed = self.subscriptions.unconfirmed_entity_ids(&self.site).await?;
        let specials = self.entities.list_special_ids(&self.site).await?;

        let singles: BTreeSet<String> = unconfirmed.iter().chain(&specials).cloned().collect();
        let (selector, mode, tracked) = if self.fixed_list {
            (None, CheckMode::Online, None)
        } else {
            let selector: Vec<String> = confirmed
                .into_iter()
                .filter(|id| !singles.contains(id))
                .collect();
            let tracked: HashSet<String> = selector.iter().chain(&singles).cloned().collect();
            (Some(selector), CheckMode::Existence, Some(tracked))
        };

        let (request, reply) = PollRequest::new(selector, mode, singles.into_iter().collect());
        match self.handle.push_request(request) {
            Ok(()) => {}
            Err(e @ Error::QueueFull { .. }) => {
                warn!("{}; skipping poll cycle", e);
                return Ok(CycleOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(CycleOutcome::Skipped),
            outcome = reply => outcome.map_err(|_| {
                Error::Other(format!("checker daemon for {} dropped the request", self.site))
            })?,
        };

        let results = match outcome {
            PollOutcome::Completed(results) => results,
            PollOutcome::Failed { error, elapsed } => {
                warn!(
                    site = %self.site,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Poll cycle failed: {}",
                    error
                );
                return Ok(CycleOutcome::Failed);
            }
        };

        // The snapshot only advances once the observations are stored.
        let mut next = self.diff.clone();
        // A failed single query says nothing about the entity; keep its
        // previous state instead of diffing it out.
        let events =
            next.observe_partial(&results.check_results(), tracked.as_ref(), &results.failed);

        let confirmed_ids = unconfirmed
            .into_iter()
            .filter(|id| {
                matches!(results.statuses.get(id), Some(status) if *status != StatusKind::NotFound)
            })
            .collect();

        let batch = ObservationBatch {
            site: self.site.clone(),
            events,
            images: results.images,
            confirmed_ids,
            observed_at_ms: now_ms(),
        };
        let report = self.confirmer.apply_observations(&batch).await?;
        self.diff = next;

        debug!(
            site = %self.site,
            statuses = results.statuses.len(),
            errors = results.errors,
            events = batch.events.len(),
            elapsed_ms = results.elapsed.as_millis() as u64,
            "Poll cycle finished"
        );
        Ok(CycleOutcome::Applied(report))
    }

    pub fn spawn(mut self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_cycle(&cancel).await {
                            error!(site = %self.site, "Poll cycle aborted: {}", e);
                        }
                    }
                }
            }
            debug!("Poller for {} stopped", self.site);
        })
    }
}

/// Owns the background tasks of a running tracker.
pub struct StatusMonitor {
    store: Store,
    confirmer: Arc<StatusConfirmer>,
    cancellation_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StatusMonitor {
    pub fn new(store: Store, confirmer: StatusConfirmer, cancellation_token: CancellationToken) -> Self {
        Self {
            store,
            confirmer: Arc::new(confirmer),
            cancellation_token,
            tasks: Vec::new(),
        }
    }

    pub fn confirmer(&self) -> Arc<StatusConfirmer> {
        self.confirmer.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Build the poller for a site without starting it.
    ///
    /// Marks the configured specials and rebuilds the diff snapshot from the
    /// store, so a restart does not re-announce entities already online.
    pub async fn build_poller<C: SiteChecker>(
        &mut self,
        checker: Arc<C>,
        settings: &SitePollSettings,
    ) -> Result<SitePoller> {
        let site = checker.site().to_string();
        let entities = SqlxEntityRepository::new(self.store.clone());
        for id in &settings.specials {
            entities.set_special(&EntityKey::new(&site, id), true).await?;
        }
        let diff = SiteDiff::from_raw(entities.raw_statuses(&site).await?);

        let fixed_list = checker.uses_fixed_list();
        let (daemon, handle) = CheckerDaemon::new(
            checker,
            settings.queue_capacity,
            settings.query_interval,
            self.cancellation_token.child_token(),
        );
        self.tasks.push(daemon.spawn());

        info!(
            site = %site,
            fixed_list,
            online = diff.online().len(),
            "Site registered"
        );
        Ok(SitePoller::new(
            handle,
            fixed_list,
            self.store.clone(),
            self.confirmer.clone(),
            diff,
        ))
    }

    /// Register a site and start polling it.
    pub async fn add_site<C: SiteChecker>(
        &mut self,
        checker: Arc<C>,
        settings: &SitePollSettings,
    ) -> Result<()> {
        let poller = self.build_poller(checker, settings).await?;
        self.tasks
            .push(poller.spawn(settings.poll_interval, self.cancellation_token.clone()));
        Ok(())
    }

    pub fn start_confirmation_sweep(&mut self, period: Duration) {
        let confirmer = self.confirmer.clone();
        let cancel = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = confirmer.sweep(now_ms()).await {
                            error!("Confirmation sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Confirmation sweep stopped");
        }));
    }

    pub fn start_dispatcher(&mut self, dispatcher: Arc<Dispatcher>, period: Duration) {
        self.tasks
            .push(dispatcher.spawn(period, self.cancellation_token.clone()));
    }

    pub fn start_maintenance(&mut self, scheduler: Arc<MaintenanceScheduler>) {
        self.tasks
            .push(scheduler.start(self.cancellation_token.clone()));
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        info!("Stopping status monitor ({} tasks)", self.tasks.len());
        self.cancellation_token.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::confirm::ConfirmationPolicy;
    use crate::monitor::daemon::tests::ScriptedChecker;
    use crate::notification::FanoutPolicy;

    fn confirmer(store: &Store) -> StatusConfirmer {
        StatusConfirmer::new(
            store.clone(),
            ConfirmationPolicy::default(),
            FanoutPolicy::default(),
        )
    }

    fn settings() -> SitePollSettings {
        SitePollSettings {
            query_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_listing_cycle_records_edges_and_confirms_pending() {
        let store = Store::in_memory().await.unwrap();
        let subscriptions = SqlxSubscriptionRepository::new(store.clone());
        let entities = SqlxEntityRepository::new(store.clone());
        let cancel = CancellationToken::new();
        let mut monitor = StatusMonitor::new(store.clone(), confirmer(&store), cancel.clone());

        subscriptions
            .subscribe("telegram", 1, &EntityKey::new("site", "b"))
            .await
            .unwrap();
        let checker = Arc::new(ScriptedChecker::new("site", true));
        checker.set_listing(&[("a", StatusKind::Online)]);
        checker
            .singles
            .lock()
            .insert("b".to_string(), StatusKind::Offline);

        let mut poller = monitor.build_poller(checker.clone(), &settings()).await.unwrap();
        let CycleOutcome::Applied(report) = poller.run_cycle(&cancel).await.unwrap() else {
            panic!("expected applied cycle");
        };
        assert_eq!(report.changed, 1);
        assert_eq!(report.subscriptions_confirmed, 1);

        let a = entities.get_entity(&EntityKey::new("site", "a")).await.unwrap();
        assert_eq!(a.unconfirmed(), StatusKind::Online);
        assert_eq!(subscriptions.confirmed_entity_ids("site").await.unwrap(), vec!["b"]);

        checker.set_listing(&[]);
        poller.run_cycle(&cancel).await.unwrap();
        let a = entities.get_entity(&EntityKey::new("site", "a")).await.unwrap();
        assert_eq!(a.unconfirmed(), StatusKind::Offline);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_selective_cycle_uses_existence_mode_and_singles() {
        let store = Store::in_memory().await.unwrap();
        let subscriptions = SqlxSubscriptionRepository::new(store.clone());
        let cancel = CancellationToken::new();
        let mut monitor = StatusMonitor::new(store.clone(), confirmer(&store), cancel.clone());

        for id in ["a", "b"] {
            let key = EntityKey::new("site", id);
            subscriptions.subscribe("telegram", 1, &key).await.unwrap();
            subscriptions.confirm(&key).await.unwrap();
        }
        let checker = Arc::new(ScriptedChecker::new("site", false));
        checker.set_listing(&[("a", StatusKind::Online)]);
        checker
            .singles
            .lock()
            .insert("s".to_string(), StatusKind::Online);

        let poller_settings = SitePollSettings {
            specials: vec!["s".to_string()],
            ..settings()
        };
        let mut poller = monitor
            .build_poller(checker.clone(), &poller_settings)
            .await
            .unwrap();
        poller.run_cycle(&cancel).await.unwrap();

        assert_eq!(
            *checker.calls.lock(),
            vec!["many:Existence:a,b", "single:s"]
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_single_query_keeps_online_status() {
        let store = Store::in_memory().await.unwrap();
        let entities = SqlxEntityRepository::new(store.clone());
        let cancel = CancellationToken::new();
        let mut monitor = StatusMonitor::new(store.clone(), confirmer(&store), cancel.clone());

        let checker = Arc::new(ScriptedChecker::new("site", false));
        checker
            .singles
            .lock()
            .insert("s".to_string(), StatusKind::Online);
        let poller_settings = SitePollSettings {
            specials: vec!["s".to_string()],
            ..settings()
        };
        let mut poller = monitor
            .build_poller(checker.clone(), &poller_settings)
            .await
            .unwrap();
        let key = EntityKey::new("site", "s");

        poller.run_cycle(&cancel).await.unwrap();
        let before = entities.get_entity(&key).await.unwrap();
        assert_eq!(before.unconfirmed(), StatusKind::Online);

        // The next single query errors out.
        checker.singles.lock().clear();
        let CycleOutcome::Applied(report) = poller.run_cycle(&cancel).await.unwrap() else {
            panic!("expected applied cycle");
        };
        assert_eq!(report.changed, 0);

        let after = entities.get_entity(&key).await.unwrap();
        assert_eq!(after.unconfirmed(), StatusKind::Online);
        assert_eq!(after.unconfirmed_timestamp, before.unconfirmed_timestamp);

        // Answering again resumes normal diffing.
        checker
            .singles
            .lock()
            .insert("s".to_string(), StatusKind::Offline);
        poller.run_cycle(&cancel).await.unwrap();
        let recovered = entities.get_entity(&key).await.unwrap();
        assert_eq!(recovered.unconfirmed(), StatusKind::Offline);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_cycle_records_nothing() {
        let store = Store::in_memory().await.unwrap();
        let entities = SqlxEntityRepository::new(store.clone());
        let cancel = CancellationToken::new();
        let mut monitor = StatusMonitor::new(store.clone(), confirmer(&store), cancel.clone());

        let checker = Arc::new(ScriptedChecker::new("site", true));
        checker.fail_listing();
        let mut poller = monitor.build_poller(checker, &settings()).await.unwrap();

        assert_eq!(poller.run_cycle(&cancel).await.unwrap(), CycleOutcome::Failed);
        assert!(entities.list_site_entities("site").await.unwrap().is_empty());
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_does_not_reannounce_online_entities() {
        let store = Store::in_memory().await.unwrap();
        let cancel = CancellationToken::new();
        let checker = Arc::new(ScriptedChecker::new("site", true));
        checker.set_listing(&[("a", StatusKind::Online)]);

        let mut first = StatusMonitor::new(store.clone(), confirmer(&store), cancel.clone());
        let mut poller = first.build_poller(checker.clone(), &settings()).await.unwrap();
        poller.run_cycle(&cancel).await.unwrap();
        first.shutdown().await;

        let cancel = CancellationToken::new();
        let mut second = StatusMonitor::new(store.clone(), confirmer(&store), cancel.clone());
        let mut poller = second.build_poller(checker, &settings()).await.unwrap();
        let CycleOutcome::Applied(report) = poller.run_cycle(&cancel).await.unwrap() else {
            panic!("expected applied cycle");
        };
        assert_eq!(report.changed, 0);
        second.shutdown().await;
    }
}
