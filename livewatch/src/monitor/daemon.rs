//! Per-site checker daemon.
//!
//! Each site gets one daemon task owning a bounded request queue. Requests
//! are served strictly one at a time, so a site is never queried
//! concurrently by this process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::StatusKind;
use crate::sites::{CheckMode, CheckResults, SiteChecker};
use crate::{Error, Result};

/// Default request queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// One unit of work for a daemon.
#[derive(Debug)]
pub struct PollRequest {
    /// Ids for a multi-entity query. `None` asks a full-listing checker for
    /// its whole listing.
    pub selector: Option<Vec<String>>,
    pub mode: CheckMode,
    /// Ids checked one by one after the multi-entity query.
    pub single_ids: Vec<String>,
    pub reply: oneshot::Sender<PollOutcome>,
}

impl PollRequest {
    pub fn new(
        selector: Option<Vec<String>>,
        mode: CheckMode,
        single_ids: Vec<String>,
    ) -> (Self, oneshot::Receiver<PollOutcome>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                selector,
                mode,
                single_ids,
                reply,
            },
            rx,
        )
    }
}

/// Everything learned by one request.
#[derive(Debug, Clone, Default)]
pub struct StatusResults {
    pub statuses: HashMap<String, StatusKind>,
    pub images: HashMap<String, String>,
    pub elapsed: Duration,
    /// Single-id queries that failed.
    pub errors: usize,
    /// Ids whose single query failed; they have no entry in `statuses`.
    pub failed: HashSet<String>,
}

impl StatusResults {
    pub fn check_results(&self) -> CheckResults {
        CheckResults {
            statuses: self.statuses.clone(),
            images: self.images.clone(),
        }
    }
}

/// Reply sent back through [`PollRequest::reply`].
#[derive(Debug)]
pub enum PollOutcome {
    Completed(StatusResults),
    /// The multi-entity query failed; no partial statuses are reported.
    Failed { error: Error, elapsed: Duration },
}

/// Sending side of a daemon's queue.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    site: String,
    sender: mpsc::Sender<PollRequest>,
}

impl DaemonHandle {
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Enqueue without waiting. A full queue is reported as
    /// [`Error::QueueFull`] and the caller skips its cycle.
    pub fn push_request(&self, request: PollRequest) -> Result<()> {
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull {
                site: self.site.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => {
                Error::Other(format!("checker daemon for {} has stopped", self.site))
            }
        })
    }
}

pub struct CheckerDaemon<C: SiteChecker> {
    checker: Arc<C>,
    mailbox: mpsc::Receiver<PollRequest>,
    /// Pause between consecutive upstream queries of one request.
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl<C: SiteChecker> CheckerDaemon<C> {
    pub fn new(
        checker: Arc<C>,
        capacity: usize,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> (Self, DaemonHandle) {
        let (sender, mailbox) = mpsc::channel(capacity.max(1));
        let handle = DaemonHandle {
            site: checker.site().to_string(),
            sender,
        };
        let daemon = Self {
            checker,
            mailbox,
            interval,
            cancellation_token,
        };
        (daemon, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Checker daemon for {} starting", self.checker.site());

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    debug!("Checker daemon for {} cancelled", self.checker.site());
                    break;
                }

                request = self.mailbox.recv() => {
                    let Some(request) = request else {
                        debug!("Checker daemon for {} mailbox closed", self.checker.site());
                        break;
                    };
                    let PollRequest { selector, mode, single_ids, reply } = request;
                    let outcome = self.process(selector, mode, &single_ids).await;
                    if reply.send(outcome).is_err() {
                        debug!("Poll reply for {} dropped by requester", self.checker.site());
                    }
                }
            }
        }

        info!("Checker daemon for {} stopped", self.checker.site());
    }

    async fn process(
        &self,
        selector: Option<Vec<String>>,
        mode: CheckMode,
        single_ids: &[String],
    ) -> PollOutcome {
        let start = Instant::now();
        let site = self.checker.site();
        let mut results = StatusResults::default();
        let mut queried = false;

        let bulk = match selector {
            None if self.checker.uses_fixed_list() => Some(Vec::new()),
            Some(ids) if !ids.is_empty() || self.checker.uses_fixed_list() => Some(ids),
            _ => None,
        };

        if let Some(ids) = bulk {
            match self.checker.check_many(&ids, mode).await {
                Ok(CheckResults { statuses, images }) => {
                    results.statuses = statuses;
                    results.images = images;
                    queried = true;
                }
                Err(error) => {
                    warn!(site = %site, error = %error, "Multi-entity query failed");
                    return PollOutcome::Failed {
                        error,
                        elapsed: start.elapsed(),
                    };
                }
            }
        }

        for id in single_ids {
            if queried && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            queried = true;

            match self.checker.check_single(id).await {
                Ok(status) => {
                    results.statuses.insert(id.clone(), status);
                }
                Err(error) => {
                    warn!(site = %site, entity_id = %id, error = %error, "Single-entity query failed");
                    results.errors += 1;
                    results.failed.insert(id.clone());
                }
            }
        }

        results.elapsed = start.elapsed();
        debug!(
            site = %site,
            statuses = results.statuses.len(),
            errors = results.errors,
            elapsed_ms = results.elapsed.as_millis() as u64,
            "Poll request served"
        );
        PollOutcome::Completed(results)
    }
}
