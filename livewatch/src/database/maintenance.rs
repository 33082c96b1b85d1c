//! Database maintenance.
//!
//! Periodically prunes the raw status log and deletes entities nothing
//! refers to any more.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::database::Store;
use crate::database::repositories::{
    EntityRepository, SqlxEntityRepository, SqlxStatusLogRepository, StatusLogRepository,
};
use crate::database::time::now_ms;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance runs (default: 1 hour).
    pub interval: Duration,
    /// Status log retention period in days (default: 30).
    pub status_log_retention_days: u32,
    /// Delete entities without subscriptions (default: true).
    pub delete_orphans: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            status_log_retention_days: 30,
            delete_orphans: true,
        }
    }
}

/// Summary of one maintenance run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub status_changes_pruned: u64,
    pub orphans_deleted: u64,
}

/// Database maintenance scheduler.
pub struct MaintenanceScheduler {
    entities: SqlxEntityRepository,
    status_log: SqlxStatusLogRepository,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(store: Store, config: MaintenanceConfig) -> Self {
        Self {
            entities: SqlxEntityRepository::new(store.clone()),
            status_log: SqlxStatusLogRepository::new(store),
            config,
        }
    }

    /// Start the maintenance loop; it stops when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Maintenance scheduler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.run_maintenance().await {
                            tracing::error!("Maintenance error: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> crate::Result<MaintenanceReport> {
        self.run_maintenance_at(now_ms()).await
    }

    pub async fn run_maintenance_at(&self, now_ms: i64) -> crate::Result<MaintenanceReport> {
        tracing::debug!("Starting database maintenance");

        let cutoff = now_ms - i64::from(self.config.status_log_retention_days) * MS_PER_DAY;
        let status_changes_pruned = self.status_log.prune_before(cutoff).await?;
        if status_changes_pruned > 0 {
            tracing::info!("Pruned {} old status changes", status_changes_pruned);
        }

        let orphans_deleted = if self.config.delete_orphans {
            self.entities.delete_orphans().await?
        } else {
            0
        };
        if orphans_deleted > 0 {
            tracing::info!("Deleted {} orphan entities", orphans_deleted);
        }

        Ok(MaintenanceReport {
            status_changes_pruned,
            orphans_deleted,
        })
    }
}
