//! Append-only log of raw status changes.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::Result;
use crate::database::Store;
use crate::database::models::StatusChangeDbModel;
use crate::domain::{EntityKey, StatusKind};

#[async_trait]
pub trait StatusLogRepository: Send + Sync {
    /// Most recent changes for an entity, newest first.
    async fn history(&self, key: &EntityKey, limit: i64) -> Result<Vec<StatusChangeDbModel>>;
    /// Delete log rows older than `cutoff_ms`. Returns the number of deleted rows.
    async fn prune_before(&self, cutoff_ms: i64) -> Result<u64>;
}

pub struct SqlxStatusLogRepository {
    store: Store,
}

impl SqlxStatusLogRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatusLogRepository for SqlxStatusLogRepository {
    async fn history(&self, key: &EntityKey, limit: i64) -> Result<Vec<StatusChangeDbModel>> {
        let rows = sqlx::query_as::<_, StatusChangeDbModel>(
            r#"
            SELECT * FROM status_changes
            WHERE site = ? AND entity_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .bind(limit)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows)
    }

    async fn prune_before(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM status_changes WHERE timestamp < ?")
            .bind(cutoff_ms)
            .execute(self.store.write_pool())
            .await?;
        Ok(result.rows_affected())
    }
}

/// Transactional operations for the status log.
pub struct StatusLogTxOps;

impl StatusLogTxOps {
    pub async fn append(
        tx: &mut SqliteConnection,
        key: &EntityKey,
        status: StatusKind,
        timestamp_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO status_changes (site, entity_id, status, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .bind(status.as_str())
        .bind(timestamp_ms)
        .execute(tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_is_newest_first_and_prunable() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxStatusLogRepository::new(store.clone());
        let key = EntityKey::new("site", "a");

        let mut tx = store.begin_immediate().await.unwrap();
        StatusLogTxOps::append(&mut tx, &key, StatusKind::Online, 1_000)
            .await
            .unwrap();
        StatusLogTxOps::append(&mut tx, &key, StatusKind::Offline, 2_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let history = repo.history(&key, 10).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["offline", "online"]);

        assert_eq!(repo.prune_before(1_500).await.unwrap(), 1);
        assert_eq!(repo.history(&key, 10).await.unwrap().len(), 1);
    }
}
