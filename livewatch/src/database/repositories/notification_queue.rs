//! Claim-based notification outbox.
//!
//! Rows are appended with `sending = 0` inside the transaction that produced
//! them. A dispatch sweep claims rows by flipping `sending` to 1, delivers
//! them, then deletes them. A failed delivery puts the row back with its
//! attempt counter raised until the counter reaches the cap. Rows left claimed by a crashed process are put
//! back with [`NotificationQueueRepository::release_claimed`] on startup,
//! which makes delivery at-least-once.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::Result;
use crate::database::Store;
use crate::database::models::{NewNotification, NotificationQueueDbModel};

#[async_trait]
pub trait NotificationQueueRepository: Send + Sync {
    /// Atomically claim up to `limit` unclaimed rows, oldest first.
    ///
    /// A row is returned by at most one call until it is released.
    async fn claim_pending(&self, limit: i64) -> Result<Vec<NotificationQueueDbModel>>;
    /// Delete rows whose delivery finished.
    async fn complete(&self, ids: &[i64]) -> Result<u64>;
    /// Unclaim a row after a failed delivery and count the attempt.
    ///
    /// The row is deleted instead once `max_attempts` is reached. Returns
    /// `true` when the row was dropped.
    async fn record_failure(&self, id: i64, error: &str, max_attempts: i64) -> Result<bool>;
    /// Return every claimed row to the unclaimed state.
    async fn release_claimed(&self) -> Result<u64>;
    async fn pending_count(&self) -> Result<i64>;
    async fn list_all(&self) -> Result<Vec<NotificationQueueDbModel>>;
}

pub struct SqlxNotificationQueueRepository {
    store: Store,
}

impl SqlxNotificationQueueRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl NotificationQueueRepository for SqlxNotificationQueueRepository {
    async fn claim_pending(&self, limit: i64) -> Result<Vec<NotificationQueueDbModel>> {
        let mut tx = self.store.begin_immediate().await?;

        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM notification_queue WHERE sending = 0 ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();
        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE notification_queue SET sending = 1 WHERE sending = 0 AND id IN ");
        push_id_list(&mut builder, &ids);
        builder.push(" RETURNING *");

        let mut claimed = builder
            .build_query_as::<NotificationQueueDbModel>()
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        claimed.sort_by_key(|row| row.id);
        Ok(claimed)
    }

    async fn complete(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM notification_queue WHERE id IN ");
        push_id_list(&mut builder, ids);
        let result = builder.build().execute(self.store.write_pool()).await?;
        Ok(result.rows_affected())
    }

    async fn record_failure(&self, id: i64, error: &str, max_attempts: i64) -> Result<bool> {
        let mut tx = self.store.begin_immediate().await?;

        let attempts: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE notification_queue
            SET sending = 0, attempts = attempts + 1, last_error = ?
            WHERE id = ?
            RETURNING attempts
            "#,
        )
        .bind(error)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let dropped = match attempts {
            Some((attempts,)) if attempts >= max_attempts => {
                sqlx::query("DELETE FROM notification_queue WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                true
            }
            _ => false,
        };
        tx.commit().await?;
        Ok(dropped)
    }

    async fn release_claimed(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE notification_queue SET sending = 0 WHERE sending = 1")
            .execute(self.store.write_pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notification_queue WHERE sending = 0")
                .fetch_one(self.store.read_pool())
                .await?;
        Ok(count)
    }

    async fn list_all(&self) -> Result<Vec<NotificationQueueDbModel>> {
        let rows = sqlx::query_as::<_, NotificationQueueDbModel>(
            "SELECT * FROM notification_queue ORDER BY id",
        )
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows)
    }
}

/// Transactional operations for the notification queue.
///
/// These methods operate within an existing transaction and do NOT commit.
pub struct NotificationQueueTxOps;

impl NotificationQueueTxOps {
    /// Append one unclaimed row. No deduplication happens here.
    pub async fn insert(
        tx: &mut SqliteConnection,
        notification: &NewNotification,
        now_ms: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_queue (
                endpoint, chat_id, site, entity_id, status, time_diff, image_url,
                social, priority, sound, kind, sending, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&notification.endpoint)
        .bind(notification.chat_id)
        .bind(&notification.site)
        .bind(&notification.entity_id)
        .bind(&notification.status)
        .bind(notification.time_diff)
        .bind(&notification.image_url)
        .bind(notification.social)
        .bind(notification.priority)
        .bind(notification.sound)
        .bind(notification.kind.as_str())
        .bind(now_ms)
        .execute(tx)
        .await?;
        Ok(result.last_insert_rowid())
    }
}
