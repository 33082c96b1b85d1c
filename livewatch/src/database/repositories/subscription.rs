//! Subscriptions and subscriber preferences.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use super::entity::EntityTxOps;
use crate::Result;
use crate::database::Store;
use crate::database::models::{SubscriberDbModel, SubscriptionDbModel};
use crate::database::time::now_ms;
use crate::domain::EntityKey;

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Subscribe a chat to an entity. The subscription starts unconfirmed.
    /// Returns false if it already existed.
    async fn subscribe(&self, endpoint: &str, chat_id: i64, key: &EntityKey) -> Result<bool>;
    async fn unsubscribe(&self, endpoint: &str, chat_id: i64, key: &EntityKey) -> Result<bool>;
    async fn list_for_chat(&self, endpoint: &str, chat_id: i64) -> Result<Vec<SubscriptionDbModel>>;
    /// Ids with at least one confirmed subscription on `site`.
    async fn confirmed_entity_ids(&self, site: &str) -> Result<Vec<String>>;
    /// Ids whose subscriptions on `site` are all still unconfirmed.
    async fn unconfirmed_entity_ids(&self, site: &str) -> Result<Vec<String>>;
    async fn confirm(&self, key: &EntityKey) -> Result<u64>;
    async fn set_offline_notifications(
        &self,
        endpoint: &str,
        chat_id: i64,
        enabled: bool,
    ) -> Result<()>;
    /// Confirmed subscribers of an entity with their preferences.
    async fn subscribers(&self, key: &EntityKey) -> Result<Vec<SubscriberDbModel>>;
    /// Distinct chats with a subscription whose block counter is at most
    /// `block_threshold`.
    async fn count_active_chats(&self, block_threshold: i64) -> Result<i64>;
}

pub struct SqlxSubscriptionRepository {
    store: Store,
}

impl SqlxSubscriptionRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SubscriptionRepository for SqlxSubscriptionRepository {
    async fn subscribe(&self, endpoint: &str, chat_id: i64, key: &EntityKey) -> Result<bool> {
        let now = now_ms();
        let mut tx = self.store.begin_immediate().await?;
        EntityTxOps::ensure_entity(&mut tx, key, now).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (endpoint, chat_id, site, entity_id, confirmed, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT (endpoint, chat_id, site, entity_id) DO NOTHING
            "#,
        )
        .bind(endpoint)
        .bind(chat_id)
        .bind(&key.site)
        .bind(&key.entity_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unsubscribe(&self, endpoint: &str, chat_id: i64, key: &EntityKey) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM subscriptions WHERE endpoint = ? AND chat_id = ? AND site = ? AND entity_id = ?",
        )
        .bind(endpoint)
        .bind(chat_id)
        .bind(&key.site)
        .bind(&key.entity_id)
        .execute(self.store.write_pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_for_chat(
        &self,
        endpoint: &str,
        chat_id: i64,
    ) -> Result<Vec<SubscriptionDbModel>> {
        let rows = sqlx::query_as::<_, SubscriptionDbModel>(
            r#"
            SELECT * FROM subscriptions
            WHERE endpoint = ? AND chat_id = ?
            ORDER BY site, entity_id
            "#,
        )
        .bind(endpoint)
        .bind(chat_id)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows)
    }

    async fn confirmed_entity_ids(&self, site: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT entity_id FROM subscriptions
            WHERE site = ? AND confirmed = 1
            ORDER BY entity_id
            "#,
        )
        .bind(site)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn unconfirmed_entity_ids(&self, site: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT entity_id FROM subscriptions
            WHERE site = ?
            GROUP BY entity_id
            HAVING MAX(confirmed) = 0
            ORDER BY entity_id
            "#,
        )
        .bind(site)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn confirm(&self, key: &EntityKey) -> Result<u64> {
        let mut conn = self.store.write_pool().acquire().await?;
        SubscriptionTxOps::confirm(&mut conn, key).await
    }

    async fn set_offline_notifications(
        &self,
        endpoint: &str,
        chat_id: i64,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (endpoint, chat_id, offline_notifications, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (endpoint, chat_id) DO UPDATE SET
                offline_notifications = excluded.offline_notifications
            "#,
        )
        .bind(endpoint)
        .bind(chat_id)
        .bind(enabled)
        .bind(now_ms())
        .execute(self.store.write_pool())
        .await?;
        Ok(())
    }

    async fn subscribers(&self, key: &EntityKey) -> Result<Vec<SubscriberDbModel>> {
        let mut conn = self.store.read_pool().acquire().await?;
        SubscriptionTxOps::subscribers(&mut conn, key).await
    }

    async fn count_active_chats(&self, block_threshold: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT DISTINCT s.endpoint, s.chat_id
                FROM subscriptions s
                LEFT JOIN block b ON b.endpoint = s.endpoint AND b.chat_id = s.chat_id
                WHERE COALESCE(b.block, 0) <= ?
            )
            "#,
        )
        .bind(block_threshold)
        .fetch_one(self.store.read_pool())
        .await?;
        Ok(count)
    }
}

/// Transactional operations for subscriptions.
///
/// These methods operate within an existing transaction and do NOT commit.
pub struct SubscriptionTxOps;

impl SubscriptionTxOps {
    /// Confirmed subscribers of `key` joined with preferences and block counters.
    ///
    /// A subscriber without a `users` row gets offline notifications; one
    /// without a `block` row has a counter of 0.
    pub async fn subscribers(
        tx: &mut SqliteConnection,
        key: &EntityKey,
    ) -> Result<Vec<SubscriberDbModel>> {
        let rows = sqlx::query_as::<_, SubscriberDbModel>(
            r#"
            SELECT s.endpoint AS endpoint,
                   s.chat_id AS chat_id,
                   COALESCE(u.offline_notifications, 1) AS offline_notifications,
                   COALESCE(b.block, 0) AS block
            FROM subscriptions s
            LEFT JOIN users u ON u.endpoint = s.endpoint AND u.chat_id = s.chat_id
            LEFT JOIN block b ON b.endpoint = s.endpoint AND b.chat_id = s.chat_id
            WHERE s.site = ? AND s.entity_id = ? AND s.confirmed = 1
            ORDER BY s.endpoint, s.chat_id
            "#,
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .fetch_all(tx)
        .await?;
        Ok(rows)
    }

    /// Delete every subscription to `key`, returning the deleted rows.
    pub async fn delete_for_entity(
        tx: &mut SqliteConnection,
        key: &EntityKey,
    ) -> Result<Vec<SubscriptionDbModel>> {
        let mut rows = sqlx::query_as::<_, SubscriptionDbModel>(
            "DELETE FROM subscriptions WHERE site = ? AND entity_id = ? RETURNING *",
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .fetch_all(tx)
        .await?;
        rows.sort_by(|a, b| (&a.endpoint, a.chat_id).cmp(&(&b.endpoint, b.chat_id)));
        Ok(rows)
    }

    /// Mark every subscription to `key` as confirmed.
    pub async fn confirm(tx: &mut SqliteConnection, key: &EntityKey) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE subscriptions SET confirmed = 1 WHERE site = ? AND entity_id = ? AND confirmed = 0",
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .execute(tx)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{BlockRepository, SqlxBlockRepository};

    #[tokio::test]
    async fn test_subscribe_is_idempotent_and_starts_unconfirmed() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxSubscriptionRepository::new(store);
        let key = EntityKey::new("site", "a");

        assert!(repo.subscribe("telegram", 1, &key).await.unwrap());
        assert!(!repo.subscribe("telegram", 1, &key).await.unwrap());

        let subs = repo.list_for_chat("telegram", 1).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert!(!subs[0].confirmed);
        assert_eq!(repo.unconfirmed_entity_ids("site").await.unwrap(), vec!["a"]);
        assert!(repo.confirmed_entity_ids("site").await.unwrap().is_empty());

        assert_eq!(repo.confirm(&key).await.unwrap(), 1);
        assert_eq!(repo.confirmed_entity_ids("site").await.unwrap(), vec!["a"]);
        assert!(repo.unconfirmed_entity_ids("site").await.unwrap().is_empty());

        assert!(repo.unsubscribe("telegram", 1, &key).await.unwrap());
        assert!(!repo.unsubscribe("telegram", 1, &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribers_join_preferences_and_block() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxSubscriptionRepository::new(store.clone());
        let blocks = SqlxBlockRepository::new(store.clone());
        let key = EntityKey::new("site", "a");

        repo.subscribe("telegram", 1, &key).await.unwrap();
        repo.subscribe("telegram", 2, &key).await.unwrap();
        repo.subscribe("telegram", 3, &key).await.unwrap();
        repo.confirm(&key).await.unwrap();
        repo.set_offline_notifications("telegram", 2, false)
            .await
            .unwrap();
        blocks.increment_block("telegram", 3).await.unwrap();

        let subscribers = repo.subscribers(&key).await.unwrap();
        assert_eq!(
            subscribers,
            vec![
                SubscriberDbModel {
                    endpoint: "telegram".to_string(),
                    chat_id: 1,
                    offline_notifications: true,
                    block: 0,
                },
                SubscriberDbModel {
                    endpoint: "telegram".to_string(),
                    chat_id: 2,
                    offline_notifications: false,
                    block: 0,
                },
                SubscriberDbModel {
                    endpoint: "telegram".to_string(),
                    chat_id: 3,
                    offline_notifications: true,
                    block: 1,
                },
            ]
        );

        assert_eq!(repo.count_active_chats(0).await.unwrap(), 2);
        assert_eq!(repo.count_active_chats(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_for_entity_returns_prior_subscribers() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxSubscriptionRepository::new(store.clone());
        let key = EntityKey::new("site", "a");
        repo.subscribe("telegram", 2, &key).await.unwrap();
        repo.subscribe("telegram", 1, &key).await.unwrap();

        let mut tx = store.begin_immediate().await.unwrap();
        let removed = SubscriptionTxOps::delete_for_entity(&mut tx, &key)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let chats: Vec<_> = removed.iter().map(|s| s.chat_id).collect();
        assert_eq!(chats, vec![1, 2]);
        assert!(repo.list_for_chat("telegram", 1).await.unwrap().is_empty());
    }
}
