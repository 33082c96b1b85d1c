//! Tracked entity repository.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection};

use crate::database::Store;
use crate::database::models::EntityDbModel;
use crate::domain::{EntityKey, StatusKind};
use crate::{Error, Result};

/// Read-side and administrative entity operations.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn get_entity(&self, key: &EntityKey) -> Result<EntityDbModel>;
    async fn find_entity(&self, key: &EntityKey) -> Result<Option<EntityDbModel>>;
    async fn list_site_entities(&self, site: &str) -> Result<Vec<EntityDbModel>>;
    /// Latest raw status of every entity on `site` that is neither offline
    /// nor unknown; the diff engine's startup snapshot.
    async fn raw_statuses(&self, site: &str) -> Result<HashMap<String, StatusKind>>;
    async fn list_special_ids(&self, site: &str) -> Result<Vec<String>>;
    async fn set_special(&self, key: &EntityKey, special: bool) -> Result<()>;
    /// Delete entities nobody subscribes to, that are not special and not
    /// online (raw or confirmed). Returns the number of deleted rows.
    async fn delete_orphans(&self) -> Result<u64>;
}

/// SQLx implementation of EntityRepository.
pub struct SqlxEntityRepository {
    store: Store,
}

impl SqlxEntityRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntityRepository for SqlxEntityRepository {
    async fn get_entity(&self, key: &EntityKey) -> Result<EntityDbModel> {
        self.find_entity(key)
            .await?
            .ok_or_else(|| Error::not_found("Entity", key.to_string()))
    }

    async fn find_entity(&self, key: &EntityKey) -> Result<Option<EntityDbModel>> {
        let entity = sqlx::query_as::<_, EntityDbModel>(
            "SELECT * FROM entities WHERE site = ? AND entity_id = ?",
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .fetch_optional(self.store.read_pool())
        .await?;
        Ok(entity)
    }

    async fn list_site_entities(&self, site: &str) -> Result<Vec<EntityDbModel>> {
        let entities = sqlx::query_as::<_, EntityDbModel>(
            "SELECT * FROM entities WHERE site = ? ORDER BY entity_id",
        )
        .bind(site)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(entities)
    }

    async fn raw_statuses(&self, site: &str) -> Result<HashMap<String, StatusKind>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT entity_id, unconfirmed_status FROM entities
            WHERE site = ? AND unconfirmed_status NOT IN ('offline', 'unknown')
            "#,
        )
        .bind(site)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, status)| StatusKind::parse(&status).map(|s| (id, s)))
            .collect())
    }

    async fn list_special_ids(&self, site: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT entity_id FROM entities WHERE site = ? AND special = 1 ORDER BY entity_id",
        )
        .bind(site)
        .fetch_all(self.store.read_pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_special(&self, key: &EntityKey, special: bool) -> Result<()> {
        let mut conn = self.store.write_pool().acquire().await?;
        EntityTxOps::ensure_entity(&mut *conn, key, crate::database::time::now_ms()).await?;
        sqlx::query("UPDATE entities SET special = ? WHERE site = ? AND entity_id = ?")
            .bind(special)
            .bind(&key.site)
            .bind(&key.entity_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM entities
            WHERE special = 0
              AND confirmed_status != 'online'
              AND unconfirmed_status != 'online'
              AND NOT EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.site = entities.site AND s.entity_id = entities.entity_id
              )
            "#,
        )
        .execute(self.store.write_pool())
        .await?;
        Ok(result.rows_affected())
    }
}

/// Outcome of recording one raw observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawUpdate {
    /// The raw status changed and a log row must be appended.
    pub changed: bool,
    /// Consecutive not-found observations after this one.
    pub not_found_count: i64,
}

/// A row promoted by the confirmation statement.
#[derive(Debug, Clone)]
pub struct PromotedRow {
    pub site: String,
    pub entity_id: String,
    pub confirmed_status: String,
    pub unconfirmed_timestamp: i64,
    pub prev_unconfirmed_status: String,
    pub prev_unconfirmed_timestamp: i64,
    pub image_url: Option<String>,
}

/// Debounce windows in milliseconds, as bound into the promotion statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionWindows {
    pub online_ms: i64,
    pub offline_ms: i64,
    pub not_found_ms: i64,
    pub denied_ms: i64,
}

/// Transactional operations for entities.
///
/// These methods operate within an existing transaction and do NOT commit.
/// The caller is responsible for committing or rolling back the transaction.
pub struct EntityTxOps;

impl EntityTxOps {
    /// Create the entity row if it does not exist yet.
    pub async fn ensure_entity(
        tx: &mut SqliteConnection,
        key: &EntityKey,
        now_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (site, entity_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (site, entity_id) DO NOTHING
            "#,
        )
        .bind(&key.site)
        .bind(&key.entity_id)
        .bind(now_ms)
        .execute(tx)
        .await?;
        Ok(())
    }

    /// Record a raw observation.
    ///
    /// The current raw status shifts into the `prev_*` columns only when the
    /// new status differs; an unchanged status keeps its original timestamp.
    /// The not-found counter is bumped on `NotFound` and reset otherwise.
    pub async fn record_raw_status(
        tx: &mut SqliteConnection,
        key: &EntityKey,
        status: StatusKind,
        observed_at_ms: i64,
    ) -> Result<RawUpdate> {
        Self::ensure_entity(&mut *tx, key, observed_at_ms).await?;

        let shifted = sqlx::query(
            r#"
            UPDATE entities
            SET prev_unconfirmed_status = unconfirmed_status,
                prev_unconfirmed_timestamp = unconfirmed_timestamp,
                unconfirmed_status = ?1,
                unconfirmed_timestamp = ?2
            WHERE site = ?3 AND entity_id = ?4 AND unconfirmed_status != ?1
            "#,
        )
        .bind(status.as_str())
        .bind(observed_at_ms)
        .bind(&key.site)
        .bind(&key.entity_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE entities
            SET not_found_count = CASE WHEN ?1 = 'not_found' THEN not_found_count + 1 ELSE 0 END
            WHERE site = ?2 AND entity_id = ?3
            RETURNING not_found_count
            "#,
        )
        .bind(status.as_str())
        .bind(&key.site)
        .bind(&key.entity_id)
        .fetch_one(&mut *tx)
        .await?;

        Ok(RawUpdate {
            changed: shifted.rows_affected() == 1,
            not_found_count: row.get("not_found_count"),
        })
    }

    /// Remember the latest image reported for an entity.
    pub async fn update_image(
        tx: &mut SqliteConnection,
        key: &EntityKey,
        image_url: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE entities SET image_url = ? WHERE site = ? AND entity_id = ?")
            .bind(image_url)
            .bind(&key.site)
            .bind(&key.entity_id)
            .execute(tx)
            .await?;
        Ok(())
    }

    pub async fn reset_not_found(tx: &mut SqliteConnection, key: &EntityKey) -> Result<()> {
        sqlx::query("UPDATE entities SET not_found_count = 0 WHERE site = ? AND entity_id = ?")
            .bind(&key.site)
            .bind(&key.entity_id)
            .execute(tx)
            .await?;
        Ok(())
    }

    /// Promote every entity whose raw status has outlasted its window.
    ///
    /// One statement: disagreement test, window test and the write happen
    /// atomically against freshly read raw columns. `unknown` settles to
    /// offline immediately, `ambiguous` never settles.
    pub async fn promote_due(
        tx: &mut SqliteConnection,
        now_ms: i64,
        windows: PromotionWindows,
    ) -> Result<Vec<PromotedRow>> {
        let rows = sqlx::query(
            r#"
            UPDATE entities
            SET confirmed_status = CASE
                WHEN unconfirmed_status = 'online' THEN 'online'
                ELSE 'offline'
            END
            WHERE (
                unconfirmed_status = 'online'
                AND confirmed_status != 'online'
                AND ?1 - unconfirmed_timestamp >= ?2
            ) OR (
                confirmed_status = 'online'
                AND (
                    unconfirmed_status = 'unknown'
                    OR (unconfirmed_status = 'offline' AND ?1 - unconfirmed_timestamp >= ?3)
                    OR (unconfirmed_status = 'not_found' AND ?1 - unconfirmed_timestamp >= ?4)
                    OR (unconfirmed_status = 'denied' AND ?1 - unconfirmed_timestamp >= ?5)
                )
            )
            RETURNING site, entity_id, confirmed_status, unconfirmed_timestamp,
                      prev_unconfirmed_status, prev_unconfirmed_timestamp, image_url
            "#,
        )
        .bind(now_ms)
        .bind(windows.online_ms)
        .bind(windows.offline_ms)
        .bind(windows.not_found_ms)
        .bind(windows.denied_ms)
        .fetch_all(tx)
        .await?;

        let mut promoted: Vec<PromotedRow> = rows
            .into_iter()
            .map(|row| PromotedRow {
                site: row.get("site"),
                entity_id: row.get("entity_id"),
                confirmed_status: row.get("confirmed_status"),
                unconfirmed_timestamp: row.get("unconfirmed_timestamp"),
                prev_unconfirmed_status: row.get("prev_unconfirmed_status"),
                prev_unconfirmed_timestamp: row.get("prev_unconfirmed_timestamp"),
                image_url: row.get("image_url"),
            })
            .collect();
        promoted.sort_by(|a, b| (&a.site, &a.entity_id).cmp(&(&b.site, &b.entity_id)));

        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> EntityKey {
        EntityKey::new("site", id)
    }

    #[tokio::test]
    async fn test_record_raw_status_shifts_history_only_on_change() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxEntityRepository::new(store.clone());

        let mut tx = store.begin_immediate().await.unwrap();
        let first = EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::Online, 1_000)
            .await
            .unwrap();
        let same = EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::Online, 5_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(first.changed);
        assert!(!same.changed);

        let entity = repo.get_entity(&key("a")).await.unwrap();
        assert_eq!(entity.unconfirmed(), StatusKind::Online);
        assert_eq!(entity.unconfirmed_timestamp, 1_000);
        assert_eq!(entity.prev_unconfirmed(), StatusKind::Unknown);

        let mut tx = store.begin_immediate().await.unwrap();
        EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::Offline, 9_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let entity = repo.get_entity(&key("a")).await.unwrap();
        assert_eq!(entity.unconfirmed(), StatusKind::Offline);
        assert_eq!(entity.unconfirmed_timestamp, 9_000);
        assert_eq!(entity.prev_unconfirmed(), StatusKind::Online);
        assert_eq!(entity.prev_unconfirmed_timestamp, 1_000);
    }

    #[tokio::test]
    async fn test_not_found_counter_resets_on_other_status() {
        let store = Store::in_memory().await.unwrap();
        let mut tx = store.begin_immediate().await.unwrap();

        let a = EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::NotFound, 1)
            .await
            .unwrap();
        let b = EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::NotFound, 2)
            .await
            .unwrap();
        let c = EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::Online, 3)
            .await
            .unwrap();
        let d = EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::NotFound, 4)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(a.not_found_count, 1);
        assert_eq!(b.not_found_count, 2);
        assert_eq!(c.not_found_count, 0);
        assert_eq!(d.not_found_count, 1);
    }

    #[tokio::test]
    async fn test_raw_statuses_and_specials() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxEntityRepository::new(store.clone());

        let mut tx = store.begin_immediate().await.unwrap();
        EntityTxOps::record_raw_status(&mut tx, &key("a"), StatusKind::Online, 1)
            .await
            .unwrap();
        EntityTxOps::record_raw_status(&mut tx, &key("b"), StatusKind::Offline, 1)
            .await
            .unwrap();
        EntityTxOps::record_raw_status(&mut tx, &key("d"), StatusKind::NotFound, 1)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        repo.set_special(&key("c"), true).await.unwrap();

        let raw = repo.raw_statuses("site").await.unwrap();
        assert_eq!(
            raw,
            HashMap::from([
                ("a".to_string(), StatusKind::Online),
                ("d".to_string(), StatusKind::NotFound),
            ])
        );
        assert_eq!(repo.list_special_ids("site").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_delete_orphans_keeps_specials_and_online() {
        let store = Store::in_memory().await.unwrap();
        let repo = SqlxEntityRepository::new(store.clone());

        let mut tx = store.begin_immediate().await.unwrap();
        EntityTxOps::record_raw_status(&mut tx, &key("orphan"), StatusKind::Offline, 1)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        repo.set_special(&key("special"), true).await.unwrap();

        assert_eq!(repo.delete_orphans().await.unwrap(), 1);
        assert!(repo.find_entity(&key("orphan")).await.unwrap().is_none());
        assert!(repo.find_entity(&key("special")).await.unwrap().is_some());
    }
}
