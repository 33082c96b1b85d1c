//! Per-chat delivery failure counters.
//!
//! The counter goes up every time an endpoint reports that a chat blocked
//! the bot and is reset on the next successful delivery.

use async_trait::async_trait;

use crate::Result;
use crate::database::Store;

#[async_trait]
pub trait BlockRepository: Send + Sync {
    async fn get_block(&self, endpoint: &str, chat_id: i64) -> Result<i64>;
    async fn increment_block(&self, endpoint: &str, chat_id: i64) -> Result<i64>;
    async fn reset_block(&self, endpoint: &str, chat_id: i64) -> Result<()>;
}

pub struct SqlxBlockRepository {
    store: Store,
}

impl SqlxBlockRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockRepository for SqlxBlockRepository {
    async fn get_block(&self, endpoint: &str, chat_id: i64) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT block FROM block WHERE endpoint = ? AND chat_id = ?")
                .bind(endpoint)
                .bind(chat_id)
                .fetch_optional(self.store.read_pool())
                .await?;
        Ok(row.map(|(block,)| block).unwrap_or(0))
    }

    async fn increment_block(&self, endpoint: &str, chat_id: i64) -> Result<i64> {
        let (block,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO block (endpoint, chat_id, block) VALUES (?, ?, 1)
            ON CONFLICT (endpoint, chat_id) DO UPDATE SET block = block + 1
            RETURNING block
            "#,
        )
        .bind(endpoint)
        .bind(chat_id)
        .fetch_one(self.store.write_pool())
        .await?;
        Ok(block)
    }

    async fn reset_block(&self, endpoint: &str, chat_id: i64) -> Result<()> {
        sqlx::query("UPDATE block SET block = 0 WHERE endpoint = ? AND chat_id = ? AND block != 0")
            .bind(endpoint)
            .bind(chat_id)
            .execute(self.store.write_pool())
            .await?;
        Ok(())
    }
}
