//! Database module for livewatch.
//!
//! This module provides the persistence layer using SQLite with sqlx.
//! All mutations go through a dedicated write pool holding a single
//! connection, so the store has exactly one writer at any time.

pub mod maintenance;
pub mod models;
pub mod repositories;
pub mod time;

pub use maintenance::{MaintenanceConfig, MaintenanceScheduler};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// Default read pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        // WAL lets the read pool keep going while the writer holds its lock
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true))
}

async fn ensure_wal_mode(pool: &DbPool, pool_name: &str) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        tracing::warn!(
            "{}_journal_mode was '{}', expected 'wal'; re-setting",
            pool_name,
            mode
        );
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Initialize the read pool.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:livewatch.db?mode=rwc")
/// * `max_connections` - Maximum number of connections in the pool
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "read_pool").await?;

    tracing::info!(
        "Database pool initialized with WAL mode, {} max connections",
        max_connections
    );

    Ok(pool)
}

/// Initialize the read pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, DEFAULT_POOL_SIZE).await
}

/// Initialize the serialized write pool with `max_connections = 1`.
///
/// Every mutation (raw updates, promotions, claims, block counters) goes
/// through this pool, so only one connection ever attempts to take the SQLite
/// write lock.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "write_pool").await?;

    tracing::info!("Write pool initialized with 1 max connection (serialized writes)");

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> crate::Result<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Handle to the durable store: a read pool plus the single-writer pool.
#[derive(Clone, Debug)]
pub struct Store {
    read: DbPool,
    write: WritePool,
}

impl Store {
    pub fn new(read: DbPool, write: WritePool) -> Self {
        Self { read, write }
    }

    /// Open both pools for `database_url` and run migrations.
    pub async fn open(database_url: &str) -> crate::Result<Self> {
        let write = init_write_pool(database_url).await?;
        run_migrations(&write).await?;
        let read = init_pool(database_url).await?;
        Ok(Self::new(read, write))
    }

    /// A private in-memory store, migrated and ready to use.
    ///
    /// Reads and writes share one connection; the pool never recycles it, since
    /// an in-memory database lives exactly as long as its connection.
    pub async fn in_memory() -> crate::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool.clone(), pool))
    }

    pub fn read_pool(&self) -> &DbPool {
        &self.read
    }

    pub fn write_pool(&self) -> &WritePool {
        &self.write
    }

    /// Begin a `BEGIN IMMEDIATE` transaction on the write connection.
    pub async fn begin_immediate(&self) -> crate::Result<ImmediateTransaction> {
        Ok(begin_immediate(&self.write).await?)
    }
}

pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Wrapper for a manual immediate transaction.
///
/// The write lock is taken at `BEGIN`, so a promotion or claim never has to
/// upgrade a read lock halfway through. Dropping an unfinished transaction
/// closes the connection, which rolls it back.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
