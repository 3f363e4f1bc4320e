//! History store and latest-value cache backends
//!
//! History rows go to SQLite in multi-row inserts; the latest value of
//! every point is mirrored into Redis hashes for cheap reads by other
//! services. Both sit behind traits so the batch writer can be tested
//! against in-memory doubles.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::error::{Result, TelSrvError};
use crate::model::ParsedFrameResult;

/// Durable sink for decoded telemetry
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a batch in one statement
    async fn insert_batch(&self, rows: &[ParsedFrameResult]) -> Result<()>;

    /// Insert a single row; the fallback path when a batch fails
    async fn insert_one(&self, row: &ParsedFrameResult) -> Result<()>;
}

/// Latest-value mirror keyed by device
#[async_trait]
pub trait ValueCache: Send + Sync {
    async fn publish(&self, row: &ParsedFrameResult) -> Result<()>;
}

/// SQLite-backed history store
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{db_path}?mode=rwc"))
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL,
                link_id INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                function TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_device_ts ON history (device_id, ts)",
        )
        .execute(&self.pool)
        .await?;
        info!("history schema ready");
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn insert_batch(&self, rows: &[ParsedFrameResult]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut payloads = Vec::with_capacity(rows.len());
        for row in rows {
            payloads.push(row.payload_json()?);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO history (device_id, link_id, protocol, function, payload, ts) ",
        );
        builder.push_values(rows.iter().zip(payloads), |mut b, (row, payload)| {
            b.push_bind(row.device_id)
                .push_bind(row.link_id)
                .push_bind(row.protocol.as_str())
                .push_bind(&row.function)
                .push_bind(payload)
                .push_bind(row.timestamp.to_rfc3339());
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_one(&self, row: &ParsedFrameResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO history (device_id, link_id, protocol, function, payload, ts) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(row.device_id)
        .bind(row.link_id)
        .bind(row.protocol.as_str())
        .bind(&row.function)
        .bind(row.payload_json()?)
        .bind(row.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Redis-backed latest-value cache.
///
/// Every point lands in `device:{id}:latest` as a JSON field, plus a
/// `_ts` field carrying the decode timestamp.
pub struct RedisValueCache {
    conn: ConnectionManager,
}

impl RedisValueCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| TelSrvError::CacheError(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        info!("redis value cache connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl ValueCache for RedisValueCache {
    async fn publish(&self, row: &ParsedFrameResult) -> Result<()> {
        let key = format!("device:{}:latest", row.device_id);
        let mut fields: Vec<(String, String)> = Vec::with_capacity(row.points.len() + 1);
        for (name, point) in &row.points {
            fields.push((name.clone(), serde_json::to_string(point)?));
        }
        fields.push(("_ts".to_string(), row.timestamp.to_rfc3339()));

        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, &fields).await?;
        Ok(())
    }
}
