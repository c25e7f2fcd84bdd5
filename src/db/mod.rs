//! SQLite trade journal.
//!
//! Stores:
//! - Every copy decision (copied, skipped or failed) with its sizing inputs
//! - Session runs and their final counters
//!
//! Journal writes are best-effort from the pipeline's point of view; callers
//! log failures and carry on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::session::SessionStats;

/// Database connection pool for the journal.
pub struct Database {
    pool: SqlitePool,
}

/// One decision to persist.
#[derive(Debug, Clone)]
pub struct CopyTradeRecord {
    pub source_event_id: String,
    pub market_id: String,
    pub market_title: String,
    pub side: String,
    pub outcome_index: i64,
    pub classification: String,
    pub conviction: i64,
    pub target_price: Decimal,
    pub target_notional: Decimal,
    pub size: Decimal,
    pub fill_price: Option<Decimal>,
    pub filled_shares: Decimal,
    pub status: String,
    pub reason: String,
    pub order_id: Option<String>,
    pub paper: bool,
    pub detected_at: DateTime<Utc>,
}

/// Stored copy trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredCopyTrade {
    pub id: String,
    pub source_event_id: String,
    pub market_id: String,
    pub market_title: String,
    pub side: String,
    pub outcome_index: i64,
    pub classification: String,
    pub conviction: i64,
    pub target_price: f64,
    pub target_notional: f64,
    pub size: f64,
    pub fill_price: Option<f64>,
    pub filled_shares: f64,
    pub status: String,
    pub reason: String,
    pub order_id: Option<String>,
    pub paper: bool,
    pub detected_at: String,
    pub recorded_at: String,
}

/// Stored session row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSession {
    pub id: i64,
    pub target_wallet: String,
    pub paper: bool,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub detected: i64,
    pub copied: i64,
    pub skipped: i64,
    pub failed: i64,
    pub error_message: Option<String>,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Database {
    /// Open (and migrate) the journal at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Private in-memory journal. Single connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_trades (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                market_title TEXT NOT NULL DEFAULT '',
                side TEXT NOT NULL,
                outcome_index INTEGER NOT NULL,
                classification TEXT NOT NULL,
                conviction INTEGER NOT NULL DEFAULT 0,
                target_price REAL NOT NULL,
                target_notional REAL NOT NULL,
                size REAL NOT NULL DEFAULT 0,
                fill_price REAL,
                filled_shares REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                order_id TEXT,
                paper INTEGER NOT NULL DEFAULT 1,
                detected_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_wallet TEXT NOT NULL,
                paper INTEGER NOT NULL,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                stopped_at TEXT,
                detected INTEGER NOT NULL DEFAULT 0,
                copied INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_trades_status ON copy_trades(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_trades_market ON copy_trades(market_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Copy Trades ====================

    /// Persist one decision. Returns the row id.
    pub async fn record_copy_trade(&self, record: &CopyTradeRecord) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO copy_trades (
                id, source_event_id, market_id, market_title, side, outcome_index,
                classification, conviction, target_price, target_notional, size,
                fill_price, filled_shares, status, reason, order_id, paper, detected_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&record.source_event_id)
        .bind(&record.market_id)
        .bind(&record.market_title)
        .bind(&record.side)
        .bind(record.outcome_index)
        .bind(&record.classification)
        .bind(record.conviction)
        .bind(to_f64(record.target_price))
        .bind(to_f64(record.target_notional))
        .bind(to_f64(record.size))
        .bind(record.fill_price.map(to_f64))
        .bind(to_f64(record.filled_shares))
        .bind(&record.status)
        .bind(&record.reason)
        .bind(&record.order_id)
        .bind(record.paper)
        .bind(record.detected_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to record copy trade")?;

        Ok(id)
    }

    /// Most recent decisions first.
    pub async fn recent_copy_trades(&self, limit: i64) -> Result<Vec<StoredCopyTrade>> {
        sqlx::query_as::<_, StoredCopyTrade>(
            "SELECT * FROM copy_trades ORDER BY detected_at DESC, recorded_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch copy trades")
    }

    /// Row count per status.
    pub async fn copy_trade_counts(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as("SELECT status, COUNT(*) FROM copy_trades GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await
            .context("Failed to count copy trades")
    }

    // ==================== Sessions ====================

    /// Open a session row. Returns its id.
    pub async fn start_session(&self, target_wallet: &str, paper: bool) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO sessions (target_wallet, paper, started_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(target_wallet)
        .bind(paper)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .context("Failed to start session")?;

        Ok(id)
    }

    /// Close a session row with its final counters.
    pub async fn finish_session(&self, id: i64, stats: &SessionStats, error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                stopped_at = ?,
                detected = ?,
                copied = ?,
                skipped = ?,
                failed = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(stats.detected as i64)
        .bind(stats.copied as i64)
        .bind(stats.skipped as i64)
        .bind(stats.failed as i64)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to finish session")?;

        Ok(())
    }

    pub async fn recent_sessions(&self, limit: i64) -> Result<Vec<StoredSession>> {
        sqlx::query_as::<_, StoredSession>("SELECT * FROM sessions ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch sessions")
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
