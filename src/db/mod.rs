//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Ledger schema. `trades` is unique on `(stream_id, line_no)` so a
/// redelivered event inserts nothing. `users.last_stream_*` is the stream
/// entry behind the stored balance; older entries never overwrite it.
pub const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id          BIGINT PRIMARY KEY,
        balance          NUMERIC(30, 8) NOT NULL DEFAULT 0,
        last_stream_ms   BIGINT NOT NULL DEFAULT 0,
        last_stream_seq  BIGINT NOT NULL DEFAULT 0
    )"#,
    "ALTER TABLE users ADD COLUMN IF NOT EXISTS last_stream_ms BIGINT NOT NULL DEFAULT 0",
    "ALTER TABLE users ADD COLUMN IF NOT EXISTS last_stream_seq BIGINT NOT NULL DEFAULT 0",
    r#"CREATE TABLE IF NOT EXISTS positions (
        user_id        BIGINT NOT NULL,
        symbol         VARCHAR(32) NOT NULL,
        quantity       NUMERIC(30, 8) NOT NULL,
        average_price  NUMERIC(30, 8) NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (user_id, symbol)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trades (
        id              BIGSERIAL PRIMARY KEY,
        stream_id       VARCHAR(48) NOT NULL,
        line_no         INT NOT NULL,
        user_id         BIGINT NOT NULL,
        symbol          VARCHAR(32) NOT NULL,
        quantity        NUMERIC(30, 8) NOT NULL,
        executed_price  NUMERIC(30, 8) NOT NULL,
        trade_type      VARCHAR(8) NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (stream_id, line_no)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_trades_user ON trades (user_id, id DESC)",
];

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(50)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create ledger tables if missing.
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Ledger schema ready");
        Ok(())
    }
}

/// Extension trait for safe row access with logging
pub trait SafeRow {
    /// Try to get a value from a column, log error and return None if it fails
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;
}

impl SafeRow for sqlx::postgres::PgRow {
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        use sqlx::Row;
        match self.try_get(column) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("Failed to read column '{}': {}", column, e);
                None
            }
        }
    }
}
