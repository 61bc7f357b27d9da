//! PostgreSQL audit store backend
//!
//! Records go to the `io_log_entries` table, created by [`PgAuditStore::initialize`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use super::AuditStore;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::recorder::{AuditLogEntry, Channel, Direction};

/// PostgreSQL-backed audit store
#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with retry and exponential backoff, then create the table
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        let store = Self::new(pool);
        store.initialize().await?;
        Ok(store)
    }

    /// Create the `io_log_entries` table and its indexes
    ///
    /// Should be called once during application startup.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS io_log_entries (
                id BIGSERIAL PRIMARY KEY,
                trace_id TEXT NOT NULL,
                source_application VARCHAR(100) NOT NULL,
                resource VARCHAR(255) NOT NULL,
                io_type VARCHAR(10) NOT NULL,
                communication_channel VARCHAR(10) NOT NULL,
                header TEXT,
                payload TEXT,
                http_status INTEGER,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create io_log_entries table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_io_log_entries_trace ON io_log_entries (trace_id, timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create io_log_entries index: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn save(&self, entry: &AuditLogEntry) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO io_log_entries (
                trace_id, source_application, resource, io_type, communication_channel,
                header, payload, http_status, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&entry.trace_id)
        .bind(&entry.source_application)
        .bind(&entry.resource)
        .bind(entry.direction.as_str())
        .bind(entry.channel.as_str())
        .bind(&entry.headers)
        .bind(&entry.payload)
        .bind(entry.status_code.map(i32::from))
        .bind(entry.timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to insert audit record: {}", e)))?;

        Ok(id)
    }

    async fn find_by_trace_id(&self, trace_id: &str) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, IoLogEntryRow>(
            "SELECT * FROM io_log_entries WHERE trace_id = $1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to query audit records: {}", e)))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Create a PostgreSQL pool, retrying with exponential backoff
async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout())
            .connect(&config.url)
            .await;

        match result {
            Ok(pool) => {
                tracing::info!(
                    "Audit store connection pool created: max={}, min={}",
                    config.max_connections,
                    config.min_connections
                );
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to audit database after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e.into());
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Audit database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
struct IoLogEntryRow {
    id: i64,
    trace_id: String,
    source_application: String,
    resource: String,
    io_type: String,
    communication_channel: String,
    header: Option<String>,
    payload: Option<String>,
    http_status: Option<i32>,
    timestamp: DateTime<Utc>,
}

impl From<IoLogEntryRow> for AuditLogEntry {
    fn from(row: IoLogEntryRow) -> Self {
        let direction = match row.io_type.as_str() {
            "OUTBOUND" => Direction::Outbound,
            _ => Direction::Inbound,
        };
        let channel = match row.communication_channel.as_str() {
            "MESSAGE" => Channel::Message,
            _ => Channel::Http,
        };

        AuditLogEntry {
            id: Some(row.id),
            trace_id: row.trace_id,
            source_application: row.source_application,
            resource: row.resource,
            direction,
            channel,
            headers: row.header,
            payload: row.payload,
            status_code: row.http_status.and_then(|s| u16::try_from(s).ok()),
            timestamp: row.timestamp,
        }
    }
}
