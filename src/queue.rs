//! Durable at-least-once work queue backed by Postgres.
//!
//! Delivery model: `read_batch` claims messages by advancing their visibility
//! timestamp under `FOR UPDATE SKIP LOCKED`, so concurrent workers never claim
//! the same message twice while it is invisible. A claimed message that is not
//! acked reappears after the visibility timeout with an incremented read
//! count; messages whose read count exhausts the retry budget are moved to a
//! dead letter table instead of being redelivered forever. Duplicate delivery
//! is possible by design and downstream writes are idempotent.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::error::{PipelineError, Result};

/// A claimed message. Holding one does not guarantee exclusivity forever:
/// processing must finish (and ack) before the visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct QueueMessage<T> {
    pub msg_id: i64,
    /// Number of times this message has been claimed, including this claim.
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> QueueMessage<T> {
    /// True once the retry budget is spent; the caller dead-letters instead
    /// of processing again. `read_ct` counts the current claim, so a budget
    /// of 3 allows three full processing attempts.
    pub fn exhausted(&self, max_attempts: i32) -> bool {
        self.read_ct > max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct DurableQueue<T> {
    pool: PgPool,
    name: String,
    config: QueueConfig,
    _payload: PhantomData<fn() -> T>,
}

impl<T> DurableQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(pool: PgPool, name: &str, config: QueueConfig) -> Result<Self> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(PipelineError::Queue(format!(
                "invalid queue name: {name:?} (lowercase ascii, digits and underscores only)"
            )));
        }
        Ok(Self {
            pool,
            name: name.to_string(),
            config,
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> String {
        format!("queue_{}", self.name)
    }

    fn dlq_table(&self) -> String {
        format!("queue_{}_dead", self.name)
    }

    /// Idempotent table setup for this queue and its dead letter companion.
    pub async fn ensure(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                msg_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                payload JSONB NOT NULL,
                read_ct INT NOT NULL DEFAULT 0,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                vt TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = self.table()
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        let idx = format!(
            "CREATE INDEX IF NOT EXISTS {table}_vt_idx ON {table} (vt, msg_id)",
            table = self.table()
        );
        sqlx::query(&idx).execute(&self.pool).await?;

        let dlq = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                msg_id BIGINT PRIMARY KEY,
                payload JSONB NOT NULL,
                read_ct INT NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL,
                dead_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                reason TEXT NOT NULL
            )
            "#,
            table = self.dlq_table()
        );
        sqlx::query(&dlq).execute(&self.pool).await?;

        info!(queue = %self.name, "Queue tables ensured");
        Ok(())
    }

    /// Enqueue one message, visible immediately.
    pub async fn send(&self, payload: &T) -> Result<i64> {
        let json = serde_json::to_value(payload)?;
        let sql = format!(
            "INSERT INTO {table} (payload) VALUES ($1) RETURNING msg_id",
            table = self.table()
        );
        let row = sqlx::query(&sql).bind(json).fetch_one(&self.pool).await?;
        Ok(row.try_get("msg_id")?)
    }

    /// Claim up to `batch_size` visible messages, making them invisible for
    /// the visibility timeout and bumping their read count.
    pub async fn read_batch(&self) -> Result<Vec<QueueMessage<T>>> {
        let sql = format!(
            r#"
            UPDATE {table} SET
                vt = NOW() + make_interval(secs => $1),
                read_ct = read_ct + 1
            WHERE msg_id IN (
                SELECT msg_id FROM {table}
                WHERE vt <= NOW()
                ORDER BY msg_id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING msg_id, read_ct, enqueued_at, payload
            "#,
            table = self.table()
        );

        let rows = sqlx::query(&sql)
            .bind(self.config.visibility_timeout_seconds as f64)
            .bind(self.config.batch_size)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let payload: serde_json::Value = row.try_get("payload")?;
                Ok(QueueMessage {
                    msg_id: row.try_get("msg_id")?,
                    read_ct: row.try_get("read_ct")?,
                    enqueued_at: row.try_get("enqueued_at")?,
                    payload: serde_json::from_value(payload)?,
                })
            })
            .collect()
    }

    /// Ack: permanently removes the message. Only called after the downstream
    /// write committed.
    pub async fn delete(&self, msg_id: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {table} WHERE msg_id = $1",
            table = self.table()
        );
        sqlx::query(&sql).bind(msg_id).execute(&self.pool).await?;
        Ok(())
    }

    /// Move an exhausted message to the dead letter table atomically.
    pub async fn dead_letter(&self, message: &QueueMessage<T>, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            r#"
            INSERT INTO {dlq} (msg_id, payload, read_ct, enqueued_at, reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (msg_id) DO NOTHING
            "#,
            dlq = self.dlq_table()
        );
        sqlx::query(&insert)
            .bind(message.msg_id)
            .bind(serde_json::to_value(&message.payload)?)
            .bind(message.read_ct)
            .bind(message.enqueued_at)
            .bind(reason)
            .execute(&mut *tx)
            .await?;

        let delete = format!(
            "DELETE FROM {table} WHERE msg_id = $1",
            table = self.table()
        );
        sqlx::query(&delete)
            .bind(message.msg_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        warn!(
            queue = %self.name,
            msg_id = message.msg_id,
            read_ct = message.read_ct,
            reason,
            "Dead-lettered message"
        );
        Ok(())
    }

    pub async fn depth(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {table}", table = self.table());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    pub async fn dead_letter_depth(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {table}", table = self.dlq_table());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RawEntityRef;

    fn queue(name: &str) -> Result<DurableQueue<RawEntityRef>> {
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        DurableQueue::new(pool, name, QueueConfig::default())
    }

    #[tokio::test]
    async fn accepts_well_formed_names() {
        assert!(queue("memory_summaries").is_ok());
        assert!(queue("code_2").is_ok());
    }

    #[tokio::test]
    async fn rejects_hostile_names() {
        assert!(queue("").is_err());
        assert!(queue("drop table").is_err());
        assert!(queue("q; --").is_err());
        assert!(queue("Memories").is_err());
    }

    #[test]
    fn exhaustion_tracks_read_count() {
        let msg = QueueMessage {
            msg_id: 1,
            read_ct: 2,
            enqueued_at: Utc::now(),
            payload: (),
        };
        assert!(!msg.exhausted(3));
        // Third claim is still within budget; the fourth is not.
        let msg = QueueMessage { read_ct: 3, ..msg };
        assert!(!msg.exhausted(3));
        let msg = QueueMessage { read_ct: 4, ..msg };
        assert!(msg.exhausted(3));
    }
}
