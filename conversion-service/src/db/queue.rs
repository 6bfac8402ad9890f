//! Durable task queue operations.
//!
//! A message stays in `job_queue` until its worker acknowledges it. Claiming
//! leases the row for a bounded time and stamps a fresh token; a lease that
//! runs out without an ack makes the message claimable again, which gives
//! at-least-once delivery across worker crashes and restarts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use super::Database;
use super::models::{QueueMessage, queue_message_from_row};
use crate::error::{DatabaseError, ServiceResult};

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Database {
    /// Append a message for the given job, immediately claimable
    pub fn enqueue_message(
        &self,
        job_id: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        let now_ms = now.timestamp_millis();

        conn.execute(
            "INSERT INTO job_queue (job_id, payload, enqueued_at, available_at, deliveries) \
             VALUES (?1, ?2, ?3, ?3, 0)",
            params![job_id, payload, now_ms],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Lease the oldest claimable message, if any
    pub fn claim_next_message(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> ServiceResult<Option<QueueMessage>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;
        let now_ms = now.timestamp_millis();

        let candidate: Option<String> = tx
            .query_row(
                "SELECT job_id FROM job_queue \
                 WHERE available_at <= ?1 AND (lease_until IS NULL OR lease_until <= ?1) \
                 ORDER BY available_at ASC, enqueued_at ASC LIMIT 1",
                params![now_ms],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let token = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "UPDATE job_queue SET lease_until = ?1, lease_token = ?2, deliveries = deliveries + 1 \
             WHERE job_id = ?3",
            params![now_ms.saturating_add(millis(lease)), token, job_id],
        )
        .map_err(DatabaseError::Query)?;

        let message = tx
            .query_row(
                "SELECT job_id, payload, lease_token, deliveries FROM job_queue WHERE job_id = ?1",
                params![job_id],
                queue_message_from_row,
            )
            .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(Some(message))
    }

    /// Remove a delivered message. A stale token (the lease was lost and the
    /// message redelivered) is ignored and reported as `false`.
    pub fn ack_message(&self, job_id: &str, lease_token: &str) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "DELETE FROM job_queue WHERE job_id = ?1 AND lease_token = ?2",
                params![job_id, lease_token],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Give a leased message back, claimable again from `available_at`
    pub fn release_message(
        &self,
        job_id: &str,
        lease_token: &str,
        available_at: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE job_queue SET lease_until = NULL, lease_token = NULL, available_at = ?1 \
                 WHERE job_id = ?2 AND lease_token = ?3",
                params![available_at.timestamp_millis(), job_id, lease_token],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Delete a message nobody currently holds a live lease on
    pub fn remove_unclaimed_message(&self, job_id: &str, now: DateTime<Utc>) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "DELETE FROM job_queue \
                 WHERE job_id = ?1 AND (lease_until IS NULL OR lease_until <= ?2)",
                params![job_id, now.timestamp_millis()],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Delete a message regardless of its lease
    pub fn remove_message(&self, job_id: &str) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute("DELETE FROM job_queue WHERE job_id = ?1", params![job_id])
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Number of messages not yet acknowledged
    pub fn queue_depth(&self) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))
            .map_err(DatabaseError::Query)?;

        Ok(count as usize)
    }
}
