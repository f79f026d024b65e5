//! Transactional outbox backing event delivery.
//!
//! Rows are written in the same SQLite transaction as the change they describe,
//! claimed with a lease by the dispatcher and deleted once handled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Notify;

use super::TriggerEvent;
use crate::db::StoreError;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// A claimed event ready for dispatch.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: String,
    pub seq: i64,
    /// Delivery attempts including the current one
    pub attempts: u32,
    pub event: TriggerEvent,
}

/// Handle on the `events` table.
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    wake: Arc<Notify>,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Append an event inside an open transaction. Callers wake the dispatcher after commit.
    pub(crate) async fn record(
        conn: &mut SqliteConnection,
        event: &TriggerEvent,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO events (id, kind, payload, status, attempts, available_at, created_at) VALUES (?, ?, ?, 'pending', 0, ?, ?)",
        )
        .bind(&id)
        .bind(event.label())
        .bind(serde_json::to_string(event)?)
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(id)
    }

    /// Append an event on its own and wake the dispatcher.
    pub async fn publish(&self, event: &TriggerEvent) -> Result<String, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let id = Self::record(&mut *conn, event).await?;
        self.notify();
        Ok(id)
    }

    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Wait until something is published or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }

    /// Lease up to `limit` due events. Expired leases are reclaimed.
    pub async fn claim(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let lease_until = now + lease.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            UPDATE events
            SET status = 'leased', attempts = attempts + 1, available_at = ?
            WHERE seq IN (
                SELECT seq FROM events
                WHERE status IN ('pending', 'leased') AND available_at <= ?
                ORDER BY seq
                LIMIT ?
            )
            RETURNING seq, id, payload, attempts
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            match serde_json::from_str::<TriggerEvent>(&payload) {
                Ok(event) => claimed.push(EventEnvelope {
                    id,
                    seq: row.get("seq"),
                    attempts: row.get::<i64, _>("attempts") as u32,
                    event,
                }),
                Err(e) => {
                    tracing::error!(event_id = %id, error = %e, "undecodable event parked");
                    self.park(&id, &e.to_string()).await?;
                }
            }
        }
        claimed.sort_by_key(|e| e.seq);
        Ok(claimed)
    }

    /// Acknowledge a handled event.
    pub async fn complete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a failed event for another attempt, or park it once attempts run out.
    pub async fn fail(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        max_attempts: u32,
    ) -> Result<(), StoreError> {
        if envelope.attempts >= max_attempts {
            tracing::error!(
                event_id = %envelope.id,
                attempts = envelope.attempts,
                error,
                "event exhausted its attempts"
            );
            return self.park(&envelope.id, error).await;
        }

        let retry_at = Utc::now().timestamp_millis() + backoff(envelope.attempts).as_millis() as i64;
        sqlx::query(
            "UPDATE events SET status = 'pending', available_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(retry_at)
        .bind(error)
        .bind(&envelope.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn park(&self, id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE events SET status = 'dead', last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Events still waiting for delivery (pending or leased).
    pub async fn backlog(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE status != 'dead'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn dead_letters(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE status = 'dead'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

/// Exponential backoff starting at one second, capped at five minutes.
pub fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuthEvent, AuthEventKind, AuthUser};
    use tempfile::TempDir;

    fn auth_event(uid: &str) -> TriggerEvent {
        TriggerEvent::Auth(AuthEvent {
            kind: AuthEventKind::Created,
            user: AuthUser {
                uid: uid.to_string(),
                email: String::new(),
                display_name: String::new(),
                photo_url: String::new(),
            },
        })
    }

    #[tokio::test]
    async fn test_claim_complete_and_retry() {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init_database(&dir.path().join("t.sqlite"))
            .await
            .unwrap();
        let log = EventLog::new(pool);

        log.publish(&auth_event("a")).await.unwrap();
        log.publish(&auth_event("b")).await.unwrap();

        let claimed = log.claim(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed[0].seq < claimed[1].seq);
        assert_eq!(claimed[0].attempts, 1);

        // leased rows are not handed out twice
        assert!(log.claim(10, Duration::from_secs(30)).await.unwrap().is_empty());

        log.complete(&claimed[0].id).await.unwrap();
        log.fail(&claimed[1], "boom", 1).await.unwrap();
        assert_eq!(log.backlog().await.unwrap(), 0);
        assert_eq!(log.dead_letters().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_event_is_redelivered_after_backoff() {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init_database(&dir.path().join("t.sqlite"))
            .await
            .unwrap();
        let log = EventLog::new(pool);
        log.publish(&auth_event("a")).await.unwrap();

        let first = log.claim(1, Duration::from_secs(30)).await.unwrap();
        log.fail(&first[0], "transient", 5).await.unwrap();
        assert!(log.claim(1, Duration::from_secs(30)).await.unwrap().is_empty());
        assert_eq!(log.backlog().await.unwrap(), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(40), MAX_BACKOFF);
    }
}
