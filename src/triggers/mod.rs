//! Trigger dispatcher.
//!
//! Claims events from the outbox, runs them through a [`TriggerHandler`] with a
//! per-event deadline and acknowledges or reschedules each one. Delivery is
//! at-least-once, so handlers must be idempotent.

mod handlers;

pub use handlers::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobError;
use crate::config::DispatchConfig;
use crate::db::StoreError;
use crate::events::{EventEnvelope, EventLog, TriggerEvent};
use crate::thumbnails::ThumbnailError;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Thumbnail(#[from] ThumbnailError),
    #[error("trigger timed out after {0:?}")]
    Timeout(Duration),
}

/// Identity of the delivery being handled.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Stable across redeliveries of the same event
    pub event_id: String,
    pub attempt: u32,
}

impl From<&EventEnvelope> for EventContext {
    fn from(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: envelope.id.clone(),
            attempt: envelope.attempts,
        }
    }
}

#[async_trait]
pub trait TriggerHandler: Send + Sync {
    /// Returning an error schedules a redelivery.
    async fn handle(&self, ctx: &EventContext, event: &TriggerEvent) -> Result<(), TriggerError>;
}

pub struct Dispatcher {
    events: EventLog,
    handler: Arc<dyn TriggerHandler>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(events: EventLog, handler: Arc<dyn TriggerHandler>, config: DispatchConfig) -> Self {
        Self {
            events,
            handler,
            config,
        }
    }

    fn lease(&self) -> Duration {
        self.config.trigger_timeout * 2 + Duration::from_secs(5)
    }

    /// Dispatch until `shutdown` fires. In-flight events whose future is
    /// dropped by cancellation are redelivered once their lease expires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "trigger dispatcher started"
        );
        loop {
            let handled = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.dispatch_once() => result,
            };
            match handled {
                Ok(0) => {}
                Ok(_) => continue,
                Err(e) => tracing::error!(error = %e, "failed to claim events"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.events.wait(self.config.poll_interval) => {}
            }
        }
        tracing::info!("trigger dispatcher stopped");
    }

    /// Claim one batch of due events and handle it. Returns the batch size.
    pub async fn dispatch_once(&self) -> Result<usize, StoreError> {
        let batch = self
            .events
            .claim(self.config.concurrency * 4, self.lease())
            .await?;
        let claimed = batch.len();
        futures::stream::iter(batch)
            .for_each_concurrent(self.config.concurrency, |envelope| async move {
                self.process(&envelope).await;
            })
            .await;
        Ok(claimed)
    }

    /// Dispatch until nothing is due, including events produced along the way.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let handled = self.dispatch_once().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }

    async fn process(&self, envelope: &EventEnvelope) {
        let ctx = EventContext::from(envelope);
        let label = envelope.event.label();
        let outcome = match tokio::time::timeout(
            self.config.trigger_timeout,
            self.handler.handle(&ctx, &envelope.event),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TriggerError::Timeout(self.config.trigger_timeout)),
        };

        let acknowledged = match outcome {
            Ok(()) => {
                tracing::debug!(event_id = %envelope.id, event = %label, "event handled");
                self.events.complete(&envelope.id).await
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %envelope.id,
                    event = %label,
                    attempt = envelope.attempts,
                    error = %e,
                    "trigger failed"
                );
                self.events
                    .fail(envelope, &e.to_string(), self.config.max_attempts)
                    .await
            }
        };
        if let Err(e) = acknowledged {
            tracing::error!(event_id = %envelope.id, error = %e, "failed to settle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuthEvent, AuthEventKind, AuthUser};
    use crate::test_support::open_store;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TriggerHandler for Flaky {
        async fn handle(&self, _ctx: &EventContext, _event: &TriggerEvent) -> Result<(), TriggerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::not_found("users", "u1").into());
            }
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl TriggerHandler for Slow {
        async fn handle(&self, _ctx: &EventContext, _event: &TriggerEvent) -> Result<(), TriggerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            poll_interval: Duration::from_millis(20),
            concurrency: 2,
            max_attempts,
            trigger_timeout: Duration::from_millis(100),
        }
    }

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
    async fn test_successful_events_are_acknowledged() {
        let (_dir, store) = open_store().await;
        let events = store.events().clone();
        events.publish(&auth_event("u1")).await.unwrap();
        events.publish(&auth_event("u2")).await.unwrap();

        let handler = Arc::new(Flaky {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(events.clone(), handler.clone(), config(3));
        assert_eq!(dispatcher.drain().await.unwrap(), 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(events.backlog().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_rescheduled_then_parked() {
        let (_dir, store) = open_store().await;
        let events = store.events().clone();
        events.publish(&auth_event("u1")).await.unwrap();

        let handler = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(events.clone(), handler.clone(), config(1));
        dispatcher.drain().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.backlog().await.unwrap(), 0);
        assert_eq!(events.dead_letters().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_event_waits_for_backoff() {
        let (_dir, store) = open_store().await;
        let events = store.events().clone();
        events.publish(&auth_event("u1")).await.unwrap();

        let handler = Arc::new(Flaky {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(events.clone(), handler.clone(), config(5));
        dispatcher.drain().await.unwrap();
        // rescheduled, not yet due
        assert_eq!(events.backlog().await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_trigger_times_out() {
        let (_dir, store) = open_store().await;
        let events = store.events().clone();
        events.publish(&auth_event("u1")).await.unwrap();

        let dispatcher = Dispatcher::new(events.clone(), Arc::new(Slow), config(1));
        let started = std::time::Instant::now();
        dispatcher.drain().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(events.dead_letters().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let (_dir, store) = open_store().await;
        let events = store.events().clone();
        let handler = Arc::new(Flaky {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(events.clone(), handler.clone(), config(3)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        events.publish(&auth_event("u1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
