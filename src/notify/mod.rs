//! Notification engine: persisted in-app notifications plus best-effort push.
//!
//! The persisted document is the source of truth. Push delivery never fails
//! the caller; dead tokens reported by the gateway are cleared from profiles.

mod push;

pub use push::*;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{Direction, DocumentStore, FilterOp, Query, StoreError, MAX_BATCH_WRITES};
use crate::models::{collections, Notification, User};

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastReport {
    /// Notifications newly written
    pub persisted: usize,
    pub persist_failed: usize,
    pub pushed: usize,
    pub push_failed: usize,
}

#[derive(Clone)]
pub struct NotificationEngine {
    store: DocumentStore,
    push: Arc<dyn PushSender>,
}

impl NotificationEngine {
    pub fn new(store: DocumentStore, push: Arc<dyn PushSender>) -> Self {
        Self { store, push }
    }

    /// Persist one notification (insert-if-absent) and push it to the recipient.
    ///
    /// An empty id gets a generated one. Returns whether it was newly written;
    /// a replay of an existing id pushes nothing.
    pub async fn send(&self, mut notification: Notification) -> Result<bool, StoreError> {
        if notification.id.is_empty() {
            notification.id = uuid::Uuid::new_v4().to_string();
        }
        if !self.persist(&notification).await? {
            tracing::debug!(id = %notification.id, "notification already delivered");
            return Ok(false);
        }

        if let Some(token) = self.push_token(&notification.user_id).await {
            let recipients = vec![(notification.user_id.clone(), token)];
            self.deliver(&recipients, &notification).await;
        }
        Ok(true)
    }

    /// Persist `template` for every user as `{id_prefix}_{userId}` and push to
    /// the recipients whose notification was newly written.
    ///
    /// Each recipient stands alone: a failed write or an unreadable profile is
    /// logged and counted, and the rest of the fan-out carries on.
    pub async fn send_multicast(
        &self,
        user_ids: &[String],
        template: &Notification,
        id_prefix: &str,
    ) -> MulticastReport {
        let mut report = MulticastReport::default();
        for chunk in user_ids.chunks(MAX_BATCH_WRITES) {
            let mut recipients = Vec::new();
            for user_id in chunk {
                let mut notification = template.clone();
                notification.id = format!("{}_{}", id_prefix, user_id);
                notification.user_id = user_id.clone();
                match self.persist(&notification).await {
                    Ok(true) => report.persisted += 1,
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, id = %notification.id, error = %e, "failed to persist notification");
                        report.persist_failed += 1;
                        continue;
                    }
                }
                if let Some(token) = self.push_token(user_id).await {
                    recipients.push((user_id.clone(), token));
                }
            }
            let (pushed, failed) = self.deliver(&recipients, template).await;
            report.pushed += pushed;
            report.push_failed += failed;
        }

        tracing::info!(
            kind = template.kind.as_str(),
            recipients = user_ids.len(),
            persisted = report.persisted,
            persist_failed = report.persist_failed,
            pushed = report.pushed,
            push_failed = report.push_failed,
            "notification fan-out finished"
        );
        report
    }

    async fn persist(&self, notification: &Notification) -> Result<bool, StoreError> {
        self.store
            .create(
                collections::NOTIFICATIONS,
                &notification.id,
                serde_json::to_value(notification)?,
            )
            .await
    }

    /// The recipient's push token. Missing or unreadable profiles have none.
    async fn push_token(&self, user_id: &str) -> Option<String> {
        match self.store.find_as::<User>(collections::USERS, user_id).await {
            Ok(user) => user.as_ref().and_then(User::push_token).map(str::to_string),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "cannot resolve push token");
                None
            }
        }
    }

    /// Push to `(userId, token)` pairs. Returns `(delivered, failed)`.
    async fn deliver(&self, recipients: &[(String, String)], notification: &Notification) -> (usize, usize) {
        if recipients.is_empty() {
            return (0, 0);
        }
        let message = PushMessage {
            tokens: recipients.iter().map(|(_, token)| token.clone()).collect(),
            title: notification.title.clone(),
            body: notification.description.clone(),
            data: notification.push_data(),
        };
        let result = match self.push.send_multicast(&message).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, tokens = message.tokens.len(), "push delivery failed");
                return (0, message.tokens.len());
            }
        };

        let owners: HashMap<&str, &str> = recipients
            .iter()
            .map(|(user_id, token)| (token.as_str(), user_id.as_str()))
            .collect();
        for token in result.unregistered_tokens() {
            if let Some(user_id) = owners.get(token) {
                if let Err(e) = self.clear_token(user_id, token).await {
                    tracing::warn!(error = %e, user_id, "failed to clear unregistered push token");
                }
            }
        }
        (result.success_count, result.failures.len())
    }

    /// Forget a token, unless the profile has been given a new one meanwhile.
    async fn clear_token(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let (user_id, token) = (user_id.to_string(), token.to_string());
        self.store
            .run_tx(move |tx| {
                let (user_id, token) = (user_id.clone(), token.clone());
                Box::pin(async move {
                    let Some(mut user) = tx.find_as::<User>(collections::USERS, &user_id).await? else {
                        return Ok(());
                    };
                    if user.fcm_token.as_deref() == Some(token.as_str()) {
                        user.fcm_token = None;
                        tx.put_as(collections::USERS, &user_id, &user).await?;
                        tracing::info!(user_id = %user_id, "cleared unregistered push token");
                    }
                    Ok::<_, StoreError>(())
                })
            })
            .await
    }

    /// Mark a notification read. `None` when it does not exist or belongs to someone else.
    pub async fn mark_read(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<Option<Notification>, StoreError> {
        let (user_id, notification_id) = (user_id.to_string(), notification_id.to_string());
        self.store
            .run_tx(move |tx| {
                let (user_id, notification_id) = (user_id.clone(), notification_id.clone());
                Box::pin(async move {
                    let Some(mut notification) = tx
                        .find_as::<Notification>(collections::NOTIFICATIONS, &notification_id)
                        .await?
                    else {
                        return Ok(None);
                    };
                    if notification.user_id != user_id {
                        return Ok(None);
                    }
                    if !notification.read {
                        notification.read = true;
                        notification.read_at = Some(Utc::now());
                        tx.put_as(collections::NOTIFICATIONS, &notification_id, &notification)
                            .await?;
                    }
                    Ok::<_, StoreError>(Some(notification))
                })
            })
            .await
    }

    /// Newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut query = Query::collection(collections::NOTIFICATIONS).where_eq("userId", user_id);
        if unread_only {
            query = query.where_eq("read", false);
        }
        self.store
            .query_as(
                &query
                    .order_by("createdAt", Direction::Desc)
                    .limit(limit),
            )
            .await
    }

    /// Delete notifications created before `cutoff`. Returns how many were removed.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let query = Query::collection(collections::NOTIFICATIONS)
            .filter("createdAt", FilterOp::Lt, cutoff.timestamp_millis())
            .limit(MAX_BATCH_WRITES);
        let mut purged = 0;
        loop {
            let docs = self.store.query(&query).await?;
            if docs.is_empty() {
                break;
            }
            let mut batch = self.store.batch();
            for doc in &docs {
                batch.delete(collections::NOTIFICATIONS, &doc.id);
            }
            purged += batch.commit().await?;
        }
        Ok(purged)
    }
}
