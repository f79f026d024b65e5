//! Notification API endpoints. Callers only ever see their own notifications.

use axum::extract::{Path, State};
use serde::Deserialize;

use super::{success, ApiResult, ValidQuery};
use crate::auth::Identity;
use crate::errors::AppError;
use crate::feed::clamp_limit;
use crate::models::Notification;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListNotificationsParams {
    /// Include already read notifications
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /notifications - Unread by default, newest first.
pub async fn list_notifications(
    State(state): State<AppState>,
    identity: Identity,
    ValidQuery(params): ValidQuery<ListNotificationsParams>,
) -> ApiResult<Vec<Notification>> {
    let notifications = state
        .notifier
        .list_for_user(&identity.uid, !params.all, clamp_limit(params.limit))
        .await?;
    success(notifications)
}

/// POST /notifications/:id/read
pub async fn mark_notification_read(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<Notification> {
    match state.notifier.mark_read(&identity.uid, &id).await? {
        Some(notification) => success(notification),
        None => Err(AppError::NotFound(format!("Notification {} not found", id))),
    }
}
