//! Identity-provider webhook.

use axum::{extract::State, http::HeaderMap};
use serde::{Deserialize, Serialize};

use super::{success, ApiResult, ValidJson};
use crate::auth::{webhook_authorized, WEBHOOK_SECRET_HEADER};
use crate::errors::AppError;
use crate::events::{AuthEvent, AuthEventKind, AuthUser, TriggerEvent};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AuthHookRequest {
    pub event: String,
    pub user: AuthUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthHookResponse {
    pub event_id: String,
}

/// POST /hooks/auth - Queue an account created/deleted event for the dispatcher.
pub async fn auth_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidJson(request): ValidJson<AuthHookRequest>,
) -> ApiResult<AuthHookResponse> {
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if !webhook_authorized(state.config.auth_webhook_secret.as_deref(), provided) {
        return Err(AppError::Unauthorized("Invalid webhook secret".to_string()));
    }

    let kind = match request.event.as_str() {
        "user.created" => AuthEventKind::Created,
        "user.deleted" => AuthEventKind::Deleted,
        other => {
            return Err(AppError::Validation(format!(
                "Unsupported auth event {}",
                other
            )))
        }
    };
    if request.user.uid.trim().is_empty() {
        return Err(AppError::Validation("user.uid is required".to_string()));
    }

    let event_id = state
        .store
        .events()
        .publish(&TriggerEvent::Auth(AuthEvent {
            kind,
            user: request.user,
        }))
        .await?;
    tracing::info!(event_id = %event_id, event = %request.event, "auth event queued");
    success(AuthHookResponse { event_id })
}
