//! REST API module.
//!
//! Handlers are thin: they validate, authorize and write through the document
//! store. Side effects (feed, notifications, achievements) follow from the
//! change events those writes emit.

mod feed;
mod hooks;
mod nodes;
mod notifications;
mod products;
mod stores;
mod uploads;
mod users;

pub use feed::*;
pub use hooks::*;
pub use nodes::*;
pub use notifications::*;
pub use products::*;
pub use stores::*;
pub use uploads::*;
pub use users::*;

use axum::{
    extract::{FromRequest, FromRequestParts, Query, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::AppError;

/// Success response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip)]
    status: StatusCode,
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            status: StatusCode::OK,
            success: true,
            data,
        }
    }

    pub fn created(data: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            ..Self::new(data)
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Response type that can be either success or error.
pub type ApiResult<T> = Result<ApiResponse<T>, AppError>;

/// Create a successful API response.
pub fn success<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(ApiResponse::new(data))
}

pub fn created<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(ApiResponse::created(data))
}

/// Empty 204 reply for deletes.
pub fn no_content() -> Result<StatusCode, AppError> {
    Ok(StatusCode::NO_CONTENT)
}

/// `Json` whose rejection renders in the error envelope.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ValidJson(value))
    }
}

/// `Query` whose rejection renders in the error envelope.
pub struct ValidQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ValidQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ValidQuery(value))
    }
}

/// Next `updatedAt` for a document: now, but strictly after the previous value.
pub fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    // stored with millisecond precision
    if now.timestamp_millis() > previous.timestamp_millis() {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Health check endpoint.
pub async fn health_check() -> ApiResult<serde_json::Value> {
    success(serde_json::json!({ "status": "ok" }))
}
