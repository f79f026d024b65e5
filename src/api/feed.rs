//! Feed API endpoint.

use axum::extract::State;
use serde::Deserialize;

use super::{success, ApiResult, ValidQuery};
use crate::auth::Identity;
use crate::errors::AppError;
use crate::feed::{FeedCursor, FeedPage, FeedPageRequest};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// `nextCursor` of the previous page; takes precedence over `page`
    #[serde(default)]
    pub cursor: Option<String>,
}

/// GET /feed - The caller's feed, newest first.
pub async fn get_feed(
    State(state): State<AppState>,
    identity: Identity,
    ValidQuery(params): ValidQuery<FeedParams>,
) -> ApiResult<FeedPage> {
    let before = match params.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            FeedCursor::decode(raw)
                .ok_or_else(|| AppError::Validation(format!("Invalid cursor {}", raw)))?,
        ),
        None => None,
    };
    if params.page == Some(0) {
        return Err(AppError::Validation("page starts at 1".to_string()));
    }
    let request = FeedPageRequest {
        limit: params.limit,
        before,
        page: params.page,
    };
    success(state.feed.list_for_user(&identity.uid, &request).await?)
}
