//! User API endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;

use super::{created, next_updated_at, no_content, success, ApiResult, ValidJson, ValidQuery};
use crate::auth::Identity;
use crate::db::{Direction, Query};
use crate::errors::AppError;
use crate::feed::clamp_limit;
use crate::models::{collections, CreateUserRequest, UpdateUserRequest, User};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListUsersParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /users - Admin only.
pub async fn list_users(
    State(state): State<AppState>,
    identity: Identity,
    ValidQuery(params): ValidQuery<ListUsersParams>,
) -> ApiResult<Vec<User>> {
    if !identity.is_admin() {
        return Err(AppError::Forbidden("Only admins can list users".to_string()));
    }
    let users = state
        .store
        .query_as(
            &Query::collection(collections::USERS)
                .order_by("createdAt", Direction::Desc)
                .limit(clamp_limit(params.limit)),
        )
        .await?;
    success(users)
}

/// GET /users/:id
pub async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<User> {
    success(state.store.get_as(collections::USERS, &id).await?)
}

/// POST /users - Create the caller's profile (admins may pass another `id`).
pub async fn create_user(
    State(state): State<AppState>,
    identity: Identity,
    ValidJson(request): ValidJson<CreateUserRequest>,
) -> ApiResult<User> {
    let id = request
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| identity.uid.clone());
    identity.ensure_can_manage(&id)?;
    if request.display_name.trim().is_empty() {
        return Err(AppError::Validation("displayName is required".to_string()));
    }

    let email = if request.email.is_empty() && id == identity.uid {
        identity.email.clone()
    } else {
        request.email.clone()
    };
    let mut user = User::new(&id, &email, request.display_name.trim(), &request.photo_url);
    user.profile = request.profile;
    user.fcm_token = request.fcm_token.filter(|t| !t.is_empty());

    let stored = user.clone();
    let inserted = state
        .store
        .run_tx(move |tx| {
            let user = stored.clone();
            Box::pin(async move { tx.create_as(collections::USERS, &user.id, &user).await })
        })
        .await?;
    if !inserted {
        return Err(AppError::Conflict(format!("User {} already exists", id)));
    }
    created(user)
}

/// PUT /users/:id - Self or admin. Only admins may change roles.
pub async fn update_user(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    ValidJson(request): ValidJson<UpdateUserRequest>,
) -> ApiResult<User> {
    identity.ensure_can_manage(&id)?;
    if request.role.is_some() && !identity.is_admin() {
        return Err(AppError::Forbidden("Only admins can change roles".to_string()));
    }
    let user = state
        .store
        .run_tx(move |tx| {
            let (id, request) = (id.clone(), request.clone());
            Box::pin(async move {
                let mut user: User = tx.get_as(collections::USERS, &id).await?;
                if let Some(display_name) = request.display_name {
                    if display_name.trim().is_empty() {
                        return Err(AppError::Validation(
                            "displayName cannot be empty".to_string(),
                        ));
                    }
                    user.display_name = display_name.trim().to_string();
                }
                if let Some(photo_url) = request.photo_url {
                    user.photo_url = photo_url;
                }
                if let Some(profile) = request.profile {
                    user.profile = profile;
                }
                if let Some(token) = request.fcm_token {
                    user.fcm_token = Some(token).filter(|t| !t.is_empty());
                }
                if let Some(active) = request.active {
                    user.active = active;
                }
                if let Some(role) = request.role {
                    user.role = role;
                }
                user.updated_at = next_updated_at(user.updated_at);
                tx.put_as(collections::USERS, &id, &user).await?;
                Ok::<_, AppError>(user)
            })
        })
        .await?;
    success(user)
}

/// DELETE /users/:id - Self or admin.
pub async fn delete_user(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    identity.ensure_can_manage(&id)?;
    if !state.store.delete(collections::USERS, &id).await? {
        return Err(AppError::NotFound(format!("User {} not found", id)));
    }
    no_content()
}

/// POST /users/:id/following/:target_id
pub async fn follow_user(
    State(state): State<AppState>,
    identity: Identity,
    Path((id, target_id)): Path<(String, String)>,
) -> ApiResult<User> {
    success(set_user_following(&state, &identity, id, target_id, true).await?)
}

/// DELETE /users/:id/following/:target_id
pub async fn unfollow_user(
    State(state): State<AppState>,
    identity: Identity,
    Path((id, target_id)): Path<(String, String)>,
) -> ApiResult<User> {
    success(set_user_following(&state, &identity, id, target_id, false).await?)
}

async fn set_user_following(
    state: &AppState,
    identity: &Identity,
    id: String,
    target_id: String,
    follow: bool,
) -> Result<User, AppError> {
    if identity.uid != id {
        return Err(AppError::Forbidden(
            "Only the acting user can change whom they follow".to_string(),
        ));
    }
    if id == target_id {
        return Err(AppError::Validation("Users cannot follow themselves".to_string()));
    }
    state
        .store
        .run_tx(move |tx| {
            let (id, target_id) = (id.clone(), target_id.clone());
            Box::pin(async move {
                tx.get(collections::USERS, &target_id).await?;
                let mut user: User = tx.get_as(collections::USERS, &id).await?;
                let changed = if follow {
                    user.following.insert(target_id)
                } else {
                    user.following.remove(&target_id)
                };
                if changed {
                    user.updated_at = next_updated_at(user.updated_at);
                    tx.put_as(collections::USERS, &id, &user).await?;
                }
                Ok::<_, AppError>(user)
            })
        })
        .await
}
