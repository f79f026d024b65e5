//! Node API endpoints, including followers and interactions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;

use super::{
    created, new_id, next_updated_at, no_content, success, ApiResult, ValidJson, ValidQuery,
};
use crate::auth::Identity;
use crate::db::{Direction, Query};
use crate::errors::AppError;
use crate::feed::clamp_limit;
use crate::models::{
    collections, CreateNodeRequest, FollowerRecord, InteractionRequest, Node, NodeMetrics, NodeType,
    Product, UpdateNodeRequest, User, UserActivity,
};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListNodesParams {
    #[serde(default, rename = "type")]
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /nodes - Newest nodes, optionally of one type.
pub async fn list_nodes(
    State(state): State<AppState>,
    ValidQuery(params): ValidQuery<ListNodesParams>,
) -> ApiResult<Vec<Node>> {
    let mut query = Query::collection(collections::NODES);
    if let Some(node_type) = params.node_type {
        query = query.where_eq("type", node_type.as_str());
    }
    let nodes = state
        .store
        .query_as(
            &query
                .order_by("createdAt", Direction::Desc)
                .limit(clamp_limit(params.limit)),
        )
        .await?;
    success(nodes)
}

/// GET /nodes/popular - Nodes with the most followers.
pub async fn popular_nodes(
    State(state): State<AppState>,
    ValidQuery(params): ValidQuery<ListNodesParams>,
) -> ApiResult<Vec<Node>> {
    let nodes = state
        .store
        .query_as(
            &Query::collection(collections::NODES)
                .order_by("followersCount", Direction::Desc)
                .limit(clamp_limit(params.limit)),
        )
        .await?;
    success(nodes)
}

/// GET /nodes/:id
pub async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Node> {
    success(state.store.get_as(collections::NODES, &id).await?)
}

/// POST /nodes - Create a node owned by the caller (or by `userId`, for admins).
pub async fn create_node(
    State(state): State<AppState>,
    identity: Identity,
    ValidJson(request): ValidJson<CreateNodeRequest>,
) -> ApiResult<Node> {
    let owner = request
        .user_id
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| identity.uid.clone());
    identity.ensure_can_manage(&owner)?;

    let now = Utc::now();
    let node = Node {
        id: new_id(),
        node_type: request.node_type,
        title: request.title.trim().to_string(),
        description: request.description.trim().to_string(),
        user_id: owner,
        media: request.media,
        updates: Vec::new(),
        followers: Default::default(),
        followers_count: 0,
        linked_products: Default::default(),
        approval_config: request.approval_config,
        metrics: NodeMetrics::default(),
        tags: request.tags,
        status: "active".to_string(),
        created_at: now,
        updated_at: now,
    };
    node.validate()?;

    let stored = node.clone();
    state
        .store
        .run_tx(move |tx| {
            let node = stored.clone();
            Box::pin(async move {
                tx.create_as(collections::NODES, &node.id, &node).await?;
                if let Some(mut owner) = tx
                    .find_as::<User>(collections::USERS, &node.user_id)
                    .await?
                {
                    owner.nodes.insert(node.id.clone());
                    owner.updated_at = next_updated_at(owner.updated_at);
                    tx.put_as(collections::USERS, &node.user_id, &owner).await?;
                }
                Ok::<_, AppError>(())
            })
        })
        .await?;

    tracing::info!(node_id = %node.id, user_id = %node.user_id, "node created");
    created(node)
}

/// PUT /nodes/:id - Owner or admin.
pub async fn update_node(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    ValidJson(request): ValidJson<UpdateNodeRequest>,
) -> ApiResult<Node> {
    let node = state
        .store
        .run_tx(move |tx| {
            let (id, identity, request) = (id.clone(), identity.clone(), request.clone());
            Box::pin(async move {
                let mut node: Node = tx.get_as(collections::NODES, &id).await?;
                identity.ensure_can_manage(&node.user_id)?;
                request.apply(&mut node);
                node.validate()?;
                node.updated_at = next_updated_at(node.updated_at);
                tx.put_as(collections::NODES, &id, &node).await?;
                Ok::<_, AppError>(node)
            })
        })
        .await?;
    success(node)
}

/// DELETE /nodes/:id - Owner or admin. Feed purge and follower notices follow
/// from the delete event.
pub async fn delete_node(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .run_tx(move |tx| {
            let (id, identity) = (id.clone(), identity.clone());
            Box::pin(async move {
                let node: Node = tx.get_as(collections::NODES, &id).await?;
                identity.ensure_can_manage(&node.user_id)?;
                tx.delete(collections::NODES, &id).await?;
                Ok::<_, AppError>(())
            })
        })
        .await?;
    no_content()
}

/// GET /nodes/:id/followers - Follower user ids.
pub async fn list_followers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<String>> {
    state.store.get(collections::NODES, &id).await?;
    let records = state
        .store
        .pager(Query::collection(collections::node_followers(&id)), 500)
        .collect_all()
        .await?;
    success(records.into_iter().map(|doc| doc.id).collect())
}

/// POST /nodes/:id/followers/:user_id - Only the acting user may follow.
pub async fn add_follower(
    State(state): State<AppState>,
    identity: Identity,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<Node> {
    ensure_acting_user(&identity, &user_id)?;
    let node = set_following(&state, id, user_id, true).await?;
    success(node)
}

/// DELETE /nodes/:id/followers/:user_id
pub async fn remove_follower(
    State(state): State<AppState>,
    identity: Identity,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<Node> {
    ensure_acting_user(&identity, &user_id)?;
    let node = set_following(&state, id, user_id, false).await?;
    success(node)
}

fn ensure_acting_user(identity: &Identity, user_id: &str) -> Result<(), AppError> {
    if identity.uid == user_id {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Followers can only be changed by the acting user".to_string(),
        ))
    }
}

/// Update both sides of the follow relation and the follower record in one
/// transaction. A no-op when the relation is already in the wanted state.
async fn set_following(
    state: &AppState,
    node_id: String,
    user_id: String,
    follow: bool,
) -> Result<Node, AppError> {
    state
        .store
        .run_tx(move |tx| {
            let (node_id, user_id) = (node_id.clone(), user_id.clone());
            Box::pin(async move {
                let mut node: Node = tx.get_as(collections::NODES, &node_id).await?;
                let mut user: User = tx.get_as(collections::USERS, &user_id).await?;
                let followers_path = collections::node_followers(&node_id);

                let changed = if follow {
                    let added = node.add_follower(&user_id);
                    user.followed_nodes.insert(node_id.clone());
                    if added {
                        let record = FollowerRecord {
                            user_id: user_id.clone(),
                            followed_at: Utc::now(),
                        };
                        tx.put_as(&followers_path, &user_id, &record).await?;
                    }
                    added
                } else {
                    let removed = node.remove_follower(&user_id);
                    user.followed_nodes.remove(&node_id);
                    tx.delete(&followers_path, &user_id).await?;
                    removed
                };

                if changed {
                    node.updated_at = next_updated_at(node.updated_at);
                    tx.put_as(collections::NODES, &node_id, &node).await?;
                }
                user.updated_at = next_updated_at(user.updated_at);
                tx.put_as(collections::USERS, &user_id, &user).await?;
                Ok::<_, AppError>(node)
            })
        })
        .await
}

/// POST /nodes/:id/interactions - Record a view, like, share or comment by the caller.
pub async fn record_interaction(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    ValidJson(request): ValidJson<InteractionRequest>,
) -> ApiResult<UserActivity> {
    let activity = UserActivity {
        id: new_id(),
        user_id: identity.uid.clone(),
        node_id: id.clone(),
        kind: request.kind,
        created_at: Utc::now(),
    };
    let recorded = activity.clone();
    state
        .store
        .run_tx(move |tx| {
            let activity = recorded.clone();
            Box::pin(async move {
                let mut node: Node = tx.get_as(collections::NODES, &activity.node_id).await?;
                node.metrics.record(activity.kind);
                node.updated_at = next_updated_at(node.updated_at);
                tx.put_as(collections::NODES, &activity.node_id, &node).await?;

                if let Some(mut user) = tx
                    .find_as::<User>(collections::USERS, &activity.user_id)
                    .await?
                {
                    user.metrics.record(activity.kind);
                    user.updated_at = next_updated_at(user.updated_at);
                    tx.put_as(collections::USERS, &activity.user_id, &user).await?;
                }
                tx.create_as(collections::USER_ACTIVITY, &activity.id, &activity)
                    .await?;
                Ok::<_, AppError>(())
            })
        })
        .await?;
    created(activity)
}

/// GET /nodes/:id/products - Approved products; the node owner also sees the rest.
pub async fn list_node_products(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<Vec<Product>> {
    let node: Node = state.store.get_as(collections::NODES, &id).await?;
    let mut query = Query::collection(collections::PRODUCTS).where_eq("nodeId", id.as_str());
    if !identity.can_manage(&node.user_id) {
        query = query.where_eq("approvalStatus", "approved");
    }
    let products = state
        .store
        .pager(query, 500)
        .collect_all()
        .await?
        .into_iter()
        .map(|doc| doc.into_decoded())
        .collect::<Result<Vec<Product>, _>>()?;
    success(products)
}
