//! Store API endpoints. A user owns at most one store.

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
use crate::models::{collections, CreateStoreRequest, Node, Store, UpdateStoreRequest, User};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListStoresParams {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /stores
pub async fn list_stores(
    State(state): State<AppState>,
    ValidQuery(params): ValidQuery<ListStoresParams>,
) -> ApiResult<Vec<Store>> {
    let mut query = Query::collection(collections::STORES);
    if let Some(user_id) = params.user_id {
        query = query.where_eq("userId", user_id);
    }
    let stores = state
        .store
        .query_as(
            &query
                .order_by("createdAt", Direction::Desc)
                .limit(clamp_limit(params.limit)),
        )
        .await?;
    success(stores)
}

/// GET /stores/:id
pub async fn get_store(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Store> {
    success(state.store.get_as(collections::STORES, &id).await?)
}

/// POST /stores - Create the caller's store. A second store is a conflict.
pub async fn create_store(
    State(state): State<AppState>,
    identity: Identity,
    ValidJson(request): ValidJson<CreateStoreRequest>,
) -> ApiResult<Store> {
    let now = Utc::now();
    let store = Store {
        id: new_id(),
        user_id: identity.uid.clone(),
        name: request.name.trim().to_string(),
        description: request.description.trim().to_string(),
        contact: request.contact,
        logo: request.logo.filter(|l| !l.is_empty()),
        products: Default::default(),
        status: "active".to_string(),
        created_at: now,
        updated_at: now,
    };
    store.validate()?;

    let stored = store.clone();
    state
        .store
        .run_tx(move |tx| {
            let store = stored.clone();
            Box::pin(async move {
                let owned = Query::collection(collections::STORES)
                    .where_eq("userId", store.user_id.as_str());
                if tx.count(&owned).await? > 0 {
                    return Err(AppError::Conflict("User already owns a store".to_string()));
                }
                tx.create_as(collections::STORES, &store.id, &store).await?;
                if let Some(mut owner) = tx
                    .find_as::<User>(collections::USERS, &store.user_id)
                    .await?
                {
                    owner.store_id = Some(store.id.clone());
                    owner.updated_at = next_updated_at(owner.updated_at);
                    tx.put_as(collections::USERS, &store.user_id, &owner).await?;
                }
                Ok::<_, AppError>(())
            })
        })
        .await?;
    created(store)
}

/// PUT /stores/:id - Owner or admin.
pub async fn update_store(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    ValidJson(request): ValidJson<UpdateStoreRequest>,
) -> ApiResult<Store> {
    let store = state
        .store
        .run_tx(move |tx| {
            let (id, identity, request) = (id.clone(), identity.clone(), request.clone());
            Box::pin(async move {
                let mut store: Store = tx.get_as(collections::STORES, &id).await?;
                identity.ensure_can_manage(&store.user_id)?;
                request.apply(&mut store);
                store.validate()?;
                store.updated_at = next_updated_at(store.updated_at);
                tx.put_as(collections::STORES, &id, &store).await?;
                Ok::<_, AppError>(store)
            })
        })
        .await?;
    success(store)
}

/// DELETE /stores/:id - Owner or admin. The store's products are unlinked and removed.
pub async fn delete_store(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .run_tx(move |tx| {
            let (id, identity) = (id.clone(), identity.clone());
            Box::pin(async move {
                let store: Store = tx.get_as(collections::STORES, &id).await?;
                identity.ensure_can_manage(&store.user_id)?;

                let products = tx
                    .query(
                        &Query::collection(collections::PRODUCTS).where_eq("storeId", id.as_str()),
                    )
                    .await?;
                for product in products {
                    let node_id = product
                        .data
                        .get("nodeId")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    if let Some(node_id) = node_id {
                        if let Some(mut node) =
                            tx.find_as::<Node>(collections::NODES, &node_id).await?
                        {
                            if node.linked_products.remove(&product.id) {
                                node.updated_at = next_updated_at(node.updated_at);
                                tx.put_as(collections::NODES, &node_id, &node).await?;
                            }
                        }
                    }
                    tx.delete(collections::PRODUCTS, &product.id).await?;
                }

                tx.delete(collections::STORES, &id).await?;
                if let Some(mut owner) = tx
                    .find_as::<User>(collections::USERS, &store.user_id)
                    .await?
                {
                    if owner.store_id.as_deref() == Some(id.as_str()) {
                        owner.store_id = None;
                        owner.updated_at = next_updated_at(owner.updated_at);
                        tx.put_as(collections::USERS, &store.user_id, &owner).await?;
                    }
                }
                Ok::<_, AppError>(())
            })
        })
        .await?;
    no_content()
}
