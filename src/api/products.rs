//! Product API endpoints: linking store products to nodes and approving them.

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
    collections, ApprovalStatus, CreateProductRequest, Node, Product, ProductStatus, Store,
    UpdateProductRequest,
};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProductsParams {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub store_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /products?nodeId=|storeId=
pub async fn list_products(
    State(state): State<AppState>,
    ValidQuery(params): ValidQuery<ListProductsParams>,
) -> ApiResult<Vec<Product>> {
    let mut query = Query::collection(collections::PRODUCTS);
    if let Some(node_id) = params.node_id {
        query = query.where_eq("nodeId", node_id);
    }
    if let Some(store_id) = params.store_id {
        query = query.where_eq("storeId", store_id);
    }
    let products = state
        .store
        .query_as(
            &query
                .order_by("createdAt", Direction::Desc)
                .limit(clamp_limit(params.limit)),
        )
        .await?;
    success(products)
}

/// GET /products/:id
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Product> {
    success(state.store.get_as(collections::PRODUCTS, &id).await?)
}

/// POST /products - Link a product of the caller's store to a node.
pub async fn create_product(
    State(state): State<AppState>,
    identity: Identity,
    ValidJson(request): ValidJson<CreateProductRequest>,
) -> ApiResult<Product> {
    let now = Utc::now();
    let product = Product {
        id: new_id(),
        store_id: request.store_id,
        node_id: request.node_id,
        user_id: identity.uid.clone(),
        name: request.name.trim().to_string(),
        description: request.description.trim().to_string(),
        price: request.price,
        images: request.images,
        contact: request.contact,
        donation_percent: request.donation_percent,
        approval_status: ApprovalStatus::Pending,
        status: ProductStatus::Pending,
        created_at: now,
        updated_at: now,
    };
    product.validate()?;

    let draft = product.clone();
    let product = state
        .store
        .run_tx(move |tx| {
            let (mut product, identity) = (draft.clone(), identity.clone());
            Box::pin(async move {
                let mut store: Store = tx.get_as(collections::STORES, &product.store_id).await?;
                identity.ensure_can_manage(&store.user_id)?;
                let mut node: Node = tx.get_as(collections::NODES, &product.node_id).await?;

                product.user_id = store.user_id.clone();
                let approval = if node.approval_config.approves_immediately() {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Pending
                };
                product.set_approval(approval);
                tx.create_as(collections::PRODUCTS, &product.id, &product)
                    .await?;

                node.linked_products.insert(product.id.clone());
                node.updated_at = next_updated_at(node.updated_at);
                tx.put_as(collections::NODES, &product.node_id, &node).await?;

                store.products.insert(product.id.clone());
                store.updated_at = next_updated_at(store.updated_at);
                tx.put_as(collections::STORES, &product.store_id, &store)
                    .await?;
                Ok::<_, AppError>(product)
            })
        })
        .await?;
    created(product)
}

/// PUT /products/:id - Store owner or admin.
pub async fn update_product(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    ValidJson(request): ValidJson<UpdateProductRequest>,
) -> ApiResult<Product> {
    let product = state
        .store
        .run_tx(move |tx| {
            let (id, identity, request) = (id.clone(), identity.clone(), request.clone());
            Box::pin(async move {
                let mut product: Product = tx.get_as(collections::PRODUCTS, &id).await?;
                identity.ensure_can_manage(&product.user_id)?;
                request.apply(&mut product)?;
                product.validate()?;
                product.updated_at = next_updated_at(product.updated_at);
                tx.put_as(collections::PRODUCTS, &id, &product).await?;
                Ok::<_, AppError>(product)
            })
        })
        .await?;
    success(product)
}

/// DELETE /products/:id - Store owner or admin. Unlinks the product from its node and store.
pub async fn delete_product(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .run_tx(move |tx| {
            let (id, identity) = (id.clone(), identity.clone());
            Box::pin(async move {
                let product: Product = tx.get_as(collections::PRODUCTS, &id).await?;
                identity.ensure_can_manage(&product.user_id)?;

                if let Some(mut node) = tx
                    .find_as::<Node>(collections::NODES, &product.node_id)
                    .await?
                {
                    if node.linked_products.remove(&id) {
                        node.updated_at = next_updated_at(node.updated_at);
                        tx.put_as(collections::NODES, &product.node_id, &node).await?;
                    }
                }
                if let Some(mut store) = tx
                    .find_as::<Store>(collections::STORES, &product.store_id)
                    .await?
                {
                    if store.products.remove(&id) {
                        store.updated_at = next_updated_at(store.updated_at);
                        tx.put_as(collections::STORES, &product.store_id, &store)
                            .await?;
                    }
                }
                tx.delete(collections::PRODUCTS, &id).await?;
                Ok::<_, AppError>(())
            })
        })
        .await?;
    no_content()
}

/// POST /products/:id/approve - Node owner or admin.
pub async fn approve_product(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<Product> {
    success(decide(&state, identity, id, ApprovalStatus::Approved).await?)
}

/// POST /products/:id/reject - Node owner or admin.
pub async fn reject_product(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<Product> {
    success(decide(&state, identity, id, ApprovalStatus::Rejected).await?)
}

/// Settle a pending approval. Deciding twice is a conflict.
async fn decide(
    state: &AppState,
    identity: Identity,
    id: String,
    decision: ApprovalStatus,
) -> Result<Product, AppError> {
    state
        .store
        .run_tx(move |tx| {
            let (id, identity) = (id.clone(), identity.clone());
            Box::pin(async move {
                let mut product: Product = tx.get_as(collections::PRODUCTS, &id).await?;
                let node: Node = tx.get_as(collections::NODES, &product.node_id).await?;
                identity.ensure_can_manage(&node.user_id)?;
                if product.approval_status != ApprovalStatus::Pending {
                    return Err(AppError::Conflict(format!(
                        "Product {} has already been decided",
                        id
                    )));
                }
                product.set_approval(decision);
                product.updated_at = next_updated_at(product.updated_at);
                tx.put_as(collections::PRODUCTS, &id, &product).await?;
                Ok::<_, AppError>(product)
            })
        })
        .await
}
