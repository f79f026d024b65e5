//! Feed items: immutable timeline entries with a typed snapshot payload.

use serde::{Deserialize, Serialize};

use super::{Node, NodeMetrics, NodeType, Product};

/// Snapshot of a node embedded in feed items. Only `metrics` is rewritten later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub title: String,
    pub description: String,
    #[serde(rename = "nodeType")]
    pub node_type: NodeType,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub metrics: NodeMetrics,
    /// Source `updatedAt` (unix ms) of the node state the metrics came from
    #[serde(default)]
    pub metrics_updated_at: i64,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            title: node.title.clone(),
            description: node.description.clone(),
            node_type: node.node_type,
            media: node.media.clone(),
            followers_count: node.followers_count,
            metrics: node.metrics,
            metrics_updated_at: node.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub product_id: String,
    pub store_id: String,
    pub name: String,
    pub price: f64,
    pub donation_percent: u32,
    #[serde(default)]
    pub images: Vec<String>,
}

impl From<&Product> for ProductSnapshot {
    fn from(product: &Product) -> Self {
        Self {
            product_id: product.id.clone(),
            store_id: product.store_id.clone(),
            name: product.name.clone(),
            price: product.price,
            donation_percent: product.donation_percent,
            images: product.images.clone(),
        }
    }
}

/// Feed item payload, tagged by `type` with the snapshot under `content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum FeedPayload {
    NodeCreated(NodeSnapshot),
    NodeUpdated(NodeSnapshot),
    NodeDeleted(NodeSnapshot),
    ProductLinked(ProductSnapshot),
}

impl FeedPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedPayload::NodeCreated(_) => "node_created",
            FeedPayload::NodeUpdated(_) => "node_updated",
            FeedPayload::NodeDeleted(_) => "node_deleted",
            FeedPayload::ProductLinked(_) => "product_linked",
        }
    }

    pub fn node_snapshot_mut(&mut self) -> Option<&mut NodeSnapshot> {
        match self {
            FeedPayload::NodeCreated(s) | FeedPayload::NodeUpdated(s) | FeedPayload::NodeDeleted(s) => {
                Some(s)
            }
            FeedPayload::ProductLinked(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub node_id: String,
    /// Actor
    pub user_id: String,
    #[serde(flatten)]
    pub payload: FeedPayload,
    /// Monotonic unix milliseconds
    pub created_at: i64,
}
