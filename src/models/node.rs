//! Node model: a cause users follow and interact with.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{check_length, check_urls, ValidationError};

pub const MAX_NODE_MEDIA: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Social,
    Environmental,
    Animal,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Social => "social",
            NodeType::Environmental => "environmental",
            NodeType::Animal => "animal",
        }
    }
}

/// Interaction counters. All monotonic except `followers`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub shares: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub followers: u64,
}

impl NodeMetrics {
    pub fn record(&mut self, kind: InteractionKind) {
        match kind {
            InteractionKind::View => self.views += 1,
            InteractionKind::Like => self.likes += 1,
            InteractionKind::Share => self.shares += 1,
            InteractionKind::Comment => self.comments += 1,
        }
    }

    /// Field-wise maximum.
    pub fn max(&self, other: &NodeMetrics) -> NodeMetrics {
        NodeMetrics {
            views: self.views.max(other.views),
            likes: self.likes.max(other.likes),
            shares: self.shares.max(other.shares),
            comments: self.comments.max(other.comments),
            followers: self.followers.max(other.followers),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub auto_approve: bool,
}

impl ApprovalConfig {
    /// Whether a newly linked product starts out approved.
    pub fn approves_immediately(&self) -> bool {
        !self.requires_approval || self.auto_approve
    }
}

/// Progress post attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(alias = "name")]
    pub title: String,
    pub description: String,
    pub user_id: String,
    #[serde(default, alias = "images")]
    pub media: Vec<String>,
    #[serde(default)]
    pub updates: Vec<NodeUpdate>,
    #[serde(default)]
    pub followers: BTreeSet<String>,
    /// Cached `followers.len()`
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default, alias = "products")]
    pub linked_products: BTreeSet<String>,
    #[serde(default)]
    pub approval_config: ApprovalConfig,
    #[serde(default)]
    pub metrics: NodeMetrics,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> String {
    "active".to_string()
}

impl Node {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_length("title", &self.title, 3, 100)?;
        check_length("description", &self.description, 10, 1000)?;
        check_urls("media", &self.media, 0, MAX_NODE_MEDIA)?;
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::new("userId", "is required"));
        }
        Ok(())
    }

    /// Add a follower, keeping the cached counters in step.
    pub fn add_follower(&mut self, user_id: &str) -> bool {
        let added = self.followers.insert(user_id.to_string());
        self.sync_follower_count();
        added
    }

    pub fn remove_follower(&mut self, user_id: &str) -> bool {
        let removed = self.followers.remove(user_id);
        self.sync_follower_count();
        removed
    }

    fn sync_follower_count(&mut self) {
        self.followers_count = self.followers.len() as u64;
        self.metrics.followers = self.followers_count;
    }
}

/// Request body for creating a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeRequest {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(alias = "name")]
    pub title: String,
    pub description: String,
    /// Must match the caller unless the caller is an admin
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, alias = "images")]
    pub media: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub approval_config: ApprovalConfig,
}

/// Request body for updating a node. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequest {
    #[serde(default, rename = "type")]
    pub node_type: Option<NodeType>,
    #[serde(default, alias = "name")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "images")]
    pub media: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub approval_config: Option<ApprovalConfig>,
    #[serde(default)]
    pub status: Option<String>,
}

impl UpdateNodeRequest {
    pub fn apply(self, node: &mut Node) {
        if let Some(node_type) = self.node_type {
            node.node_type = node_type;
        }
        if let Some(title) = self.title {
            node.title = title;
        }
        if let Some(description) = self.description {
            node.description = description;
        }
        if let Some(media) = self.media {
            node.media = media;
        }
        if let Some(tags) = self.tags {
            node.tags = tags;
        }
        if let Some(approval_config) = self.approval_config {
            node.approval_config = approval_config;
        }
        if let Some(status) = self.status {
            node.status = status;
        }
    }
}

/// Kinds of recorded interactions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    View,
    Like,
    Share,
    Comment,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::View => "view",
            InteractionKind::Like => "like",
            InteractionKind::Share => "share",
            InteractionKind::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteractionRequest {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
}

/// One user interaction with a node, kept for digests and achievements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Follower sub-collection entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowerRecord {
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub followed_at: DateTime<Utc>,
}
