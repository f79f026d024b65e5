//! Change events delivered to the trigger dispatcher.
//!
//! Document writes, blob writes and identity-provider hooks all land in the
//! same outbox as a [`TriggerEvent`]; delivery is at-least-once.

mod outbox;

pub use outbox::*;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of document change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A committed document change with both snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    pub collection_path: String,
    pub document_id: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    /// Top-level fields whose value changed
    #[serde(default)]
    pub update_mask: Vec<String>,
}

impl DocumentChange {
    pub fn new(collection: &str, id: &str, old: Option<Value>, new: Option<Value>) -> Self {
        let kind = match (&old, &new) {
            (None, _) => ChangeKind::Create,
            (Some(_), Some(_)) => ChangeKind::Update,
            (Some(_), None) => ChangeKind::Delete,
        };
        let update_mask = match (&old, &new) {
            (Some(old), Some(new)) => changed_fields(old, new),
            _ => Vec::new(),
        };
        Self {
            collection_path: collection.to_string(),
            document_id: id.to_string(),
            kind,
            old_value: old,
            new_value: new,
            update_mask,
        }
    }

    pub fn field_changed(&self, field: &str) -> bool {
        self.update_mask.iter().any(|f| f == field)
    }
}

fn changed_fields(old: &Value, new: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .filter(|k| old.get(k.as_str()) != new.get(k.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlobEventKind {
    Finalized,
    Deleted,
}

/// Object-store event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobEvent {
    pub kind: BlobEventKind,
    pub bucket: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub time_created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventKind {
    Created,
    Deleted,
}

/// Identity-provider account as delivered by the auth hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, rename = "photoURL", alias = "photoUrl")]
    pub photo_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub user: AuthUser,
}

/// Everything the dispatcher can be asked to handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TriggerEvent {
    Document(DocumentChange),
    Blob(BlobEvent),
    Auth(AuthEvent),
}

impl TriggerEvent {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            TriggerEvent::Document(change) => {
                format!("{}.{}", change.collection_path, change.kind.as_str())
            }
            TriggerEvent::Blob(event) => match event.kind {
                BlobEventKind::Finalized => "blob.finalized".to_string(),
                BlobEventKind::Deleted => "blob.deleted".to_string(),
            },
            TriggerEvent::Auth(event) => match event.kind {
                AuthEventKind::Created => "auth.created".to_string(),
                AuthEventKind::Deleted => "auth.deleted".to_string(),
            },
        }
    }
}
