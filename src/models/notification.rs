//! Notification model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    Welcome,
    AchievementFollowers,
    AchievementUnlocked,
    ProductPending,
    WeeklyDigest,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NodeCreated => "node_created",
            NotificationKind::NodeUpdated => "node_updated",
            NotificationKind::NodeDeleted => "node_deleted",
            NotificationKind::Welcome => "welcome",
            NotificationKind::AchievementFollowers => "achievement_followers",
            NotificationKind::AchievementUnlocked => "achievement_unlocked",
            NotificationKind::ProductPending => "product_pending",
            NotificationKind::WeeklyDigest => "weekly_digest",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Recipient
    pub user_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        user_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            kind,
            user_id: user_id.to_string(),
            title: title.into(),
            description: description.into(),
            data: Map::new(),
            created_at: Utc::now(),
            read: false,
            read_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Push payload: string-valued data entries plus `type`.
    pub fn push_data(&self) -> std::collections::BTreeMap<String, String> {
        let mut data: std::collections::BTreeMap<String, String> = self
            .data
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        data.insert("type".to_string(), self.kind.as_str().to_string());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_data_keeps_strings_and_type() {
        let notification = Notification::new(NotificationKind::NodeCreated, "u2", "t", "d")
            .with_data("nodeID", "n1")
            .with_data("nodeType", "social")
            .with_data("followers", 100);
        let data = notification.push_data();
        assert_eq!(data.get("nodeID").map(String::as_str), Some("n1"));
        assert_eq!(data.get("type").map(String::as_str), Some("node_created"));
        assert!(!data.contains_key("followers"));
    }

    #[test]
    fn test_read_at_omitted_until_read() {
        let value =
            serde_json::to_value(Notification::new(NotificationKind::Welcome, "u1", "t", "d"))
                .unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["read"], false);
        assert!(value.get("readAt").is_none());
    }
}
