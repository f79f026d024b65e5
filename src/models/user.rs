//! User model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::InteractionKind;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserMetrics {
    #[serde(default)]
    pub total_interactions: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub shares: u64,
    #[serde(default)]
    pub views: u64,
}

impl UserMetrics {
    pub fn record(&mut self, kind: InteractionKind) {
        self.total_interactions += 1;
        match kind {
            InteractionKind::View => self.views += 1,
            InteractionKind::Like => self.likes += 1,
            InteractionKind::Share => self.shares += 1,
            InteractionKind::Comment => self.comments += 1,
        }
    }
}

/// Achievement as embedded in the user document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAchievement {
    pub id: String,
    pub user_id: String,
    pub achievement_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub points: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub unlocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, rename = "photoURL", alias = "photoUrl")]
    pub photo_url: String,
    #[serde(default)]
    pub profile: UserProfile,
    #[serde(default)]
    pub followed_nodes: BTreeSet<String>,
    #[serde(default)]
    pub following: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(default)]
    pub achievements: Vec<UserAchievement>,
    /// Sum of `achievements[*].points`
    #[serde(default)]
    pub points: u64,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm_token: Option<String>,
    #[serde(default)]
    pub nodes: BTreeSet<String>,
    #[serde(default)]
    pub metrics: UserMetrics,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl User {
    /// Fresh profile with default role, empty sets and zero points.
    pub fn new(id: &str, email: &str, display_name: &str, photo_url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            photo_url: photo_url.to_string(),
            profile: UserProfile::default(),
            followed_nodes: BTreeSet::new(),
            following: BTreeSet::new(),
            store_id: None,
            achievements: Vec::new(),
            points: 0,
            role: Role::User,
            fcm_token: None,
            nodes: BTreeSet::new(),
            metrics: UserMetrics::default(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_token(&self) -> Option<&str> {
        self.fcm_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Request body for creating a user profile directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: String,
    pub display_name: String,
    #[serde(default, rename = "photoURL", alias = "photoUrl")]
    pub photo_url: String,
    #[serde(default)]
    pub profile: UserProfile,
    #[serde(default)]
    pub fcm_token: Option<String>,
}

/// Request body for updating a user. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL", alias = "photoUrl")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub profile: Option<UserProfile>,
    #[serde(default)]
    pub fcm_token: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    /// Admin only
    #[serde(default)]
    pub role: Option<Role>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_profile_defaults() {
        let user = User::new("u1", "u1@example.org", "Ana", "");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.points, 0);
        assert!(user.active);
        assert!(user.followed_nodes.is_empty());
        assert!(user.push_token().is_none());

        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["role"], "user");
        assert!(value.get("fcmToken").is_none());
        assert!(value.get("photoURL").is_some());
    }

    #[test]
    fn test_metrics_record() {
        let mut metrics = UserMetrics::default();
        metrics.record(InteractionKind::Like);
        metrics.record(InteractionKind::View);
        assert_eq!(metrics.total_interactions, 2);
        assert_eq!(metrics.likes, 1);
        assert_eq!(metrics.views, 1);
    }
}
