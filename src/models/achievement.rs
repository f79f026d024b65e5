//! Achievement and points models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User counter an achievement rule is evaluated against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    NodeCount,
    InteractionCount,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::NodeCount => "node_count",
            Counter::InteractionCount => "interaction_count",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionOp {
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = "==")]
    Exactly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub counter_name: Counter,
    pub operator: ConditionOp,
    pub value: u64,
}

impl Condition {
    pub fn holds(&self, counter: u64) -> bool {
        match self.operator {
            ConditionOp::AtLeast => counter >= self.value,
            ConditionOp::Exactly => counter == self.value,
        }
    }
}

/// A granted achievement. Permanent once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: Counter,
    pub name: String,
    pub description: String,
    pub points: u64,
    pub conditions: Vec<Condition>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub unlocked_at: DateTime<Utc>,
}

/// Materialized points total of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPoints {
    pub user_id: String,
    pub total: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}
