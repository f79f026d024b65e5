//! Achievement evaluation.
//!
//! Rules are static tables ordered by threshold. Grants are keyed by a
//! deterministic id so a replayed evaluation never counts points twice.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::db::{DocumentStore, Query, StoreError};
use crate::models::{
    collections, Achievement, Condition, ConditionOp, Counter, Notification, NotificationKind,
    User, UserAchievement, UserPoints,
};
use crate::notify::NotificationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AchievementRule {
    pub threshold: u64,
    pub name: &'static str,
    pub description: &'static str,
    pub points: u64,
}

pub const NODE_COUNT_RULES: &[AchievementRule] = &[
    AchievementRule {
        threshold: 1,
        name: "Primer Nodo",
        description: "Creaste tu primer nodo",
        points: 50,
    },
    AchievementRule {
        threshold: 10,
        name: "Creador de Nodos",
        description: "Creaste 10 nodos",
        points: 100,
    },
    AchievementRule {
        threshold: 25,
        name: "Entusiasta de Nodos",
        description: "Creaste 25 nodos",
        points: 250,
    },
    AchievementRule {
        threshold: 50,
        name: "Experto en Nodos",
        description: "Creaste 50 nodos",
        points: 500,
    },
    AchievementRule {
        threshold: 100,
        name: "Maestro de Nodos",
        description: "Creaste 100 nodos",
        points: 1000,
    },
];

pub const INTERACTION_COUNT_RULES: &[AchievementRule] = &[
    AchievementRule {
        threshold: 10,
        name: "Principiante",
        description: "Realizaste 10 interacciones",
        points: 50,
    },
    AchievementRule {
        threshold: 100,
        name: "Activo",
        description: "Realizaste 100 interacciones",
        points: 100,
    },
    AchievementRule {
        threshold: 500,
        name: "Muy Activo",
        description: "Realizaste 500 interacciones",
        points: 500,
    },
    AchievementRule {
        threshold: 1000,
        name: "Super Activo",
        description: "Realizaste 1000 interacciones",
        points: 1000,
    },
];

pub fn rules_for(counter: Counter) -> &'static [AchievementRule] {
    match counter {
        Counter::NodeCount => NODE_COUNT_RULES,
        Counter::InteractionCount => INTERACTION_COUNT_RULES,
    }
}

/// The highest rule whose threshold is at most `value`.
pub fn highest_reached(counter: Counter, value: u64) -> Option<&'static AchievementRule> {
    rules_for(counter)
        .iter()
        .rev()
        .find(|rule| rule.threshold <= value)
}

/// Stable id of the achievement for `(user, counter, threshold)`.
pub fn achievement_id(user_id: &str, counter: Counter, threshold: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(counter.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(threshold.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct AchievementEvaluator {
    store: DocumentStore,
    notifier: NotificationEngine,
}

impl AchievementEvaluator {
    pub fn new(store: DocumentStore, notifier: NotificationEngine) -> Self {
        Self { store, notifier }
    }

    /// Current value of a user's counter, read from the source collections.
    pub async fn counter_value(&self, user_id: &str, counter: Counter) -> Result<u64, StoreError> {
        let query = match counter {
            Counter::NodeCount => Query::collection(collections::NODES).where_eq("userId", user_id),
            Counter::InteractionCount => {
                Query::collection(collections::USER_ACTIVITY).where_eq("userId", user_id)
            }
        };
        Ok(self.store.count(&query).await?.max(0) as u64)
    }

    /// Grant the highest reached threshold, if not granted yet.
    pub async fn evaluate(
        &self,
        user_id: &str,
        counter: Counter,
    ) -> Result<Option<Achievement>, StoreError> {
        let value = self.counter_value(user_id, counter).await?;
        let Some(rule) = highest_reached(counter, value) else {
            return Ok(None);
        };
        self.grant(user_id, counter, rule).await
    }

    /// Write the achievement and credit its points in one transaction.
    /// Returns `None` when it already existed.
    pub async fn grant(
        &self,
        user_id: &str,
        counter: Counter,
        rule: &'static AchievementRule,
    ) -> Result<Option<Achievement>, StoreError> {
        let now = Utc::now();
        let achievement = Achievement {
            id: achievement_id(user_id, counter, rule.threshold),
            user_id: user_id.to_string(),
            kind: counter,
            name: rule.name.to_string(),
            description: rule.description.to_string(),
            points: rule.points,
            conditions: vec![Condition {
                counter_name: counter,
                operator: ConditionOp::AtLeast,
                value: rule.threshold,
            }],
            unlocked_at: now,
        };

        let granted = achievement.clone();
        let created = self
            .store
            .run_tx(move |tx| {
                let achievement = granted.clone();
                Box::pin(async move {
                    if !tx
                        .create_as(collections::ACHIEVEMENTS, &achievement.id, &achievement)
                        .await?
                    {
                        return Ok(false);
                    }

                    let embedded = UserAchievement {
                        id: achievement.id.clone(),
                        user_id: achievement.user_id.clone(),
                        achievement_id: achievement.id.clone(),
                        kind: achievement.kind.as_str().to_string(),
                        points: achievement.points,
                        unlocked_at: achievement.unlocked_at,
                    };
                    tx.put_as(collections::USER_ACHIEVEMENTS, &embedded.id, &embedded)
                        .await?;

                    let mut points = tx
                        .find_as::<UserPoints>(collections::USER_POINTS, &achievement.user_id)
                        .await?
                        .unwrap_or(UserPoints {
                            user_id: achievement.user_id.clone(),
                            total: 0,
                            updated_at: achievement.unlocked_at,
                        });
                    points.total += achievement.points;
                    points.updated_at = achievement.unlocked_at;
                    tx.put_as(collections::USER_POINTS, &achievement.user_id, &points)
                        .await?;

                    if let Some(mut user) = tx
                        .find_as::<User>(collections::USERS, &achievement.user_id)
                        .await?
                    {
                        user.points += achievement.points;
                        user.achievements.push(embedded);
                        user.updated_at = achievement.unlocked_at;
                        tx.put_as(collections::USERS, &achievement.user_id, &user)
                            .await?;
                    }
                    Ok::<_, StoreError>(true)
                })
            })
            .await?;

        if !created {
            return Ok(None);
        }
        tracing::info!(
            user_id,
            counter = counter.as_str(),
            threshold = rule.threshold,
            points = rule.points,
            "achievement unlocked"
        );

        let notification = Notification::new(
            NotificationKind::AchievementUnlocked,
            user_id,
            "¡Nuevo logro desbloqueado!",
            format!("Has desbloqueado el logro {}", rule.name),
        )
        .with_id(format!("achievement_{}", achievement.id))
        .with_data("achievementId", achievement.id.clone())
        .with_data("points", rule.points.to_string());
        if let Err(e) = self.notifier.send(notification).await {
            tracing::warn!(error = %e, user_id, "failed to notify achievement");
        }

        Ok(Some(achievement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_store, RecordingPushSender};
    use serde_json::json;
    use std::sync::Arc;

    fn evaluator(store: &DocumentStore) -> AchievementEvaluator {
        let notifier =
            NotificationEngine::new(store.clone(), Arc::new(RecordingPushSender::default()));
        AchievementEvaluator::new(store.clone(), notifier)
    }

    #[test]
    fn test_rule_tables_are_ordered() {
        for counter in [Counter::NodeCount, Counter::InteractionCount] {
            let rules = rules_for(counter);
            assert!(rules.windows(2).all(|w| w[0].threshold < w[1].threshold));
        }
    }

    #[test]
    fn test_highest_reached() {
        assert!(highest_reached(Counter::NodeCount, 0).is_none());
        assert_eq!(highest_reached(Counter::NodeCount, 1).unwrap().threshold, 1);
        assert_eq!(highest_reached(Counter::NodeCount, 24).unwrap().threshold, 10);
        assert_eq!(highest_reached(Counter::NodeCount, 5000).unwrap().points, 1000);
        assert!(highest_reached(Counter::InteractionCount, 9).is_none());
        assert_eq!(
            highest_reached(Counter::InteractionCount, 100).unwrap().name,
            "Activo"
        );
    }

    #[test]
    fn test_achievement_id_is_deterministic() {
        let a = achievement_id("u9", Counter::NodeCount, 10);
        assert_eq!(a, achievement_id("u9", Counter::NodeCount, 10));
        assert_ne!(a, achievement_id("u9", Counter::NodeCount, 1));
        assert_ne!(a, achievement_id("u9", Counter::InteractionCount, 10));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_progression_grants_each_threshold_once() {
        let (_dir, store) = open_store().await;
        store
            .put_as(collections::USERS, "u9", &User::new("u9", "u9@example.org", "Nine", ""))
            .await
            .unwrap();
        let evaluator = evaluator(&store);

        for i in 1..=10 {
            store
                .put(collections::NODES, &format!("n{}", i), json!({"userId": "u9"}))
                .await
                .unwrap();
            evaluator.evaluate("u9", Counter::NodeCount).await.unwrap();
        }
        // replay of the last evaluation
        assert!(evaluator
            .evaluate("u9", Counter::NodeCount)
            .await
            .unwrap()
            .is_none());

        let user: User = store.get_as(collections::USERS, "u9").await.unwrap();
        assert_eq!(user.points, 150);
        assert_eq!(user.achievements.len(), 2);
        assert_eq!(
            user.points,
            user.achievements.iter().map(|a| a.points).sum::<u64>()
        );

        let points: UserPoints = store.get_as(collections::USER_POINTS, "u9").await.unwrap();
        assert_eq!(points.total, 150);

        let id = achievement_id("u9", Counter::NodeCount, 10);
        let granted: Achievement = store.get_as(collections::ACHIEVEMENTS, &id).await.unwrap();
        assert_eq!(granted.name, "Creador de Nodos");
        assert!(store
            .find(collections::NOTIFICATIONS, &format!("achievement_{}", id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_grants_credit_once() {
        let (_dir, store) = open_store().await;
        let evaluator = evaluator(&store);
        let rule = &NODE_COUNT_RULES[0];
        let (a, b) = tokio::join!(
            evaluator.grant("u1", Counter::NodeCount, rule),
            evaluator.grant("u1", Counter::NodeCount, rule),
        );
        let granted = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(granted, 1);
        let points: UserPoints = store.get_as(collections::USER_POINTS, "u1").await.unwrap();
        assert_eq!(points.total, 50);
    }
}
