//! Platform triggers: the effects of node, product, activity, auth and blob events.
//!
//! Every effect is insert-if-absent under a deterministic id, a convergent
//! merge, or guarded by an existence check, so redelivery is harmless. Errors
//! in primary effects propagate for a retry; notification failures are logged.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{EventContext, TriggerError, TriggerHandler};
use crate::achievements::AchievementEvaluator;
use crate::api::next_updated_at;
use crate::db::{DocumentStore, StoreError};
use crate::events::{AuthEvent, AuthEventKind, BlobEventKind, ChangeKind, DocumentChange, TriggerEvent};
use crate::feed::{monotonic_millis, tombstone_id, AppendOutcome, FeedIndex};
use crate::models::{
    collections, ApprovalStatus, Counter, FeedItem, FeedPayload, Node, NodeSnapshot, Notification,
    NotificationKind, Product, ProductSnapshot, User, UserActivity,
};
use crate::notify::NotificationEngine;
use crate::thumbnails::ThumbnailPipeline;

const FIRST_FOLLOWER_MILESTONE: u64 = 100;

/// Follower milestones (100, 1000, ...) crossed going from `old` to `new`.
pub fn crossed_milestones(old: u64, new: u64) -> Vec<u64> {
    let mut crossed = Vec::new();
    let mut milestone = FIRST_FOLLOWER_MILESTONE;
    while milestone <= new {
        if old < milestone {
            crossed.push(milestone);
        }
        match milestone.checked_mul(10) {
            Some(next) => milestone = next,
            None => break,
        }
    }
    crossed
}

#[derive(Clone)]
pub struct PlatformTriggers {
    store: DocumentStore,
    feed: FeedIndex,
    notifier: NotificationEngine,
    achievements: AchievementEvaluator,
    thumbnails: ThumbnailPipeline,
}

#[async_trait]
impl TriggerHandler for PlatformTriggers {
    async fn handle(&self, ctx: &EventContext, event: &TriggerEvent) -> Result<(), TriggerError> {
        match event {
            TriggerEvent::Document(change) => self.process_document(ctx, change).await,
            TriggerEvent::Blob(blob) => {
                match blob.kind {
                    BlobEventKind::Finalized => {
                        self.thumbnails.on_finalized(blob).await?;
                    }
                    BlobEventKind::Deleted => {
                        self.thumbnails.on_deleted(blob).await?;
                    }
                }
                Ok(())
            }
            TriggerEvent::Auth(auth) => self.process_auth(auth).await,
        }
    }
}

impl PlatformTriggers {
    pub fn new(
        store: DocumentStore,
        feed: FeedIndex,
        notifier: NotificationEngine,
        achievements: AchievementEvaluator,
        thumbnails: ThumbnailPipeline,
    ) -> Self {
        Self {
            store,
            feed,
            notifier,
            achievements,
            thumbnails,
        }
    }

    /// Collections whose changes this handler consumes.
    pub fn watched_collections() -> [&'static str; 3] {
        [collections::NODES, collections::PRODUCTS, collections::USER_ACTIVITY]
    }

    async fn process_document(
        &self,
        ctx: &EventContext,
        change: &DocumentChange,
    ) -> Result<(), TriggerError> {
        match (change.collection_path.as_str(), change.kind) {
            (collections::NODES, ChangeKind::Create) => {
                let Some(node) = decode::<Node>(change, change.new_value.as_ref()) else {
                    return Ok(());
                };
                self.process_node_created(ctx, node).await
            }
            (collections::NODES, ChangeKind::Update) => {
                let (Some(old), Some(new)) = (
                    decode::<Node>(change, change.old_value.as_ref()),
                    decode::<Node>(change, change.new_value.as_ref()),
                ) else {
                    return Ok(());
                };
                self.process_node_updated(ctx, change, old, new).await
            }
            (collections::NODES, ChangeKind::Delete) => {
                let Some(node) = decode::<Node>(change, change.old_value.as_ref()) else {
                    return Ok(());
                };
                self.process_node_deleted(ctx, node).await
            }
            (collections::PRODUCTS, ChangeKind::Create) => {
                let Some(product) = decode::<Product>(change, change.new_value.as_ref()) else {
                    return Ok(());
                };
                self.process_product_created(ctx, product).await
            }
            (collections::USER_ACTIVITY, ChangeKind::Create) => {
                let Some(activity) = decode::<UserActivity>(change, change.new_value.as_ref()) else {
                    return Ok(());
                };
                self.achievements
                    .evaluate(&activity.user_id, Counter::InteractionCount)
                    .await?;
                Ok(())
            }
            (collection, kind) => {
                tracing::debug!(collection, kind = kind.as_str(), "no trigger for change");
                Ok(())
            }
        }
    }

    async fn process_node_created(&self, ctx: &EventContext, node: Node) -> Result<(), TriggerError> {
        tracing::info!(node_id = %node.id, owner = %node.user_id, "processing node creation");

        let appended = self
            .feed
            .append_for_live_node(&FeedItem {
                id: format!("{}_created", node.id),
                node_id: node.id.clone(),
                user_id: node.user_id.clone(),
                payload: FeedPayload::NodeCreated(NodeSnapshot::from(&node)),
                created_at: monotonic_millis(),
            })
            .await?;
        if appended == AppendOutcome::NodeGone {
            tracing::info!(node_id = %node.id, "node gone before create trigger ran");
            return Ok(());
        }

        self.achievements
            .evaluate(&node.user_id, Counter::NodeCount)
            .await?;

        match self.owner_followers(&node.user_id).await {
            Ok(followers) if !followers.is_empty() => {
                let owner_name = self.display_name(&node.user_id).await;
                let template = Notification::new(
                    NotificationKind::NodeCreated,
                    "",
                    "Nuevo nodo",
                    format!("{} creó el nodo {}", owner_name, node.title),
                )
                .with_data("nodeID", node.id.clone())
                .with_data("nodeType", node.node_type.as_str());
                self.notify_many(&followers, &template, &ctx.event_id).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(node_id = %node.id, error = %e, "failed to load owner followers"),
        }
        Ok(())
    }

    async fn process_node_updated(
        &self,
        ctx: &EventContext,
        change: &DocumentChange,
        old: Node,
        new: Node,
    ) -> Result<(), TriggerError> {
        if self.store.find(collections::NODES, &new.id).await?.is_none() {
            tracing::info!(node_id = %new.id, "node gone before update trigger ran");
            return Ok(());
        }

        if change.field_changed("title") || change.field_changed("description") {
            let appended = self
                .feed
                .append_for_live_node(&FeedItem {
                    id: format!("{}_updated_{}", new.id, ctx.event_id),
                    node_id: new.id.clone(),
                    user_id: new.user_id.clone(),
                    payload: FeedPayload::NodeUpdated(NodeSnapshot::from(&new)),
                    created_at: monotonic_millis(),
                })
                .await?;
            if appended == AppendOutcome::NodeGone {
                tracing::info!(node_id = %new.id, "node deleted while update trigger ran");
                return Ok(());
            }

            let followers: Vec<String> = new.followers.iter().cloned().collect();
            if !followers.is_empty() {
                let template = Notification::new(
                    NotificationKind::NodeUpdated,
                    "",
                    "Nodo actualizado",
                    format!("El nodo {} tiene novedades", new.title),
                )
                .with_data("nodeID", new.id.clone())
                .with_data("nodeType", new.node_type.as_str());
                self.notify_many(&followers, &template, &ctx.event_id).await;
            }
        }

        if change.field_changed("metrics") || change.field_changed("followersCount") {
            let updated = self
                .feed
                .update_metrics(
                    &new.id,
                    new.metrics,
                    new.followers_count,
                    new.updated_at.timestamp_millis(),
                )
                .await?;
            tracing::debug!(node_id = %new.id, updated, "feed metrics refreshed");

            for milestone in crossed_milestones(old.followers_count, new.followers_count) {
                let notification = Notification::new(
                    NotificationKind::AchievementFollowers,
                    &new.user_id,
                    "¡Nuevo hito!",
                    format!("Tu nodo {} alcanzó {} seguidores", new.title, milestone),
                )
                .with_id(format!("{}_followers_{}", new.id, milestone))
                .with_data("nodeID", new.id.clone())
                .with_data("followers", milestone.to_string());
                if let Err(e) = self.notifier.send(notification).await {
                    tracing::warn!(node_id = %new.id, milestone, error = %e, "failed to notify milestone");
                }
            }
        }
        Ok(())
    }

    async fn process_node_deleted(&self, ctx: &EventContext, node: Node) -> Result<(), TriggerError> {
        tracing::info!(node_id = %node.id, followers = node.followers.len(), "processing node deletion");

        let tombstone = FeedItem {
            id: tombstone_id(&node.id),
            node_id: node.id.clone(),
            user_id: node.user_id.clone(),
            payload: FeedPayload::NodeDeleted(NodeSnapshot::from(&node)),
            created_at: monotonic_millis(),
        };
        if let Err(e) = self.feed.append(&tombstone).await {
            tracing::warn!(node_id = %node.id, error = %e, "failed to write deletion feed item");
        }

        let followers: Vec<String> = node.followers.iter().cloned().collect();
        if !followers.is_empty() {
            let template = Notification::new(
                NotificationKind::NodeDeleted,
                "",
                "Nodo eliminado",
                format!("El nodo {} fue eliminado", node.title),
            )
            .with_data("nodeID", node.id.clone())
            .with_data("nodeType", node.node_type.as_str());
            self.notify_many(&followers, &template, &ctx.event_id).await;
        }

        self.detach_followers(&node).await?;
        self.feed.delete_by_node(&node.id).await?;
        Ok(())
    }

    /// Drop the deleted node from follower and owner profiles, and its follower records.
    async fn detach_followers(&self, node: &Node) -> Result<(), StoreError> {
        let node_id = node.id.clone();
        let owner = node.user_id.clone();
        let followers: Vec<String> = node.followers.iter().cloned().collect();
        for chunk in followers.chunks(crate::db::MAX_BATCH_WRITES / 2) {
            let chunk = chunk.to_vec();
            let node_id = node_id.clone();
            self.store
                .run_tx(move |tx| {
                    let (chunk, node_id) = (chunk.clone(), node_id.clone());
                    Box::pin(async move {
                        let records = collections::node_followers(&node_id);
                        for user_id in chunk {
                            if let Some(mut user) = tx.find_as::<User>(collections::USERS, &user_id).await? {
                                if user.followed_nodes.remove(&node_id) {
                                    tx.put_as(collections::USERS, &user_id, &user).await?;
                                }
                            }
                            tx.delete(&records, &user_id).await?;
                        }
                        Ok::<_, StoreError>(())
                    })
                })
                .await?;
        }

        self.store
            .run_tx(move |tx| {
                let (owner, node_id) = (owner.clone(), node_id.clone());
                Box::pin(async move {
                    if let Some(mut user) = tx.find_as::<User>(collections::USERS, &owner).await? {
                        if user.nodes.remove(&node_id) {
                            tx.put_as(collections::USERS, &owner, &user).await?;
                        }
                    }
                    Ok::<_, StoreError>(())
                })
            })
            .await
    }

    async fn process_product_created(
        &self,
        ctx: &EventContext,
        product: Product,
    ) -> Result<(), TriggerError> {
        let appended = self
            .feed
            .append_for_live_node(&FeedItem {
                id: format!("{}_linked", product.id),
                node_id: product.node_id.clone(),
                user_id: product.user_id.clone(),
                payload: FeedPayload::ProductLinked(ProductSnapshot::from(&product)),
                created_at: monotonic_millis(),
            })
            .await?;
        if appended == AppendOutcome::NodeGone {
            tracing::info!(product_id = %product.id, node_id = %product.node_id, "product linked to a deleted node");
            return Ok(());
        }

        if product.approval_status != ApprovalStatus::Pending {
            return Ok(());
        }
        let Some(node) = self.store.find_as::<Node>(collections::NODES, &product.node_id).await? else {
            return Ok(());
        };
        let notification = Notification::new(
            NotificationKind::ProductPending,
            &node.user_id,
            "Producto pendiente de aprobación",
            format!("{} quiere vincularse a {}", product.name, node.title),
        )
        .with_id(format!("{}_{}", ctx.event_id, node.user_id))
        .with_data("nodeID", node.id.clone())
        .with_data("productID", product.id.clone());
        if let Err(e) = self.notifier.send(notification).await {
            tracing::warn!(product_id = %product.id, error = %e, "failed to notify pending product");
        }
        Ok(())
    }

    async fn process_auth(&self, auth: &AuthEvent) -> Result<(), TriggerError> {
        let uid = auth.user.uid.clone();
        match auth.kind {
            AuthEventKind::Created => {
                let profile = User::new(
                    &uid,
                    &auth.user.email,
                    &auth.user.display_name,
                    &auth.user.photo_url,
                );
                let created = self
                    .store
                    .create(collections::USERS, &uid, serde_json::to_value(&profile).map_err(StoreError::from)?)
                    .await?;
                if created {
                    tracing::info!(user_id = %uid, "user profile created");
                }

                let name = if profile.display_name.is_empty() {
                    "a Nodo".to_string()
                } else {
                    format!("a Nodo, {}", profile.display_name)
                };
                let welcome = Notification::new(
                    NotificationKind::Welcome,
                    &uid,
                    "¡Bienvenido!",
                    format!("Bienvenido {}", name),
                )
                .with_id(format!("welcome_{}", uid));
                if let Err(e) = self.notifier.send(welcome).await {
                    tracing::warn!(user_id = %uid, error = %e, "failed to send welcome notification");
                }
                Ok(())
            }
            AuthEventKind::Deleted => {
                let followed = match self.store.find_as::<User>(collections::USERS, &uid).await {
                    Ok(user) => user.map(|u| u.followed_nodes).unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!(user_id = %uid, error = %e, "unreadable profile, skipping follower cleanup");
                        Default::default()
                    }
                };
                for node_id in followed {
                    self.drop_follower(&node_id, &uid).await?;
                }
                if self.store.delete(collections::USERS, &uid).await? {
                    tracing::info!(user_id = %uid, "user profile deleted");
                }
                Ok(())
            }
        }
    }

    /// Remove a departed user from a node's followers and follower records.
    async fn drop_follower(&self, node_id: &str, user_id: &str) -> Result<(), StoreError> {
        let (node_id, user_id) = (node_id.to_string(), user_id.to_string());
        self.store
            .run_tx(move |tx| {
                let (node_id, user_id) = (node_id.clone(), user_id.clone());
                Box::pin(async move {
                    tx.delete(&collections::node_followers(&node_id), &user_id)
                        .await?;
                    let Some(mut node) = tx.find_as::<Node>(collections::NODES, &node_id).await? else {
                        return Ok(());
                    };
                    if node.remove_follower(&user_id) {
                        node.updated_at = next_updated_at(node.updated_at);
                        tx.put_as(collections::NODES, &node_id, &node).await?;
                    }
                    Ok::<_, StoreError>(())
                })
            })
            .await
    }

    /// Users whose `following` contains `owner`.
    async fn owner_followers(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let docs = self
            .store
            .pager(
                crate::db::Query::collection(collections::USERS).array_contains("following", owner),
                crate::db::MAX_BATCH_WRITES,
            )
            .collect_all()
            .await?;
        Ok(docs.into_iter().map(|doc| doc.id).collect())
    }

    async fn display_name(&self, user_id: &str) -> String {
        match self.store.find_as::<User>(collections::USERS, user_id).await {
            Ok(Some(user)) if !user.display_name.is_empty() => user.display_name,
            _ => "Alguien".to_string(),
        }
    }

    async fn notify_many(&self, user_ids: &[String], template: &Notification, event_id: &str) {
        let report = self.notifier.send_multicast(user_ids, template, event_id).await;
        if report.persist_failed > 0 {
            tracing::warn!(
                kind = template.kind.as_str(),
                recipients = user_ids.len(),
                failed = report.persist_failed,
                "notification fan-out incomplete"
            );
        }
    }
}

/// Decode a snapshot, logging and skipping documents that do not parse.
fn decode<T: DeserializeOwned>(change: &DocumentChange, value: Option<&Value>) -> Option<T> {
    let value = value?;
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::error!(
                collection = %change.collection_path,
                document_id = %change.document_id,
                error = %e,
                "undecodable document in change event"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Query;
    use crate::events::{AuthUser, EventEnvelope};
    use crate::test_support::{open_platform, TestPlatform};
    use serde_json::json;
    use std::time::Duration;

    fn triggers(platform: &TestPlatform) -> PlatformTriggers {
        let store = platform.store.clone();
        let notifier = platform.notifier.clone();
        PlatformTriggers::new(
            store.clone(),
            platform.feed.clone(),
            notifier.clone(),
            AchievementEvaluator::new(store, notifier),
            ThumbnailPipeline::new(platform.blobs.clone()),
        )
    }

    async fn claim_all(platform: &TestPlatform) -> Vec<EventEnvelope> {
        platform
            .store
            .events()
            .claim(100, Duration::from_secs(60))
            .await
            .unwrap()
    }

    fn node_doc(owner: &str) -> Value {
        json!({
            "type": "environmental",
            "title": "Parque Limpio",
            "description": "Limpieza del parque central cada sábado",
            "userId": owner,
        })
    }

    async fn feed_items_for(platform: &TestPlatform, node_id: &str) -> i64 {
        platform
            .store
            .count(&Query::collection(collections::FEED).where_eq("nodeId", node_id))
            .await
            .unwrap()
    }

    async fn seed_user(platform: &TestPlatform, user: User) {
        platform
            .store
            .put_as(collections::USERS, &user.id.clone(), &user)
            .await
            .unwrap();
    }

    #[test]
    fn test_crossed_milestones() {
        assert!(crossed_milestones(0, 99).is_empty());
        assert_eq!(crossed_milestones(99, 100), vec![100]);
        assert!(crossed_milestones(100, 101).is_empty());
        assert_eq!(crossed_milestones(50, 1500), vec![100, 1000]);
        // decreasing counts never notify
        assert!(crossed_milestones(1000, 999).is_empty());
    }

    #[tokio::test]
    async fn test_late_events_leave_no_feed_items_for_deleted_node() {
        let platform = open_platform().await;
        let handler = triggers(&platform);
        platform.store.put(collections::NODES, "n1", node_doc("u1")).await.unwrap();
        platform
            .store
            .merge(collections::NODES, "n1", json!({ "title": "Parque Renovado" }))
            .await
            .unwrap();
        platform.store.delete(collections::NODES, "n1").await.unwrap();

        let envelopes = claim_all(&platform).await;
        assert_eq!(envelopes.len(), 3);
        let (created, updated, deleted) = (&envelopes[0], &envelopes[1], &envelopes[2]);

        // the update arrives after the deletion was processed
        for envelope in [created, deleted, updated] {
            handler
                .handle(&EventContext::from(envelope), &envelope.event)
                .await
                .unwrap();
        }
        assert_eq!(feed_items_for(&platform, "n1").await, 0);

        // a product linked to the deleted node is not announced either
        platform
            .store
            .put(
                collections::PRODUCTS,
                "p1",
                json!({
                    "storeId": "s1",
                    "nodeId": "n1",
                    "userId": "u2",
                    "name": "Bolsa reciclada",
                    "description": "Bolsa hecha con lonas recuperadas",
                    "price": 12.5,
                    "donationPercent": 10,
                }),
            )
            .await
            .unwrap();
        for envelope in claim_all(&platform).await {
            handler
                .handle(&EventContext::from(&envelope), &envelope.event)
                .await
                .unwrap();
        }
        assert!(platform.store.find(collections::FEED, "p1_linked").await.unwrap().is_none());
        assert_eq!(feed_items_for(&platform, "n1").await, 0);
    }

    #[tokio::test]
    async fn test_append_refused_once_tombstone_exists() {
        let platform = open_platform().await;
        platform.store.put(collections::NODES, "n1", node_doc("u1")).await.unwrap();
        let node: Node = platform.store.get_as(collections::NODES, "n1").await.unwrap();
        let item = |id: &str, payload: FeedPayload| FeedItem {
            id: id.to_string(),
            node_id: "n1".to_string(),
            user_id: "u1".to_string(),
            payload,
            created_at: monotonic_millis(),
        };

        platform
            .feed
            .append(&item(&tombstone_id("n1"), FeedPayload::NodeDeleted(NodeSnapshot::from(&node))))
            .await
            .unwrap();
        let outcome = platform
            .feed
            .append_for_live_node(&item("n1_updated_x", FeedPayload::NodeUpdated(NodeSnapshot::from(&node))))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::NodeGone);
        assert!(platform.store.find(collections::FEED, "n1_updated_x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redelivered_event_has_single_effect() {
        let platform = open_platform().await;
        let handler = triggers(&platform);
        seed_user(&platform, User::new("u1", "u1@example.org", "Ana", "")).await;
        let mut follower = User::new("u2", "u2@example.org", "Beto", "");
        follower.fcm_token = Some("t2".to_string());
        follower.following.insert("u1".to_string());
        seed_user(&platform, follower).await;
        claim_all(&platform).await;

        platform.store.put(collections::NODES, "n1", node_doc("u1")).await.unwrap();
        let envelopes = claim_all(&platform).await;
        assert_eq!(envelopes.len(), 1);
        let ctx = EventContext::from(&envelopes[0]);
        let redelivered = EventContext {
            attempt: ctx.attempt + 1,
            ..ctx.clone()
        };
        handler.handle(&ctx, &envelopes[0].event).await.unwrap();
        handler.handle(&redelivered, &envelopes[0].event).await.unwrap();

        assert_eq!(feed_items_for(&platform, "n1").await, 1);
        let notified = platform
            .store
            .count(&Query::collection(collections::NOTIFICATIONS).where_eq("userId", "u2"))
            .await
            .unwrap();
        assert_eq!(notified, 1);
        assert_eq!(platform.push.sent().len(), 1);
        let owner: User = platform.store.get_as(collections::USERS, "u1").await.unwrap();
        assert_eq!(owner.points, 50);
        assert_eq!(owner.achievements.len(), 1);
    }

    #[tokio::test]
    async fn test_follower_milestone_notifies_owner_once() {
        let platform = open_platform().await;
        let mut doc = node_doc("u1");
        doc["followersCount"] = json!(99);
        platform.store.put(collections::NODES, "n1", doc).await.unwrap();
        platform.dispatcher().drain().await.unwrap();

        platform
            .store
            .merge(collections::NODES, "n1", json!({ "followersCount": 100 }))
            .await
            .unwrap();
        platform.dispatcher().drain().await.unwrap();
        let milestone: Notification = platform
            .store
            .get_as(collections::NOTIFICATIONS, "n1_followers_100")
            .await
            .unwrap();
        assert_eq!(milestone.user_id, "u1");
        assert_eq!(milestone.data["followers"], "100");

        platform
            .store
            .merge(collections::NODES, "n1", json!({ "followersCount": 101 }))
            .await
            .unwrap();
        platform.dispatcher().drain().await.unwrap();
        let milestones = platform
            .store
            .count(
                &Query::collection(collections::NOTIFICATIONS)
                    .where_eq("type", NotificationKind::AchievementFollowers.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(milestones, 1);
    }

    #[tokio::test]
    async fn test_deleted_user_leaves_node_followers() {
        let platform = open_platform().await;
        let handler = triggers(&platform);
        let mut doc = node_doc("u1");
        doc["followers"] = json!(["u2", "u3"]);
        doc["followersCount"] = json!(2);
        platform.store.put(collections::NODES, "n1", doc).await.unwrap();
        let records = collections::node_followers("n1");
        for uid in ["u2", "u3"] {
            platform
                .store
                .put(&records, uid, json!({ "userId": uid }))
                .await
                .unwrap();
        }
        let mut departing = User::new("u2", "u2@example.org", "Beto", "");
        departing.followed_nodes.insert("n1".to_string());
        seed_user(&platform, departing).await;

        let event = TriggerEvent::Auth(AuthEvent {
            kind: AuthEventKind::Deleted,
            user: AuthUser {
                uid: "u2".to_string(),
                email: "u2@example.org".to_string(),
                display_name: String::new(),
                photo_url: String::new(),
            },
        });
        let ctx = EventContext {
            event_id: "auth-delete-u2".to_string(),
            attempt: 1,
        };
        handler.handle(&ctx, &event).await.unwrap();
        // redelivery finds nothing left to do
        handler.handle(&ctx, &event).await.unwrap();

        let node: Node = platform.store.get_as(collections::NODES, "n1").await.unwrap();
        assert_eq!(node.followers.iter().collect::<Vec<_>>(), vec!["u3"]);
        assert_eq!(node.followers_count, 1);
        assert_eq!(node.metrics.followers, 1);
        assert!(platform.store.find(&records, "u2").await.unwrap().is_none());
        assert!(platform.store.find(&records, "u3").await.unwrap().is_some());
        assert!(platform.store.find(collections::USERS, "u2").await.unwrap().is_none());
    }
}
