//! Feed index.
//!
//! Feed items are keyed by deterministic ids and inserted only when absent, so
//! replayed events never duplicate or rewrite them. The embedded node metrics
//! are the one mutable part and converge through [`FeedIndex::update_metrics`].

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::db::{Cursor, Direction, DocumentStore, Query, StoreError, MAX_BATCH_WRITES};
use crate::models::{collections, FeedItem, NodeMetrics, NodeSnapshot, User};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

static LAST_FEED_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock unix milliseconds, strictly increasing within the process.
pub fn monotonic_millis() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_FEED_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_FEED_MILLIS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Clamp a requested page size to `1..=100`, defaulting to 10.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Position in a newest-first listing: `(createdAt, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCursor {
    pub created_at: i64,
    pub id: String,
}

impl FeedCursor {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.created_at, self.id)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (created_at, id) = raw.split_once(':')?;
        Some(Self {
            created_at: created_at.parse().ok()?,
            id: id.to_string(),
        })
    }

    fn as_store_cursor(&self) -> Cursor {
        Cursor {
            value: Value::from(self.created_at),
            id: self.id.clone(),
        }
    }
}

/// Page request: `before` cursor, or 1-based page number when no cursor is given.
#[derive(Debug, Clone, Default)]
pub struct FeedPageRequest {
    pub limit: Option<usize>,
    pub before: Option<FeedCursor>,
    pub page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
}

/// Id of the item marking a node's deletion.
pub fn tombstone_id(node_id: &str) -> String {
    format!("{}_deleted", node_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    Duplicate,
    /// The node is deleted or being deleted; nothing was written
    NodeGone,
}

#[derive(Clone)]
pub struct FeedIndex {
    store: DocumentStore,
}

impl FeedIndex {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    /// Insert the item unless one with the same id exists. Returns whether it was written.
    pub async fn append(&self, item: &FeedItem) -> Result<bool, StoreError> {
        let value = serde_json::to_value(item)?;
        self.store.create(collections::FEED, &item.id, value).await
    }

    /// Insert the item only while its node exists and carries no deletion
    /// tombstone. The check and the insert share one transaction, so nothing
    /// lands after the node's delete has committed.
    pub async fn append_for_live_node(&self, item: &FeedItem) -> Result<AppendOutcome, StoreError> {
        let value = serde_json::to_value(item)?;
        let (id, node_id) = (item.id.clone(), item.node_id.clone());
        self.store
            .run_tx(move |tx| {
                let (id, node_id, value) = (id.clone(), node_id.clone(), value.clone());
                Box::pin(async move {
                    if tx.find(collections::NODES, &node_id).await?.is_none()
                        || tx
                            .find(collections::FEED, &tombstone_id(&node_id))
                            .await?
                            .is_some()
                    {
                        return Ok(AppendOutcome::NodeGone);
                    }
                    if tx.create(collections::FEED, &id, value).await? {
                        Ok(AppendOutcome::Written)
                    } else {
                        Ok(AppendOutcome::Duplicate)
                    }
                })
            })
            .await
    }

    /// Items authored by the user or about nodes the user follows, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        request: &FeedPageRequest,
    ) -> Result<FeedPage, StoreError> {
        let limit = clamp_limit(request.limit);
        let skip = match (&request.before, request.page) {
            (None, Some(page)) if page > 1 => (page - 1) * limit,
            _ => 0,
        };
        let window = skip + limit;
        let cursor = request.before.as_ref().map(FeedCursor::as_store_cursor);

        let followed: BTreeSet<String> = self
            .store
            .find_as::<User>(collections::USERS, user_id)
            .await?
            .map(|user| user.followed_nodes)
            .unwrap_or_default();

        let mut queries = vec![Query::collection(collections::FEED).where_eq("userId", user_id)];
        let followed: Vec<Value> = followed.into_iter().map(Value::String).collect();
        for chunk in followed.chunks(MAX_BATCH_WRITES) {
            queries.push(Query::collection(collections::FEED).where_in("nodeId", chunk.to_vec()));
        }

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for query in queries {
            let query = query
                .order_by("createdAt", Direction::Desc)
                .start_after(cursor.clone())
                .limit(window + 1);
            for doc in self.store.query(&query).await? {
                if seen.insert(doc.id.clone()) {
                    items.push(doc.into_decoded::<FeedItem>()?);
                }
            }
        }

        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let has_more = items.len() > window;
        let items: Vec<FeedItem> = items.into_iter().skip(skip).take(limit).collect();
        let next_cursor = if has_more {
            items.last().map(|last| {
                FeedCursor {
                    created_at: last.created_at,
                    id: last.id.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(FeedPage { items, next_cursor })
    }

    /// Delete every item referencing the node, one batch at a time.
    pub async fn delete_by_node(&self, node_id: &str) -> Result<usize, StoreError> {
        let query = Query::collection(collections::FEED)
            .where_eq("nodeId", node_id)
            .limit(MAX_BATCH_WRITES);
        let mut deleted = 0;
        loop {
            let docs = self.store.query(&query).await?;
            if docs.is_empty() {
                break;
            }
            let mut batch = self.store.batch();
            for doc in &docs {
                batch.delete(collections::FEED, &doc.id);
            }
            deleted += batch.commit().await?;
        }
        if deleted > 0 {
            tracing::info!(node_id, deleted, "feed items purged");
        }
        Ok(deleted)
    }

    /// Rewrite the embedded node metrics of every item referencing the node.
    ///
    /// A snapshot taken from a newer node state replaces older ones; equal
    /// states merge field-wise by maximum. Returns the number of items changed.
    pub async fn update_metrics(
        &self,
        node_id: &str,
        metrics: NodeMetrics,
        followers_count: u64,
        source_updated_at: i64,
    ) -> Result<usize, StoreError> {
        let mut pager = self.store.pager(
            Query::collection(collections::FEED).where_eq("nodeId", node_id),
            MAX_BATCH_WRITES,
        );
        let mut updated = 0;
        while let Some(page) = pager.next_page().await? {
            let ids: Vec<String> = page.into_iter().map(|doc| doc.id).collect();
            updated += self
                .store
                .run_tx(move |tx| {
                    let ids = ids.clone();
                    Box::pin(async move {
                        let mut changed = 0;
                        for id in ids {
                            let Some(mut item) =
                                tx.find_as::<FeedItem>(collections::FEED, &id).await?
                            else {
                                continue;
                            };
                            let Some(snapshot) = item.payload.node_snapshot_mut() else {
                                continue;
                            };
                            if reconcile(snapshot, &metrics, followers_count, source_updated_at) {
                                tx.put_as(collections::FEED, &id, &item).await?;
                                changed += 1;
                            }
                        }
                        Ok::<_, StoreError>(changed)
                    })
                })
                .await?;
        }
        Ok(updated)
    }
}

/// Apply a metrics observation to a snapshot. Returns whether anything changed.
fn reconcile(
    snapshot: &mut NodeSnapshot,
    metrics: &NodeMetrics,
    followers_count: u64,
    source_updated_at: i64,
) -> bool {
    let before = (snapshot.metrics, snapshot.followers_count, snapshot.metrics_updated_at);
    if source_updated_at > snapshot.metrics_updated_at {
        snapshot.metrics = *metrics;
        snapshot.followers_count = followers_count;
        snapshot.metrics_updated_at = source_updated_at;
    } else if source_updated_at == snapshot.metrics_updated_at {
        snapshot.metrics = snapshot.metrics.max(metrics);
        snapshot.followers_count = snapshot.followers_count.max(followers_count);
    }
    before != (snapshot.metrics, snapshot.followers_count, snapshot.metrics_updated_at)
}
