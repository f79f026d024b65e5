//! Periodic maintenance: daily cleanup and statistics, weekly digests.
//!
//! Each job holds its own lock for the whole run; a tick that finds the lock
//! taken is skipped rather than queued.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::blob::{BlobError, BlobStore};
use crate::config::SchedulerConfig;
use crate::db::{Direction, DocumentStore, FilterOp, Query, StoreError, MAX_BATCH_WRITES};
use crate::models::{collections, Node, Notification, NotificationKind, TempFile, UserActivity};
use crate::notify::NotificationEngine;

pub const NOTIFICATION_TTL_DAYS: i64 = 30;
pub const TEMP_FILE_TTL_HOURS: i64 = 24;
pub const DIGEST_WINDOW_DAYS: i64 = 7;
pub const POPULAR_NODES: usize = 5;

const DAILY_STATS_ID: &str = "daily";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub total_nodes: u64,
    pub active_users: u64,
    pub total_interactions: u64,
    /// `YYYY-MM-DD` of the run
    pub date: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyReport {
    pub notifications_purged: usize,
    pub stats: Option<DailyStats>,
    pub temp_files_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestReport {
    pub users: usize,
    pub sent: usize,
}

/// Digest notification id for a user and the ISO week containing `now`.
pub fn digest_id(user_id: &str, now: DateTime<Utc>) -> String {
    let week = now.iso_week();
    format!("digest_{}_{}-W{:02}", user_id, week.year(), week.week())
}

pub struct Scheduler {
    store: DocumentStore,
    notifier: NotificationEngine,
    blobs: Arc<dyn BlobStore>,
    config: SchedulerConfig,
    daily_lock: Mutex<()>,
    weekly_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        store: DocumentStore,
        notifier: NotificationEngine,
        blobs: Arc<dyn BlobStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            blobs,
            config,
            daily_lock: Mutex::new(()),
            weekly_lock: Mutex::new(()),
        }
    }

    /// Fire both jobs on their intervals until `shutdown`. Runs are spawned so a
    /// slow daily job never delays the weekly tick; in-flight runs are awaited
    /// before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("scheduler disabled");
            return;
        }
        let mut daily = tokio::time::interval_at(
            Instant::now() + self.config.daily_interval,
            self.config.daily_interval,
        );
        daily.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut weekly = tokio::time::interval_at(
            Instant::now() + self.config.weekly_interval,
            self.config.weekly_interval,
        );
        weekly.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            daily = ?self.config.daily_interval,
            weekly = ?self.config.weekly_interval,
            "scheduler started"
        );
        let mut runs = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = daily.tick() => {
                    let scheduler = self.clone();
                    runs.spawn(async move {
                        if let Err(e) = scheduler.run_daily(Utc::now()).await {
                            tracing::error!(error = %e, "daily job failed");
                        }
                    });
                }
                _ = weekly.tick() => {
                    let scheduler = self.clone();
                    runs.spawn(async move {
                        if let Err(e) = scheduler.run_weekly_digest(Utc::now()).await {
                            tracing::error!(error = %e, "weekly digest failed");
                        }
                    });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "scheduled job panicked");
                    }
                }
            }
        }

        if !runs.is_empty() {
            tracing::info!(in_flight = runs.len(), "waiting for scheduled jobs");
        }
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "scheduled job panicked");
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Daily maintenance. Each step runs even when an earlier one failed.
    /// `None` when a previous run is still in progress.
    pub async fn run_daily(&self, now: DateTime<Utc>) -> Result<Option<DailyReport>, StoreError> {
        let Ok(_guard) = self.daily_lock.try_lock() else {
            tracing::info!("daily job still running, skipping tick");
            return Ok(None);
        };
        let mut report = DailyReport::default();

        match self
            .notifier
            .purge_older_than(now - Duration::days(NOTIFICATION_TTL_DAYS))
            .await
        {
            Ok(purged) => report.notifications_purged = purged,
            Err(e) => tracing::error!(error = %e, "failed to purge old notifications"),
        }

        match self.update_daily_stats(now).await {
            Ok(stats) => report.stats = Some(stats),
            Err(e) => tracing::error!(error = %e, "failed to update daily statistics"),
        }

        match self.clean_temp_files(now).await {
            Ok(removed) => report.temp_files_removed = removed,
            Err(e) => tracing::error!(error = %e, "failed to clean temp files"),
        }

        tracing::info!(
            notifications_purged = report.notifications_purged,
            temp_files_removed = report.temp_files_removed,
            "daily job finished"
        );
        Ok(Some(report))
    }

    async fn update_daily_stats(&self, now: DateTime<Utc>) -> Result<DailyStats, StoreError> {
        let total_nodes = self.store.count(&Query::collection(collections::NODES)).await?;
        let active_users = self
            .store
            .count(&Query::collection(collections::USERS).where_eq("active", true))
            .await?;
        let total_interactions = self
            .store
            .count(&Query::collection(collections::USER_ACTIVITY))
            .await?;

        let stats = DailyStats {
            total_nodes: total_nodes.max(0) as u64,
            active_users: active_users.max(0) as u64,
            total_interactions: total_interactions.max(0) as u64,
            date: now.format("%Y-%m-%d").to_string(),
            updated_at: now,
        };
        self.store
            .put_as(collections::STATISTICS, DAILY_STATS_ID, &stats)
            .await?;
        Ok(stats)
    }

    /// Remove temp uploads older than a day, blob first. A record whose blob
    /// could not be removed stays for the next run.
    async fn clean_temp_files(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = (now - Duration::hours(TEMP_FILE_TTL_HOURS)).timestamp_millis();
        let mut pager = self.store.pager(
            Query::collection(collections::TEMP_FILES).filter("createdAt", FilterOp::Lt, cutoff),
            MAX_BATCH_WRITES,
        );
        let mut removed = 0;
        while let Some(page) = pager.next_page().await? {
            let mut batch = self.store.batch();
            for doc in page {
                let id = doc.id.clone();
                let file: TempFile = match doc.into_decoded() {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "dropping malformed temp file record");
                        batch.delete(collections::TEMP_FILES, &id);
                        continue;
                    }
                };
                match self.blobs.delete(&file.path).await {
                    Ok(()) | Err(BlobError::NotFound(_)) => {
                        batch.delete(collections::TEMP_FILES, &id);
                    }
                    Err(e) => {
                        tracing::warn!(path = %file.path, error = %e, "failed to delete temp file");
                    }
                }
            }
            removed += batch.commit().await?;
        }
        Ok(removed)
    }

    /// One digest notification per active user for the current ISO week.
    pub async fn run_weekly_digest(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DigestReport>, StoreError> {
        let Ok(_guard) = self.weekly_lock.try_lock() else {
            tracing::info!("weekly digest still running, skipping tick");
            return Ok(None);
        };

        let week_ago = now - Duration::days(DIGEST_WINDOW_DAYS);
        let popular: Vec<serde_json::Value> = self
            .store
            .query_as::<Node>(
                &Query::collection(collections::NODES)
                    .order_by("followersCount", Direction::Desc)
                    .limit(POPULAR_NODES),
            )
            .await?
            .into_iter()
            .map(|node| {
                json!({
                    "id": node.id,
                    "title": node.title,
                    "type": node.node_type,
                    "followersCount": node.followers_count,
                })
            })
            .collect();

        let mut report = DigestReport::default();
        let mut users = self.store.pager(
            Query::collection(collections::USERS).where_eq("active", true),
            100,
        );
        while let Some(page) = users.next_page().await? {
            for doc in page {
                report.users += 1;
                let user_id = doc.id;
                let interactions = match self.weekly_activity(&user_id, week_ago).await {
                    Ok(counts) => counts,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "failed to build digest");
                        continue;
                    }
                };
                let notification = Notification::new(
                    NotificationKind::WeeklyDigest,
                    &user_id,
                    "Tu resumen semanal",
                    "Aquí está tu resumen de actividad de la semana",
                )
                .with_id(digest_id(&user_id, now))
                .with_data(
                    "period",
                    json!({
                        "from": week_ago.timestamp_millis(),
                        "to": now.timestamp_millis(),
                    }),
                )
                .with_data("activity", json!({ "interactions": interactions }))
                .with_data("popularNodes", popular.clone());
                match self.notifier.send(notification).await {
                    Ok(true) => report.sent += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(user_id = %user_id, error = %e, "failed to send digest"),
                }
            }
        }

        tracing::info!(users = report.users, sent = report.sent, "weekly digest finished");
        Ok(Some(report))
    }

    async fn weekly_activity(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, u64>, StoreError> {
        let activity = self
            .store
            .pager(
                Query::collection(collections::USER_ACTIVITY)
                    .where_eq("userId", user_id)
                    .filter("createdAt", FilterOp::Ge, since.timestamp_millis()),
                MAX_BATCH_WRITES,
            )
            .collect_all()
            .await?;
        let mut counts = BTreeMap::new();
        for doc in activity {
            let entry: UserActivity = doc.into_decoded()?;
            *counts.entry(entry.kind.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
