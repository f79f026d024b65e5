//! Shared fixtures for unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::auth::IdentityClient;
use crate::blob::LocalBlobStore;
use crate::config::Config;
use crate::db::{init_database, DocumentStore};
use crate::events::EventLog;
use crate::notify::{MulticastResult, PushError, PushFailure, PushMessage, PushSender};

pub const TEST_SIGNING_KEY: &[u8] = b"test-signing-key";

/// Fresh document store in a temporary directory.
pub async fn open_store() -> (TempDir, DocumentStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("Failed to init database");
    let events = EventLog::new(pool.clone());
    (dir, DocumentStore::new(pool, events))
}

/// Fresh blob store sharing its outbox with the returned event log.
pub async fn open_blobs() -> (TempDir, EventLog, LocalBlobStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("Failed to init database");
    let events = EventLog::new(pool.clone());
    let blobs = LocalBlobStore::open(
        pool,
        events.clone(),
        &dir.path().join("blobs"),
        "test-bucket",
        "http://localhost:8080",
        TEST_SIGNING_KEY,
    )
    .await
    .expect("Failed to open blob store");
    (dir, events, blobs)
}

/// Configuration rooted in `dir`, with the scheduler off.
pub fn test_config(dir: &Path) -> Config {
    let vars: HashMap<String, String> = [
        ("HOST", "127.0.0.1".to_string()),
        ("PORT", "0".to_string()),
        ("IDENTITY_PROJECT_ID", "nodo-test".to_string()),
        ("IDENTITY_PRIVATE_KEY", "test-private-key".to_string()),
        ("IDENTITY_CLIENT_EMAIL", "svc@nodo-test.iam".to_string()),
        ("JWT_SECRET", "test-jwt-secret".to_string()),
        ("AUTH_WEBHOOK_SECRET", "test-webhook-secret".to_string()),
        ("BLOB_SIGNING_KEY", "test-signing-key".to_string()),
        ("DATABASE_PATH", dir.join("test.db").display().to_string()),
        ("BLOB_ROOT", dir.join("blobs").display().to_string()),
        ("DISPATCH_POLL_INTERVAL", "50ms".to_string()),
        ("DISPATCH_MAX_ATTEMPTS", "3".to_string()),
        ("TRIGGER_TIMEOUT", "10s".to_string()),
        ("SCHEDULER_ENABLED", "false".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    Config::from_map(&vars).expect("Failed to build test config")
}

/// Fully wired services over a temporary directory, without the HTTP layer.
pub struct TestPlatform {
    pub dir: TempDir,
    pub push: Arc<RecordingPushSender>,
    pub app: crate::App,
}

impl Deref for TestPlatform {
    type Target = crate::AppState;

    fn deref(&self) -> &Self::Target {
        &self.app.state
    }
}

impl TestPlatform {
    pub fn dispatcher(&self) -> &crate::triggers::Dispatcher {
        &self.app.dispatcher
    }
}

pub async fn open_platform() -> TestPlatform {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(dir.path());
    let push = Arc::new(RecordingPushSender::default());
    let identity = Arc::new(IdentityClient::new(&config));
    let app = crate::assemble(config, push.clone(), identity)
        .await
        .expect("Failed to assemble app");
    TestPlatform { dir, push, app }
}

/// Push sender that records every message and fails chosen tokens.
#[derive(Default)]
pub struct RecordingPushSender {
    sent: Mutex<Vec<PushMessage>>,
    unregistered: Mutex<HashSet<String>>,
}

impl RecordingPushSender {
    pub fn mark_unregistered(&self, token: &str) {
        self.unregistered.lock().unwrap().insert(token.to_string());
    }

    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastResult, PushError> {
        self.sent.lock().unwrap().push(message.clone());
        let unregistered = self.unregistered.lock().unwrap().clone();
        let mut result = MulticastResult::default();
        for token in &message.tokens {
            if unregistered.contains(token) {
                result
                    .failures
                    .push((token.clone(), PushFailure::Unregistered));
            } else {
                result.success_count += 1;
            }
        }
        Ok(result)
    }
}
