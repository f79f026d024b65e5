//! Document store over SQLite.
//!
//! Every collection lives in the `documents` table as JSON keyed by
//! `(collection, id)`. Writes to subscribed collections append a change event
//! to the outbox inside the same transaction.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use super::query::{bind_json, Document, Query, QueryPager};
use crate::events::{DocumentChange, EventLog, TriggerEvent};

/// Writes applied atomically per batch chunk.
pub const MAX_BATCH_WRITES: usize = 500;

const MAX_TX_ATTEMPTS: u32 = 5;

/// SQLite result codes for busy/locked conditions (including extended codes).
const RETRYABLE_CODES: &[&str] = &["5", "6", "261", "262", "517"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("invalid field path `{0}`")]
    InvalidField(String),
    #[error("invalid collection path `{0}`")]
    InvalidCollection(String),
    #[error("document {0} is not a JSON object")]
    NotAnObject(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors that may succeed when the transaction is attempted again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => {
                db.code()
                    .is_some_and(|code| RETRYABLE_CODES.contains(&code.as_ref()))
                    || db.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

impl Retryable for crate::errors::AppError {
    fn is_retryable(&self) -> bool {
        crate::errors::AppError::is_retryable(self)
    }
}

/// Handle on the document collections.
#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
    events: EventLog,
    watched: Arc<RwLock<HashSet<String>>>,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool, events: EventLog) -> Self {
        Self {
            pool,
            events,
            watched: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Emit change events for writes to `collection` from now on.
    pub fn subscribe(&self, collection: &str) {
        if let Ok(mut watched) = self.watched.write() {
            watched.insert(collection.to_string());
        }
    }

    pub async fn begin(&self) -> Result<Tx, StoreError> {
        Ok(Tx {
            inner: self.pool.begin().await?,
            watched: self.watched.clone(),
            emitted: 0,
        })
    }

    /// Commit and wake the dispatcher when the transaction produced events.
    pub async fn commit(&self, tx: Tx) -> Result<(), StoreError> {
        let emitted = tx.emitted;
        tx.inner.commit().await?;
        if emitted > 0 {
            self.events.notify();
        }
        Ok(())
    }

    /// Run `f` in a transaction, retrying on lock conflicts.
    ///
    /// The closure may run several times; it must clone what it captures.
    pub async fn run_tx<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StoreError> + Retryable + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.begin().await {
                Ok(mut tx) => {
                    let result = f(&mut tx).await;
                    match result {
                        Ok(value) => self.commit(tx).await.map(|_| value).map_err(E::from),
                        // dropping the transaction rolls it back
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(E::from(e)),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < MAX_TX_ATTEMPTS => {
                    tracing::debug!(attempt, "transaction conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(25 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }

    // ==================== READS ====================

    pub async fn find(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_doc(&mut conn, collection, id).await
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        self.find(collection, id)
            .await?
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    pub async fn find_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.find(collection, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.get(collection, id).await?)?)
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_query(&mut conn, query).await
    }

    pub async fn query_as<T: DeserializeOwned>(&self, query: &Query) -> Result<Vec<T>, StoreError> {
        self.query(query)
            .await?
            .into_iter()
            .map(Document::into_decoded)
            .collect()
    }

    pub async fn count(&self, query: &Query) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_count(&mut conn, query).await
    }

    /// Lazy page-by-page iteration over a query.
    pub fn pager(&self, query: Query, page_size: usize) -> QueryPager {
        QueryPager::new(self.clone(), query, page_size)
    }

    // ==================== WRITES ====================

    /// Full replace. An empty id gets a generated one, which is returned.
    pub async fn put(&self, collection: &str, id: &str, value: Value) -> Result<String, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run_tx(move |tx| {
            let (collection, id, value) = (collection.clone(), id.clone(), value.clone());
            Box::pin(async move { tx.put(&collection, &id, value).await })
        })
        .await
    }

    pub async fn put_as<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<String, StoreError> {
        self.put(collection, id, serde_json::to_value(doc)?).await
    }

    /// Insert only when absent. Returns whether the document was written.
    pub async fn create(&self, collection: &str, id: &str, value: Value) -> Result<bool, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run_tx(move |tx| {
            let (collection, id, value) = (collection.clone(), id.clone(), value.clone());
            Box::pin(async move { tx.create(&collection, &id, value).await })
        })
        .await
    }

    /// Field-level merge, creating the document when absent.
    pub async fn merge(&self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run_tx(move |tx| {
            let (collection, id, partial) = (collection.clone(), id.clone(), partial.clone());
            Box::pin(async move { tx.merge(&collection, &id, partial).await })
        })
        .await
    }

    /// Delete a document. Returns whether it existed.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run_tx(move |tx| {
            let (collection, id) = (collection.clone(), id.clone());
            Box::pin(async move { tx.delete(&collection, &id).await })
        })
        .await
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch {
            store: self.clone(),
            ops: Vec::new(),
        }
    }
}

/// An open transaction. Reads observe the transaction's own writes.
pub struct Tx {
    inner: sqlx::Transaction<'static, Sqlite>,
    watched: Arc<RwLock<HashSet<String>>>,
    emitted: usize,
}

impl Tx {
    fn is_watched(&self, collection: &str) -> bool {
        self.watched
            .read()
            .map(|watched| watched.contains(collection))
            .unwrap_or(false)
    }

    pub async fn find(&mut self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        fetch_doc(&mut self.inner, collection, id).await
    }

    pub async fn get(&mut self, collection: &str, id: &str) -> Result<Value, StoreError> {
        self.find(collection, id)
            .await?
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    pub async fn find_as<T: DeserializeOwned>(
        &mut self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.find(collection, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_as<T: DeserializeOwned>(
        &mut self,
        collection: &str,
        id: &str,
    ) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.get(collection, id).await?)?)
    }

    pub async fn query(&mut self, query: &Query) -> Result<Vec<Document>, StoreError> {
        fetch_query(&mut self.inner, query).await
    }

    pub async fn count(&mut self, query: &Query) -> Result<i64, StoreError> {
        fetch_count(&mut self.inner, query).await
    }

    pub async fn put(
        &mut self,
        collection: &str,
        id: &str,
        mut value: Value,
    ) -> Result<String, StoreError> {
        validate_collection(collection)?;
        let id = if id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        value
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(id.clone()))?
            .insert("id".to_string(), Value::String(id.clone()));

        let old = self.find(collection, &id).await?;
        self.write(collection, &id, old, value).await?;
        Ok(id)
    }

    pub async fn put_as<T: Serialize>(
        &mut self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<String, StoreError> {
        self.put(collection, id, serde_json::to_value(doc)?).await
    }

    pub async fn create(
        &mut self,
        collection: &str,
        id: &str,
        mut value: Value,
    ) -> Result<bool, StoreError> {
        validate_collection(collection)?;
        if self.find(collection, id).await?.is_some() {
            return Ok(false);
        }
        value
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(id.to_string()))?
            .insert("id".to_string(), Value::String(id.to_string()));
        self.write(collection, id, None, value).await?;
        Ok(true)
    }

    pub async fn create_as<T: Serialize>(
        &mut self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<bool, StoreError> {
        self.create(collection, id, serde_json::to_value(doc)?).await
    }

    pub async fn merge(
        &mut self,
        collection: &str,
        id: &str,
        partial: Value,
    ) -> Result<(), StoreError> {
        validate_collection(collection)?;
        if !partial.is_object() {
            return Err(StoreError::NotAnObject(id.to_string()));
        }
        let old = self.find(collection, id).await?;
        let mut new = old
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "id": id }));
        merge_json(&mut new, partial);
        self.write(collection, id, old, new).await
    }

    pub async fn delete(&mut self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let Some(old) = self.find(collection, id).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *self.inner)
            .await?;
        self.emit(collection, id, Some(old), None).await?;
        Ok(true)
    }

    async fn write(
        &mut self,
        collection: &str,
        id: &str,
        old: Option<Value>,
        new: Value,
    ) -> Result<(), StoreError> {
        if old.as_ref() == Some(&new) {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::to_string(&new)?)
        .bind(now)
        .bind(now)
        .execute(&mut *self.inner)
        .await?;
        self.emit(collection, id, old, Some(new)).await
    }

    async fn emit(
        &mut self,
        collection: &str,
        id: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<(), StoreError> {
        if !self.is_watched(collection) {
            return Ok(());
        }
        let change = DocumentChange::new(collection, id, old, new);
        EventLog::record(&mut *self.inner, &TriggerEvent::Document(change)).await?;
        self.emitted += 1;
        Ok(())
    }

    async fn apply(&mut self, op: BatchOp) -> Result<(), StoreError> {
        match op {
            BatchOp::Set {
                collection,
                id,
                value,
            } => self.put(&collection, &id, value).await.map(|_| ()),
            BatchOp::Merge {
                collection,
                id,
                partial,
            } => self.merge(&collection, &id, partial).await,
            BatchOp::Delete { collection, id } => self.delete(&collection, &id).await.map(|_| ()),
        }
    }
}

#[derive(Debug, Clone)]
enum BatchOp {
    Set {
        collection: String,
        id: String,
        value: Value,
    },
    Merge {
        collection: String,
        id: String,
        partial: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Accumulated writes, committed in atomic chunks of [`MAX_BATCH_WRITES`].
pub struct WriteBatch {
    store: DocumentStore,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn set(&mut self, collection: &str, id: &str, value: Value) -> &mut Self {
        self.ops.push(BatchOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            value,
        });
        self
    }

    pub fn merge(&mut self, collection: &str, id: &str, partial: Value) -> &mut Self {
        self.ops.push(BatchOp::Merge {
            collection: collection.to_string(),
            id: id.to_string(),
            partial,
        });
        self
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every write. Chunks commit sequentially; an error stops at the failing chunk.
    pub async fn commit(self) -> Result<usize, StoreError> {
        let mut applied = 0;
        for chunk in self.ops.chunks(MAX_BATCH_WRITES) {
            let chunk = chunk.to_vec();
            let size = chunk.len();
            self.store
                .run_tx(move |tx| {
                    let chunk = chunk.clone();
                    Box::pin(async move {
                        for op in chunk {
                            tx.apply(op).await?;
                        }
                        Ok::<_, StoreError>(())
                    })
                })
                .await?;
            applied += size;
        }
        Ok(applied)
    }
}

fn validate_collection(collection: &str) -> Result<(), StoreError> {
    let valid = !collection.is_empty()
        && collection
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}

/// Recursive object merge; non-object values replace.
pub fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

async fn fetch_doc(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
) -> Result<Option<Value>, StoreError> {
    let row = sqlx::query("SELECT data FROM documents WHERE collection = ? AND id = ?")
        .bind(collection)
        .bind(id)
        .fetch_optional(conn)
        .await?;
    match row {
        Some(row) => {
            let data: String = row.get("data");
            Ok(Some(serde_json::from_str(&data)?))
        }
        None => Ok(None),
    }
}

async fn fetch_query(conn: &mut SqliteConnection, query: &Query) -> Result<Vec<Document>, StoreError> {
    let (sql, binds) = query.to_sql(false)?;
    let mut statement = sqlx::query(&sql);
    for value in &binds {
        statement = bind_json(statement, value);
    }
    let rows = statement.fetch_all(conn).await?;
    rows.into_iter()
        .map(|row| {
            let data: String = row.get("data");
            Ok(Document {
                id: row.get("id"),
                data: serde_json::from_str(&data)?,
            })
        })
        .collect()
}

async fn fetch_count(conn: &mut SqliteConnection, query: &Query) -> Result<i64, StoreError> {
    let (sql, binds) = query.to_sql(true)?;
    let mut statement = sqlx::query(&sql);
    for value in &binds {
        statement = bind_json(statement, value);
    }
    let row = statement.fetch_one(conn).await?;
    Ok(row.get("n"))
}
