//! In-memory storage engine
//!
//! A small [`Storage`] implementation used by the tests and the CLI demo.
//! Instances created for the same database and collection share their
//! documents, so writes through one instance show up in the change stream
//! of every other instance of that collection.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::types::{
    BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeEventBulk, ChangeOperation,
    ChangedDocuments, Checkpoint, CountMode, CountResult, InstanceCreationParams, PreparedQuery,
    QueryResult, SortDirection, StorageDocument, WriteError,
};
use super::{Storage, StorageInstance};
use crate::error::{StorageError, StorageResult};
use crate::remote::bus::{closed_signal, Subscribers};

/// Capacity of each collection's change-event channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

type Collections = Arc<Mutex<HashMap<String, Arc<Collection>>>>;

/// In-memory storage factory
#[derive(Clone, Default)]
pub struct MemoryStorage {
    collections: Collections,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collections currently holding state
    pub fn collection_count(&self) -> usize {
        lock(&self.collections).len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_instance(
        &self,
        params: InstanceCreationParams,
    ) -> StorageResult<Arc<dyn StorageInstance>> {
        if params.database_name.is_empty() || params.collection_name.is_empty() {
            return Err(StorageError::CreationFailed(
                "database and collection name must not be empty".to_string(),
            ));
        }

        let key = params.collection_key();
        let collection = lock(&self.collections)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Collection::new()))
            .clone();

        debug!("Created memory instance for {}", key);

        let (closed_tx, _) = watch::channel(false);
        Ok(Arc::new(MemoryInstance {
            key,
            collection,
            collections: self.collections.clone(),
            closed: AtomicBool::new(false),
            closed_tx,
        }))
    }
}

/// Shared state of one collection
struct Collection {
    state: Mutex<CollectionState>,
    changes: Subscribers<ChangeEventBulk>,
}

#[derive(Default)]
struct CollectionState {
    documents: BTreeMap<String, StorageDocument>,
    /// (document id, attachment id) -> (digest, base64 data)
    attachments: HashMap<(String, String), (String, String)>,
    last_write_time: i64,
}

impl Collection {
    fn new() -> Self {
        Self {
            state: Mutex::new(CollectionState::default()),
            changes: Subscribers::new(CHANGE_CHANNEL_CAPACITY),
        }
    }
}

impl CollectionState {
    /// Monotonic write time for the next write
    fn next_write_time(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_write_time = now.max(self.last_write_time + 1);
        self.last_write_time
    }
}

/// Instance handle on a shared collection
pub struct MemoryInstance {
    key: String,
    collection: Arc<Collection>,
    collections: Collections,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MemoryInstance {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::Closed(format!(
                "memory instance '{}' is closed",
                self.key
            )));
        }
        Ok(())
    }

    fn mark_closed(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.closed_tx.send_replace(true);
    }

    fn apply_write(
        state: &mut CollectionState,
        row: BulkWriteRow,
    ) -> Result<ChangeEvent, WriteError> {
        let BulkWriteRow {
            mut document,
            previous,
        } = row;
        let existing = state.documents.get(&document.id).cloned();

        let operation = match (&previous, &existing) {
            (None, Some(stored)) if !stored.deleted => {
                return Err(WriteError::conflict(&document.id, Some(stored.clone())));
            }
            (None, _) => ChangeOperation::Insert,
            (Some(_), None) => {
                return Err(WriteError {
                    status: 404,
                    document_id: document.id.clone(),
                    is_error: true,
                    document_in_db: None,
                });
            }
            (Some(previous), Some(stored)) if previous.rev != stored.rev => {
                return Err(WriteError::conflict(&document.id, Some(stored.clone())));
            }
            (Some(_), Some(stored)) => {
                if document.deleted {
                    ChangeOperation::Delete
                } else if stored.deleted {
                    ChangeOperation::Insert
                } else {
                    ChangeOperation::Update
                }
            }
        };

        document.last_write_time = state.next_write_time();

        if document.deleted {
            state
                .attachments
                .retain(|(doc_id, _), _| doc_id != &document.id);
        }
        for (attachment_id, meta) in document.attachments.iter_mut() {
            if let Some(data) = meta.data.take() {
                state.attachments.insert(
                    (document.id.clone(), attachment_id.clone()),
                    (meta.digest.clone(), data),
                );
            }
        }

        state
            .documents
            .insert(document.id.clone(), document.clone());

        Ok(ChangeEvent {
            operation,
            document_id: document.id.clone(),
            document_data: document,
            previous_document_data: existing,
        })
    }
}

#[async_trait]
impl StorageInstance for MemoryInstance {
    async fn bulk_write(
        &self,
        document_writes: Vec<BulkWriteRow>,
        context: &str,
    ) -> StorageResult<BulkWriteResponse> {
        self.ensure_open()?;
        let start_time = Utc::now().timestamp_millis();

        let mut response = BulkWriteResponse::default();
        let mut events = Vec::new();
        let mut state = lock(&self.collection.state);
        for row in document_writes {
            match Self::apply_write(&mut state, row) {
                Ok(event) => {
                    response.success.push(event.document_data.clone());
                    events.push(event);
                }
                Err(error) => response.error.push(error),
            }
        }

        // Published under the state lock so bulks leave in write order
        if let Some(last) = events.last() {
            let bulk = ChangeEventBulk {
                id: Uuid::new_v4().to_string(),
                checkpoint: Checkpoint::of(&last.document_data),
                events,
                context: context.to_string(),
                start_time,
                end_time: Utc::now().timestamp_millis(),
            };
            self.collection.changes.publish(bulk);
        }
        drop(state);

        Ok(response)
    }

    async fn find_documents_by_id(
        &self,
        ids: Vec<String>,
        with_deleted: bool,
    ) -> StorageResult<Vec<StorageDocument>> {
        self.ensure_open()?;
        let state = lock(&self.collection.state);
        Ok(ids
            .iter()
            .filter_map(|id| state.documents.get(id))
            .filter(|doc| with_deleted || !doc.deleted)
            .cloned()
            .collect())
    }

    async fn query(&self, query: PreparedQuery) -> StorageResult<QueryResult> {
        self.ensure_open()?;
        let state = lock(&self.collection.state);

        let mut documents: Vec<StorageDocument> = state
            .documents
            .values()
            .filter(|doc| matches_selector(doc, &query))
            .cloned()
            .collect();
        documents.sort_by(|a, b| compare_documents(a, b, &query));

        let documents = documents
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(QueryResult { documents })
    }

    async fn count(&self, query: PreparedQuery) -> StorageResult<CountResult> {
        self.ensure_open()?;
        let state = lock(&self.collection.state);
        let count = state
            .documents
            .values()
            .filter(|doc| matches_selector(doc, &query))
            .count();
        Ok(CountResult {
            count,
            mode: CountMode::Fast,
        })
    }

    async fn get_attachment_data(
        &self,
        document_id: &str,
        attachment_id: &str,
        digest: &str,
    ) -> StorageResult<String> {
        self.ensure_open()?;
        let state = lock(&self.collection.state);
        match state
            .attachments
            .get(&(document_id.to_string(), attachment_id.to_string()))
        {
            Some((stored_digest, data)) if stored_digest == digest => Ok(data.clone()),
            _ => Err(StorageError::NotFound(format!(
                "attachment '{}' of document '{}' with digest '{}'",
                attachment_id, document_id, digest
            ))),
        }
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<Checkpoint>,
    ) -> StorageResult<ChangedDocuments> {
        self.ensure_open()?;
        let state = lock(&self.collection.state);

        let mut documents: Vec<StorageDocument> = state
            .documents
            .values()
            .filter(|doc| match &checkpoint {
                Some(cp) => {
                    doc.last_write_time > cp.lwt
                        || (doc.last_write_time == cp.lwt && doc.id > cp.id)
                }
                None => true,
            })
            .cloned()
            .collect();
        documents.sort_by(|a, b| {
            a.last_write_time
                .cmp(&b.last_write_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        documents.truncate(limit);

        let checkpoint = documents.last().map(Checkpoint::of).or(checkpoint);
        Ok(ChangedDocuments {
            documents,
            checkpoint,
        })
    }

    fn change_stream(&self) -> BoxStream<'static, ChangeEventBulk> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return stream::empty().boxed();
        }
        let closed = closed_signal(self.closed_tx.subscribe());
        self.collection
            .changes
            .subscribe()
            .take_until(closed)
            .boxed()
    }

    async fn cleanup(&self, minimum_deleted_time: i64) -> StorageResult<bool> {
        self.ensure_open()?;
        let threshold = Utc::now().timestamp_millis() - minimum_deleted_time;
        let mut state = lock(&self.collection.state);

        let before = state.documents.len();
        state
            .documents
            .retain(|_, doc| !(doc.deleted && doc.last_write_time < threshold));
        debug!(
            "Cleanup of {} purged {} documents",
            self.key,
            before - state.documents.len()
        );
        Ok(true)
    }

    async fn close(&self) -> StorageResult<()> {
        self.mark_closed();
        Ok(())
    }

    async fn remove(&self) -> StorageResult<()> {
        self.ensure_open()?;
        lock(&self.collections).remove(&self.key);
        {
            let mut state = lock(&self.collection.state);
            state.documents.clear();
            state.attachments.clear();
        }
        self.mark_closed();
        Ok(())
    }
}

/// Field lookup that also exposes the primary key as `id`
fn field_value<'a>(doc: &'a StorageDocument, field: &str) -> Option<Cow<'a, Value>> {
    if field == "id" {
        return Some(Cow::Owned(Value::String(doc.id.clone())));
    }
    doc.field(field).map(Cow::Borrowed)
}

fn matches_selector(doc: &StorageDocument, query: &PreparedQuery) -> bool {
    !doc.deleted
        && query
            .selector
            .iter()
            .all(|(field, expected)| field_value(doc, field).as_deref() == Some(expected))
}

fn compare_documents(a: &StorageDocument, b: &StorageDocument, query: &PreparedQuery) -> Ordering {
    for sort in &query.sort {
        let left = field_value(a, &sort.field);
        let right = field_value(b, &sort.field);
        let ordering = compare_values(left.as_deref(), right.as_deref());
        let ordering = match sort.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Lock a mutex, recovering the data if a writer panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
