//! Request/reply correlation
//!
//! The proxy-side table of requests waiting for a reply. A reply resolves an
//! entry only when both its `answerTo` and its `connectionId` match, and each
//! entry is resolved at most once. Ids of recently finished requests are
//! remembered so duplicates and late replies can be told apart from replies
//! that never had a request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::message::Reply;
use crate::error::{ErrorKind, RemoteError, StorageError, StorageResult};

/// Number of finished request ids remembered
const FINISHED_CAPACITY: usize = 1024;

type ReplyOutcome = Result<Value, RemoteError>;

/// What happened to an incoming reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delivered to the waiting caller
    Resolved,
    /// The request was already resolved by an earlier reply
    Duplicate,
    /// The caller gave up before the reply arrived
    Late,
    /// The request id is pending, but for another connection
    ConnectionMismatch,
    /// No request with this id was ever seen
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    Resolved,
    Abandoned,
}

struct PendingEntry {
    connection_id: String,
    slot: oneshot::Sender<ReplyOutcome>,
}

#[derive(Default)]
struct TableState {
    pending: HashMap<String, PendingEntry>,
    finished: HashMap<String, Finished>,
    finished_order: VecDeque<String>,
}

impl TableState {
    fn finish(&mut self, request_id: String, how: Finished) {
        if self.finished.insert(request_id.clone(), how).is_none() {
            self.finished_order.push_back(request_id);
        }
        while self.finished_order.len() > FINISHED_CAPACITY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

/// Table of in-flight requests
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<TableState>,
    disconnected: AtomicBool,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new request for `connection_id` under a fresh request id
    pub fn register(self: &Arc<Self>, connection_id: &str) -> StorageResult<PendingRequest> {
        if self.is_disconnected() {
            return Err(StorageError::Disconnected(
                "the message bus is no longer delivering replies".to_string(),
            ));
        }

        let request_id = Uuid::new_v4().to_string();
        let (slot, receiver) = oneshot::channel();
        self.lock().pending.insert(
            request_id.clone(),
            PendingEntry {
                connection_id: connection_id.to_string(),
                slot,
            },
        );

        Ok(PendingRequest {
            request_id,
            receiver,
            table: self.clone(),
        })
    }

    /// Deliver a reply to its waiting caller
    pub fn resolve(&self, reply: Reply) -> Resolution {
        let mut state = self.lock();

        let matches = match state.pending.get(&reply.answer_to) {
            Some(entry) => entry.connection_id == reply.connection_id,
            None => {
                return match state.finished.get(&reply.answer_to) {
                    Some(Finished::Resolved) => Resolution::Duplicate,
                    Some(Finished::Abandoned) => Resolution::Late,
                    None => Resolution::Unmatched,
                };
            }
        };
        if !matches {
            return Resolution::ConnectionMismatch;
        }

        let Some(entry) = state.pending.remove(&reply.answer_to) else {
            return Resolution::Unmatched;
        };
        let delivered = entry.slot.send(reply.outcome).is_ok();
        if delivered {
            state.finish(reply.answer_to, Finished::Resolved);
            Resolution::Resolved
        } else {
            state.finish(reply.answer_to, Finished::Abandoned);
            Resolution::Late
        }
    }

    /// Drop a request whose caller stopped waiting
    pub fn abandon(&self, request_id: &str) -> bool {
        let mut state = self.lock();
        if state.pending.remove(request_id).is_some() {
            state.finish(request_id.to_string(), Finished::Abandoned);
            true
        } else {
            false
        }
    }

    /// Fail every pending request and refuse new ones
    pub fn disconnect(&self, reason: &str) -> usize {
        self.disconnected.store(true, Ordering::SeqCst);
        let mut state = self.lock();
        let drained: Vec<(String, PendingEntry)> = state.pending.drain().collect();
        let count = drained.len();
        for (request_id, entry) in drained {
            let _ = entry
                .slot
                .send(Err(RemoteError::new(ErrorKind::Disconnected, reason)));
            state.finish(request_id, Finished::Abandoned);
        }
        count
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a reply
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A registered request; dropping it abandons the request
pub struct PendingRequest {
    request_id: String,
    receiver: oneshot::Receiver<ReplyOutcome>,
    table: Arc<PendingRequests>,
}

impl PendingRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the matching reply
    pub async fn wait(mut self) -> StorageResult<Value> {
        match (&mut self.receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(StorageError::from(error)),
            Err(_) => Err(StorageError::Disconnected(format!(
                "request {} was dropped without a reply",
                self.request_id
            ))),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.abandon(&self.request_id);
    }
}
