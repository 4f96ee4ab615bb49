//! Connection registry
//!
//! Exposer-side map from connection id to live session. The registry is
//! owned by the exposer loop alone, so it needs no locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::{InstanceCreationParams, StorageInstance};

/// Open/shut switch shared by a forwarding task and its session
///
/// Sends go through [`ForwardGate::pass`] and hold the lock while sending,
/// so once [`ForwardGate::shut`] returns no further send can start.
#[derive(Clone)]
pub struct ForwardGate {
    open: Arc<Mutex<bool>>,
}

impl ForwardGate {
    pub fn new() -> Self {
        Self {
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Run `send` if the gate is still open; false once shut
    pub fn pass(&self, send: impl FnOnce()) -> bool {
        let open = self.lock();
        if *open {
            send();
        }
        *open
    }

    pub fn shut(&self) {
        *self.lock() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for ForwardGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwarding of one session's change events
pub struct ChangeSubscription {
    gate: ForwardGate,
    task: JoinHandle<()>,
}

impl ChangeSubscription {
    pub fn new(gate: ForwardGate, task: JoinHandle<()>) -> Self {
        Self { gate, task }
    }

    /// Stop forwarding; no event is sent after this returns
    pub fn cancel(&self) {
        self.gate.shut();
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }
}

/// One live remote storage instance
pub struct Session {
    pub connection_id: String,
    pub params: InstanceCreationParams,
    pub instance: Arc<dyn StorageInstance>,
    subscription: ChangeSubscription,
}

impl Session {
    pub fn new(
        connection_id: String,
        params: InstanceCreationParams,
        instance: Arc<dyn StorageInstance>,
        subscription: ChangeSubscription,
    ) -> Self {
        Self {
            connection_id,
            params,
            instance,
            subscription,
        }
    }

    /// Cancel the change subscription and hand back the engine
    pub fn teardown(self) -> Arc<dyn StorageInstance> {
        self.subscription.cancel();
        self.instance
    }

    pub fn is_forwarding(&self) -> bool {
        self.subscription.is_active()
    }
}

/// Live sessions by connection id
pub struct ConnectionRegistry {
    sessions: HashMap<String, Session>,
    recently_closed: HashSet<String>,
    closed_order: VecDeque<String>,
    closed_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(closed_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            recently_closed: HashSet::new(),
            closed_order: VecDeque::new(),
            closed_capacity,
        }
    }

    /// A connection id that is neither live nor recently closed
    pub fn allocate_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.sessions.contains_key(&id) && !self.recently_closed.contains(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.connection_id.clone(), session);
    }

    /// Look up a session, with an unknown-session error when absent
    pub fn lookup(&self, connection_id: &str) -> Result<&Session, StorageError> {
        self.sessions.get(connection_id).ok_or_else(|| {
            if self.recently_closed.contains(connection_id) {
                StorageError::UnknownSession(format!("session '{}' was closed", connection_id))
            } else {
                StorageError::UnknownSession(format!(
                    "no session with id '{}'",
                    connection_id
                ))
            }
        })
    }

    /// Remove a session and remember its id as closed
    pub fn remove(&mut self, connection_id: &str) -> Option<Session> {
        let session = self.sessions.remove(connection_id)?;
        self.remember_closed(connection_id.to_string());
        Some(session)
    }

    /// Remove every session
    pub fn drain(&mut self) -> Vec<Session> {
        let sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.remember_closed(session.connection_id.clone());
        }
        sessions
    }

    pub fn was_closed(&self, connection_id: &str) -> bool {
        self.recently_closed.contains(connection_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn remember_closed(&mut self, connection_id: String) {
        if self.closed_capacity == 0 {
            return;
        }
        if self.recently_closed.insert(connection_id.clone()) {
            self.closed_order.push_back(connection_id);
        }
        while self.closed_order.len() > self.closed_capacity {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.recently_closed.remove(&oldest);
            }
        }
    }
}
