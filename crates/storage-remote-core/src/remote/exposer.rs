//! Exposer
//!
//! Serves a [`Storage`] over a message bus. A single task owns the
//! connection registry and reacts to three inputs: incoming requests,
//! finished instance creations and control commands. Engine calls run in
//! their own tasks so a slow or failing operation never blocks the bus or
//! other sessions.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bus::{ExposerBus, MessageBus};
use super::message::{CreatedInstance, MessageFromRemote, MessageToRemote, CREATE_METHOD};
use super::operation::StorageCall;
use super::registry::{ChangeSubscription, ConnectionRegistry, ForwardGate, Session};
use crate::config::Config;
use crate::error::{ErrorKind, RemoteError, StorageError, StorageResult};
use crate::storage::{InstanceCreationParams, Storage, StorageInstance};

/// Default number of closed connection ids remembered
pub const DEFAULT_RECENTLY_CLOSED_CAPACITY: usize = 4096;

/// Commands sent to the exposer task
#[derive(Debug, Clone)]
pub enum ExposerCommand {
    /// Close every session and stop serving
    Shutdown,
}

/// Settings for [`expose_storage`]
#[derive(Clone)]
pub struct ExposeSettings {
    pub bus: ExposerBus,
    /// The storage that actually stores the data
    pub storage: Arc<dyn Storage>,
    pub recently_closed_capacity: usize,
}

impl ExposeSettings {
    pub fn new(bus: ExposerBus, storage: Arc<dyn Storage>) -> Self {
        Self {
            bus,
            storage,
            recently_closed_capacity: DEFAULT_RECENTLY_CLOSED_CAPACITY,
        }
    }

    pub fn from_config(bus: ExposerBus, storage: Arc<dyn Storage>, config: &Config) -> Self {
        Self {
            recently_closed_capacity: config.recently_closed_capacity,
            ..Self::new(bus, storage)
        }
    }
}

/// Handle to control and monitor a running exposer
///
/// Dropping the handle leaves the exposer running until the bus ends.
pub struct ExposerHandle {
    command_tx: mpsc::Sender<ExposerCommand>,
    sessions_rx: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl ExposerHandle {
    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        *self.sessions_rx.borrow()
    }

    /// Watch the number of live sessions
    pub fn subscribe_sessions(&self) -> watch::Receiver<usize> {
        self.sessions_rx.clone()
    }

    /// Close all sessions and wait for the exposer to stop
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(ExposerCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Exposer task ended abnormally: {}", e);
        }
    }
}

/// Start serving `settings.storage` on `settings.bus`
///
/// Must be called from within a Tokio runtime. The bus subscription is
/// established before this returns, so no request sent afterwards is missed.
pub fn expose_storage(settings: ExposeSettings) -> ExposerHandle {
    let incoming = settings.bus.incoming();
    let (command_tx, command_rx) = mpsc::channel(4);
    let (created_tx, created_rx) = mpsc::unbounded_channel();
    let (sessions_tx, sessions_rx) = watch::channel(0);

    let exposer = Exposer {
        bus: settings.bus,
        storage: settings.storage,
        registry: ConnectionRegistry::new(settings.recently_closed_capacity),
        created_tx,
        sessions_tx,
    };
    let task = tokio::spawn(exposer_loop(exposer, incoming, command_rx, created_rx));

    ExposerHandle {
        command_tx,
        sessions_rx,
        task,
    }
}

/// Outcome of a creation running in its own task
struct Creation {
    request: MessageToRemote,
    params: InstanceCreationParams,
    result: StorageResult<Arc<dyn StorageInstance>>,
}

struct Exposer {
    bus: ExposerBus,
    storage: Arc<dyn Storage>,
    registry: ConnectionRegistry,
    created_tx: mpsc::UnboundedSender<Creation>,
    sessions_tx: watch::Sender<usize>,
}

async fn exposer_loop(
    mut exposer: Exposer,
    mut incoming: BoxStream<'static, MessageToRemote>,
    mut command_rx: mpsc::Receiver<ExposerCommand>,
    mut created_rx: mpsc::UnboundedReceiver<Creation>,
) {
    info!("Exposing storage '{}'", exposer.storage.name());
    let mut commands_open = true;

    loop {
        tokio::select! {
            cmd = command_rx.recv(), if commands_open => {
                match cmd {
                    Some(ExposerCommand::Shutdown) => {
                        info!("Exposer shutdown requested");
                        break;
                    }
                    None => commands_open = false,
                }
            }

            Some(creation) = created_rx.recv() => {
                exposer.finish_creation(creation);
            }

            msg = incoming.next() => {
                match msg {
                    Some(request) => exposer.handle_request(request),
                    None => {
                        info!("Message bus terminated");
                        break;
                    }
                }
            }
        }
    }

    exposer.shutdown().await;
}

impl Exposer {
    fn handle_request(&mut self, request: MessageToRemote) {
        if request.method == CREATE_METHOD && !request.is_create() {
            let e = StorageError::InvalidParams(format!(
                "create must not name connection '{}'",
                request.connection_id
            ));
            self.reply_error(&request, RemoteError::from(&e));
            return;
        }

        if request.is_create() {
            self.start_creation(request);
            return;
        }

        let instance = match self.registry.lookup(&request.connection_id) {
            Ok(session) => session.instance.clone(),
            Err(e) => {
                debug!(
                    "Rejecting {} for unknown connection '{}'",
                    request.method, request.connection_id
                );
                self.reply_error(&request, RemoteError::from(&e));
                return;
            }
        };

        let call = match StorageCall::from_wire(&request.method, request.params.clone()) {
            Ok(call) => call,
            Err(e) => {
                self.reply_error(&request, RemoteError::from(&e));
                return;
            }
        };

        if call.method().ends_session() {
            // Stop forwarding before anything else can be emitted
            if let Some(session) = self.registry.remove(&request.connection_id) {
                info!(
                    "Session {} for {} ended by {}",
                    session.connection_id,
                    session.params.collection_key(),
                    call.method()
                );
                session.teardown();
            }
            self.publish_session_count();
        }

        let bus = self.bus.clone();
        tokio::spawn(async move {
            let method = call.method();
            let result = AssertUnwindSafe(call.invoke(instance.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(StorageError::Internal(format!("{} panicked", method)))
                });

            let reply = match result {
                Ok(value) => MessageFromRemote::success(&request, value),
                Err(e) => {
                    debug!(
                        "{} failed on connection {}: {}",
                        method, request.connection_id, e
                    );
                    MessageFromRemote::failure(&request, RemoteError::from(&e))
                }
            };
            bus.send(reply);
        });
    }

    fn start_creation(&mut self, request: MessageToRemote) {
        let params: InstanceCreationParams = match serde_json::from_value(request.params.clone())
        {
            Ok(params) => params,
            Err(e) => {
                let error = StorageError::InvalidParams(format!("create: {}", e));
                self.reply_error(&request, RemoteError::from(&error));
                return;
            }
        };

        let storage = self.storage.clone();
        let created_tx = self.created_tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(storage.create_instance(params.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(StorageError::Internal(
                        "storage factory panicked".to_string(),
                    ))
                });

            let creation = Creation {
                request,
                params,
                result,
            };
            // The exposer stopped meanwhile; nobody will ever use this instance
            if let Err(mpsc::error::SendError(creation)) = created_tx.send(creation) {
                if let Ok(instance) = creation.result {
                    let _ = instance.close().await;
                }
            }
        });
    }

    fn finish_creation(&mut self, creation: Creation) {
        let Creation {
            request,
            params,
            result,
        } = creation;

        let instance = match result {
            Ok(instance) => instance,
            Err(e) => {
                warn!(
                    "Failed to create instance for {}: {}",
                    params.collection_key(),
                    e
                );
                let error = RemoteError::new(ErrorKind::CreationFailed, e.message())
                    .with_parameters(json!({ "cause": e.kind() }));
                self.reply_error(&request, error);
                return;
            }
        };

        let connection_id = self.registry.allocate_id();
        let subscription = self.forward_changes(&connection_id, instance.as_ref());
        self.registry.insert(Session::new(
            connection_id.clone(),
            params.clone(),
            instance,
            subscription,
        ));
        self.publish_session_count();
        info!(
            "Session {} created for {}",
            connection_id,
            params.collection_key()
        );

        let created = CreatedInstance { connection_id };
        match serde_json::to_value(&created) {
            Ok(value) => self.bus.send(MessageFromRemote::success(&request, value)),
            Err(e) => self.reply_error(
                &request,
                RemoteError::new(ErrorKind::Internal, e.to_string()),
            ),
        }
    }

    /// Subscribe to the engine's changes and push them in emission order
    fn forward_changes(
        &self,
        connection_id: &str,
        instance: &dyn StorageInstance,
    ) -> ChangeSubscription {
        let mut changes = instance.change_stream();
        let gate = ForwardGate::new();

        let task_gate = gate.clone();
        let bus = self.bus.clone();
        let connection_id = connection_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(bulk) = changes.next().await {
                let payload = match serde_json::to_value(&bulk) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping unencodable change event {}: {}", bulk.id, e);
                        continue;
                    }
                };
                let message = MessageFromRemote::change_event(connection_id.clone(), payload);
                if !task_gate.pass(|| bus.send(message)) {
                    break;
                }
            }
            debug!("Change forwarding for {} stopped", connection_id);
        });

        ChangeSubscription::new(gate, task)
    }

    fn reply_error(&self, request: &MessageToRemote, error: RemoteError) {
        self.bus.send(MessageFromRemote::failure(request, error));
    }

    fn publish_session_count(&self) {
        self.sessions_tx.send_replace(self.registry.len());
    }

    /// Tear down every session and close the engines
    async fn shutdown(&mut self) {
        let sessions = self.registry.drain();
        self.publish_session_count();
        info!("Closing {} sessions", sessions.len());

        for session in sessions {
            let connection_id = session.connection_id.clone();
            let collection = session.params.collection_key();
            let instance = session.teardown();
            if let Err(e) = instance.close().await {
                warn!(
                    "Failed to close session {} for {}: {}",
                    connection_id, collection, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::bus::ChannelBus;
    use crate::remote::message::{IncomingMessage, CREATE_METHOD, NO_CONNECTION};
    use crate::storage::MemoryStorage;
    use serde_json::Value;

    type TestBus = ChannelBus<MessageToRemote, MessageFromRemote>;

    fn start() -> (TestBus, ExposerHandle) {
        let (proxy_end, exposer_end) = ChannelBus::pair(64);
        let handle = expose_storage(ExposeSettings::new(
            Arc::new(exposer_end),
            Arc::new(MemoryStorage::new()),
        ));
        (proxy_end, handle)
    }

    async fn next_reply(
        incoming: &mut BoxStream<'static, MessageFromRemote>,
        request_id: &str,
    ) -> Result<Value, RemoteError> {
        loop {
            let msg = incoming.next().await.expect("bus ended");
            if let IncomingMessage::Reply(reply) = msg.classify() {
                if reply.answer_to == request_id {
                    return reply.outcome;
                }
            }
        }
    }

    async fn create(bus: &TestBus, incoming: &mut BoxStream<'static, MessageFromRemote>) -> String {
        let params = serde_json::to_value(InstanceCreationParams::new("db", "items")).unwrap();
        bus.send(MessageToRemote::create("create-1", params));
        let value = next_reply(incoming, "create-1").await.unwrap();
        let created: CreatedInstance = serde_json::from_value(value).unwrap();
        created.connection_id
    }

    #[tokio::test]
    async fn test_create_registers_session() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();

        let connection_id = create(&bus, &mut incoming).await;
        assert!(!connection_id.is_empty());
        assert_eq!(handle.session_count(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_reply_keeps_sentinel_connection() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();

        let params = serde_json::to_value(InstanceCreationParams::new("db", "items")).unwrap();
        bus.send(MessageToRemote::create("create-1", params));
        let reply = incoming.next().await.unwrap();
        assert_eq!(reply.connection_id, NO_CONNECTION);
        assert_eq!(reply.method, CREATE_METHOD);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_creation_registers_nothing() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();

        let params = serde_json::to_value(InstanceCreationParams::new("db", "")).unwrap();
        bus.send(MessageToRemote::create("create-1", params));
        let err = next_reply(&mut incoming, "create-1").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::CreationFailed);
        assert_eq!(err.parameters, Some(json!({"cause": "CREATION_FAILED"})));
        assert_eq!(handle.session_count(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_creation_params() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();

        bus.send(MessageToRemote::create("create-1", json!(["not", "params"])));
        let err = next_reply(&mut incoming, "create-1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParams);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_naming_live_connection_is_rejected() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();
        let connection_id = create(&bus, &mut incoming).await;

        let params = serde_json::to_value(InstanceCreationParams::new("db", "items")).unwrap();
        bus.send(MessageToRemote::call(&connection_id, "create-2", CREATE_METHOD, params));
        let err = next_reply(&mut incoming, "create-2").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidParams);
        assert!(err.message.contains(&connection_id));
        assert_eq!(handle.session_count(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_session_and_method() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();

        bus.send(MessageToRemote::call("ghost", "r1", "count", json!({"query": {}})));
        let err = next_reply(&mut incoming, "r1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownSession);

        let connection_id = create(&bus, &mut incoming).await;
        bus.send(MessageToRemote::call(&connection_id, "r2", "explode", json!({})));
        let err = next_reply(&mut incoming, "r2").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownMethod);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_rejects_later_requests() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();
        let connection_id = create(&bus, &mut incoming).await;

        bus.send(MessageToRemote::call(&connection_id, "close-1", "close", json!({})));
        assert_eq!(next_reply(&mut incoming, "close-1").await.unwrap(), Value::Null);
        assert_eq!(handle.session_count(), 0);

        bus.send(MessageToRemote::call(&connection_id, "r1", "count", json!({"query": {}})));
        let err = next_reply(&mut incoming, "r1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownSession);
        assert!(err.message.contains("was closed"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (bus, handle) = start();
        let mut incoming = bus.incoming();
        create(&bus, &mut incoming).await;

        let sessions = handle.subscribe_sessions();
        handle.shutdown().await;
        assert_eq!(*sessions.borrow(), 0);
    }
}
