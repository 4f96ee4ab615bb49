//! Proxy
//!
//! [`RemoteStorage`] and [`RemoteStorageInstance`] implement the storage
//! traits by sending requests over a message bus and waiting for the
//! matching replies. A background router task feeds every incoming reply
//! into the pending-request table; change streams are independent filters
//! over the same incoming messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::bus::{closed_signal, MessageBus, ProxyBus};
use super::correlation::{PendingRequests, Resolution};
use super::message::{
    CreatedInstance, IncomingMessage, MessageFromRemote, MessageToRemote, Reply, CREATE_METHOD,
    NO_CONNECTION,
};
use super::operation::{
    BulkWriteParams, CleanupParams, FindDocumentsByIdParams, GetAttachmentDataParams,
    GetChangedDocumentsSinceParams, QueryParams, StorageCall, StorageMethod,
};
use crate::config::Config;
use crate::error::{ErrorKind, StorageError, StorageResult};
use crate::storage::{
    BulkWriteResponse, BulkWriteRow, ChangeEventBulk, ChangedDocuments, Checkpoint, CountResult,
    InstanceCreationParams, PreparedQuery, QueryResult, Storage, StorageDocument,
    StorageInstance,
};

/// Settings of a remote storage
#[derive(Clone)]
pub struct RemoteStorageSettings {
    /// Name reported by [`Storage::name`]
    pub identifier: String,
    pub bus: ProxyBus,
    /// Give up on a request after this long; `None` waits forever
    pub request_timeout: Option<Duration>,
}

impl RemoteStorageSettings {
    pub fn new(identifier: impl Into<String>, bus: ProxyBus) -> Self {
        Self {
            identifier: identifier.into(),
            bus,
            request_timeout: None,
        }
    }

    pub fn from_config(bus: ProxyBus, config: &Config) -> Self {
        Self {
            identifier: config.identifier.clone(),
            bus,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// State shared by a remote storage and all its instances
struct ProxyShared {
    identifier: String,
    bus: ProxyBus,
    pending: Arc<PendingRequests>,
    request_timeout: Option<Duration>,
    router: AbortHandle,
}

impl ProxyShared {
    /// Send one request and wait for its reply
    async fn request(&self, connection_id: &str, method: &str, params: Value) -> StorageResult<Value> {
        let pending = self.pending.register(connection_id)?;
        let message = MessageToRemote::call(connection_id, pending.request_id(), method, params);
        debug!(
            "Sending {} request {} on connection '{}'",
            method,
            pending.request_id(),
            connection_id
        );
        self.bus.send(message);

        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, pending.wait())
                .await
                .map_err(|_| {
                    StorageError::Timeout(format!(
                        "{} on connection '{}' got no reply within {:?}",
                        method, connection_id, timeout
                    ))
                })?,
            None => pending.wait().await,
        }
    }
}

impl Drop for ProxyShared {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Storage whose instances live behind a message bus
#[derive(Clone)]
pub struct RemoteStorage {
    shared: Arc<ProxyShared>,
}

impl RemoteStorage {
    /// Create a remote storage and start routing replies
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(settings: RemoteStorageSettings) -> Self {
        let pending = PendingRequests::new();
        let incoming = settings.bus.incoming();
        let router = tokio::spawn(route_replies(
            incoming,
            pending.clone(),
            settings.bus.clone(),
        ))
        .abort_handle();

        Self {
            shared: Arc::new(ProxyShared {
                identifier: settings.identifier,
                bus: settings.bus,
                pending,
                request_timeout: settings.request_timeout,
                router,
            }),
        }
    }

    /// Create an instance and keep its concrete type
    pub async fn create_remote_instance(
        &self,
        params: InstanceCreationParams,
    ) -> StorageResult<RemoteStorageInstance> {
        let value = self
            .shared
            .request(NO_CONNECTION, CREATE_METHOD, serde_json::to_value(&params)?)
            .await?;

        let created: CreatedInstance = serde_json::from_value(value).map_err(|e| {
            StorageError::CreationFailed(format!("invalid creation reply: {}", e))
        })?;
        if created.connection_id.is_empty() {
            return Err(StorageError::CreationFailed(
                "exposer returned an empty connection id".to_string(),
            ));
        }

        info!(
            "Remote instance for {} attached to connection {}",
            params.collection_key(),
            created.connection_id
        );
        Ok(RemoteStorageInstance::new(
            self.shared.clone(),
            created.connection_id,
            params,
        ))
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    fn name(&self) -> &str {
        &self.shared.identifier
    }

    async fn create_instance(
        &self,
        params: InstanceCreationParams,
    ) -> StorageResult<Arc<dyn StorageInstance>> {
        let instance = self.create_remote_instance(params).await?;
        Ok(Arc::new(instance))
    }
}

/// Feed incoming replies into the pending-request table
async fn route_replies(
    mut incoming: BoxStream<'static, MessageFromRemote>,
    pending: Arc<PendingRequests>,
    bus: ProxyBus,
) {
    while let Some(message) = incoming.next().await {
        match message.classify() {
            IncomingMessage::Reply(reply) => {
                let request_id = reply.answer_to.clone();
                let connection_id = reply.connection_id.clone();
                let created = created_connection(&reply);
                match pending.resolve(reply) {
                    Resolution::Resolved => {}
                    Resolution::Duplicate => {
                        debug!("Dropping duplicate reply to request {}", request_id)
                    }
                    Resolution::Late => {
                        debug!("Ignoring late reply to abandoned request {}", request_id);
                        if let Some(orphan) = created {
                            close_orphan(&bus, &pending, &orphan);
                        }
                    }
                    Resolution::ConnectionMismatch => warn!(
                        "Reply to request {} carries connection '{}' it was not sent on",
                        request_id, connection_id
                    ),
                    Resolution::Unmatched => warn!(
                        "Discarding reply to unknown request {} on connection '{}'",
                        request_id, connection_id
                    ),
                }
            }
            // Change streams subscribe on their own
            IncomingMessage::Event(_) => {}
            IncomingMessage::Malformed(message) => warn!(
                "Discarding malformed {} message on connection '{}'",
                message.method, message.connection_id
            ),
        }
    }

    let failed = pending.disconnect("message bus terminated");
    warn!("Message bus terminated, {} pending requests failed", failed);
}

/// Connection id allocated by a successful creation reply
fn created_connection(reply: &Reply) -> Option<String> {
    if reply.method != CREATE_METHOD {
        return None;
    }
    let value = reply.outcome.as_ref().ok()?;
    serde_json::from_value::<CreatedInstance>(value.clone())
        .ok()
        .map(|created| created.connection_id)
        .filter(|id| !id.is_empty())
}

/// Close a session whose creator stopped waiting for it
fn close_orphan(bus: &ProxyBus, pending: &Arc<PendingRequests>, connection_id: &str) {
    let Ok(request) = pending.register(connection_id) else {
        return;
    };
    info!("Closing orphaned session {}", connection_id);
    bus.send(MessageToRemote::call(
        connection_id,
        request.request_id(),
        StorageMethod::Close.as_str(),
        json!({}),
    ));
    // Nobody waits for the answer; dropping the request marks it abandoned
    drop(request);
}

/// A storage instance living on the other side of the bus
pub struct RemoteStorageInstance {
    shared: Arc<ProxyShared>,
    connection_id: String,
    params: InstanceCreationParams,
    closed: watch::Sender<bool>,
}

impl RemoteStorageInstance {
    fn new(shared: Arc<ProxyShared>, connection_id: String, params: InstanceCreationParams) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            shared,
            connection_id,
            params,
            closed,
        }
    }

    /// Connection id allocated by the exposer
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn params(&self) -> &InstanceCreationParams {
        &self.params
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_error(&self) -> StorageError {
        StorageError::Closed(format!(
            "remote instance on connection '{}' is closed",
            self.connection_id
        ))
    }

    async fn call(&self, call: StorageCall) -> StorageResult<Value> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let params = call.to_params()?;
        self.shared
            .request(&self.connection_id, call.method().as_str(), params)
            .await
    }

    async fn call_typed<T: DeserializeOwned>(&self, call: StorageCall) -> StorageResult<T> {
        let method = call.method();
        let value = self.call(call).await?;
        serde_json::from_value(value)
            .map_err(|e| StorageError::Internal(format!("unexpected {} result: {}", method, e)))
    }

    /// Send close or remove; the instance is unusable afterwards either way
    async fn end_session(&self, call: StorageCall) -> StorageResult<()> {
        let method = call.method();
        let was_closed = self.closed.send_replace(true);
        if was_closed {
            return match method {
                StorageMethod::Close => Ok(()),
                _ => Err(self.closed_error()),
            };
        }

        let result = self
            .shared
            .request(&self.connection_id, method.as_str(), call.to_params()?)
            .await;
        match result {
            Ok(_) => Ok(()),
            // Nothing left to close on the other side
            Err(e) if method == StorageMethod::Close && e.kind() == ErrorKind::UnknownSession => {
                debug!("Close of {} found no session: {}", self.connection_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StorageInstance for RemoteStorageInstance {
    async fn bulk_write(
        &self,
        document_writes: Vec<BulkWriteRow>,
        context: &str,
    ) -> StorageResult<BulkWriteResponse> {
        self.call_typed(StorageCall::BulkWrite(BulkWriteParams {
            document_writes,
            context: context.to_string(),
        }))
        .await
    }

    async fn find_documents_by_id(
        &self,
        ids: Vec<String>,
        with_deleted: bool,
    ) -> StorageResult<Vec<StorageDocument>> {
        self.call_typed(StorageCall::FindDocumentsById(FindDocumentsByIdParams {
            ids,
            with_deleted,
        }))
        .await
    }

    async fn query(&self, query: PreparedQuery) -> StorageResult<QueryResult> {
        self.call_typed(StorageCall::Query(QueryParams { query })).await
    }

    async fn count(&self, query: PreparedQuery) -> StorageResult<CountResult> {
        self.call_typed(StorageCall::Count(QueryParams { query })).await
    }

    async fn get_attachment_data(
        &self,
        document_id: &str,
        attachment_id: &str,
        digest: &str,
    ) -> StorageResult<String> {
        self.call_typed(StorageCall::GetAttachmentData(GetAttachmentDataParams {
            document_id: document_id.to_string(),
            attachment_id: attachment_id.to_string(),
            digest: digest.to_string(),
        }))
        .await
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<Checkpoint>,
    ) -> StorageResult<ChangedDocuments> {
        self.call_typed(StorageCall::GetChangedDocumentsSince(
            GetChangedDocumentsSinceParams { limit, checkpoint },
        ))
        .await
    }

    fn change_stream(&self) -> BoxStream<'static, ChangeEventBulk> {
        if self.is_closed() {
            return stream::empty().boxed();
        }

        let connection_id = self.connection_id.clone();
        let closed = closed_signal(self.closed.subscribe());
        self.shared
            .bus
            .incoming()
            .filter_map(move |message| {
                let wanted = message.connection_id == connection_id;
                async move {
                    if !wanted {
                        return None;
                    }
                    match message.classify() {
                        IncomingMessage::Event(event) => {
                            match serde_json::from_value::<ChangeEventBulk>(event.payload) {
                                Ok(bulk) => Some(bulk),
                                Err(e) => {
                                    warn!(
                                        "Dropping undecodable change event on connection '{}': {}",
                                        event.connection_id, e
                                    );
                                    None
                                }
                            }
                        }
                        _ => None,
                    }
                }
            })
            .take_until(closed)
            .boxed()
    }

    async fn cleanup(&self, minimum_deleted_time: i64) -> StorageResult<bool> {
        self.call_typed(StorageCall::Cleanup(CleanupParams {
            minimum_deleted_time,
        }))
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        self.end_session(StorageCall::Close).await
    }

    async fn remove(&self) -> StorageResult<()> {
        self.end_session(StorageCall::Remove).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::bus::ChannelBus;

    type FakeExposer = ChannelBus<MessageFromRemote, MessageToRemote>;

    fn setup() -> (RemoteStorage, FakeExposer) {
        let (proxy_end, exposer_end) = ChannelBus::pair(64);
        let storage = RemoteStorage::new(RemoteStorageSettings::new("remote", Arc::new(proxy_end)));
        (storage, exposer_end)
    }

    /// Answer the next creation request with `connection_id`
    async fn accept_create(
        exposer: &FakeExposer,
        requests: &mut BoxStream<'static, MessageToRemote>,
        connection_id: &str,
    ) {
        let request = requests.next().await.unwrap();
        assert!(request.is_create());
        assert_eq!(request.connection_id, NO_CONNECTION);
        exposer.send(MessageFromRemote::success(
            &request,
            json!({ "connectionId": connection_id }),
        ));
    }

    #[tokio::test]
    async fn test_create_adopts_allocated_connection() {
        let (storage, exposer) = setup();
        let mut requests = exposer.incoming();

        let create = tokio::spawn({
            let storage = storage.clone();
            async move {
                storage
                    .create_remote_instance(InstanceCreationParams::new("db", "items"))
                    .await
            }
        });
        accept_create(&exposer, &mut requests, "conn-7").await;
        let instance = create.await.unwrap().unwrap();
        assert_eq!(instance.connection_id(), "conn-7");

        let count = tokio::spawn(async move { instance.count(PreparedQuery::all()).await });
        let request = requests.next().await.unwrap();
        assert_eq!(request.connection_id, "conn-7");
        assert_eq!(request.method, "count");
        exposer.send(MessageFromRemote::success(&request, json!({"count": 4, "mode": "fast"})));

        assert_eq!(count.await.unwrap().unwrap().count, 4);
        assert_eq!(storage.name(), "remote");
    }

    #[tokio::test]
    async fn test_failed_create_yields_no_instance() {
        let (storage, exposer) = setup();
        let mut requests = exposer.incoming();

        let create = tokio::spawn({
            let storage = storage.clone();
            async move {
                storage
                    .create_remote_instance(InstanceCreationParams::new("db", "items"))
                    .await
            }
        });
        let request = requests.next().await.unwrap();
        exposer.send(MessageFromRemote::failure(
            &request,
            RemoteError::new(ErrorKind::CreationFailed, "disk missing"),
        ));

        let err = create.await.unwrap().err().unwrap();
        assert_eq!(err, StorageError::CreationFailed("disk missing".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_abandons_request() {
        let (proxy_end, exposer): (_, FakeExposer) = ChannelBus::pair(64);
        let storage = RemoteStorage::new(
            RemoteStorageSettings::new("remote", Arc::new(proxy_end))
                .with_request_timeout(Duration::from_millis(50)),
        );
        let _requests = exposer.incoming();

        let err = storage
            .create_remote_instance(InstanceCreationParams::new("db", "items"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(storage.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_creation_is_closed() {
        let (proxy_end, exposer): (_, FakeExposer) = ChannelBus::pair(64);
        let storage = RemoteStorage::new(
            RemoteStorageSettings::new("remote", Arc::new(proxy_end))
                .with_request_timeout(Duration::from_millis(50)),
        );
        let mut requests = exposer.incoming();

        let err = storage
            .create_remote_instance(InstanceCreationParams::new("db", "items"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // The exposer answers after the caller gave up
        let create = requests.next().await.unwrap();
        exposer.send(MessageFromRemote::success(
            &create,
            json!({ "connectionId": "orphan" }),
        ));

        let close = requests.next().await.unwrap();
        assert_eq!(close.connection_id, "orphan");
        assert_eq!(close.method, "close");
        assert_eq!(storage.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_reply_burst_never_leaves_callers_hanging() {
        let (proxy_end, exposer): (_, FakeExposer) = ChannelBus::pair(4);
        let storage = RemoteStorage::new(RemoteStorageSettings::new("remote", Arc::new(proxy_end)));
        let mut requests = exposer.incoming();

        let create = tokio::spawn({
            let storage = storage.clone();
            async move {
                storage
                    .create_remote_instance(InstanceCreationParams::new("db", "items"))
                    .await
            }
        });
        let request = requests.next().await.unwrap();
        exposer.send(MessageFromRemote::success(
            &request,
            json!({ "connectionId": "conn-1" }),
        ));
        for i in 0..8 {
            exposer.send(MessageFromRemote::change_event("conn-other", json!({ "n": i })));
        }

        let instance = tokio::time::timeout(Duration::from_secs(1), create)
            .await
            .expect("create never resolved")
            .unwrap()
            .unwrap();
        assert_eq!(instance.connection_id(), "conn-1");

        // The router fell behind and was cut off, so later calls fail fast
        let err = tokio::time::timeout(Duration::from_secs(1), instance.count(PreparedQuery::all()))
            .await
            .expect("count never resolved")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected);
        assert_eq!(storage.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_is_final_regardless_of_reply() {
        let (storage, exposer) = setup();
        let mut requests = exposer.incoming();

        let create = tokio::spawn({
            let storage = storage.clone();
            async move {
                storage
                    .create_remote_instance(InstanceCreationParams::new("db", "items"))
                    .await
            }
        });
        accept_create(&exposer, &mut requests, "conn-1").await;
        let instance = Arc::new(create.await.unwrap().unwrap());

        let closing = tokio::spawn({
            let instance = instance.clone();
            async move { instance.close().await }
        });
        let request = requests.next().await.unwrap();
        assert_eq!(request.method, "close");
        exposer.send(MessageFromRemote::failure(
            &request,
            RemoteError::new(ErrorKind::UnknownSession, "gone"),
        ));
        closing.await.unwrap().unwrap();

        assert!(instance.is_closed());
        let err = instance.query(PreparedQuery::all()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        // Second close is a no-op, remove is refused
        instance.close().await.unwrap();
        assert!(instance.remove().await.is_err());
    }

    #[tokio::test]
    async fn test_change_stream_filters_by_connection() {
        let (storage, exposer) = setup();
        let mut requests = exposer.incoming();

        let create = tokio::spawn({
            let storage = storage.clone();
            async move {
                storage
                    .create_remote_instance(InstanceCreationParams::new("db", "items"))
                    .await
            }
        });
        accept_create(&exposer, &mut requests, "conn-a").await;
        let instance = create.await.unwrap().unwrap();
        let mut changes = instance.change_stream();

        let bulk = |id: &str| {
            json!({
                "id": id,
                "events": [],
                "checkpoint": {"id": "doc", "lwt": 1},
                "context": "test",
                "startTime": 0,
                "endTime": 1
            })
        };
        exposer.send(MessageFromRemote::change_event("conn-b", bulk("other")));
        exposer.send(MessageFromRemote::change_event("conn-a", bulk("mine")));

        let received = changes.next().await.unwrap();
        assert_eq!(received.id, "mine");
    }
}
