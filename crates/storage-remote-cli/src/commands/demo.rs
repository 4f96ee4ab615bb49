//! Demo command
//!
//! Serves an in-memory engine through an exposer and drives it through a
//! proxy, both in this process, over a CBOR-encoded byte bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use storage_remote_core::remote::{MessageFromRemote, MessageToRemote};
use storage_remote_core::storage::{BulkWriteRow, PreparedQuery, SortDirection, StorageDocument};
use storage_remote_core::{
    expose_storage, ChannelBus, Config, EncodedBus, ExposeSettings, InstanceCreationParams,
    MemoryStorage, MessageBus, RemoteStorage, RemoteStorageSettings, StorageInstance,
};

use crate::output::Output;

const DATABASE_NAME: &str = "demo";

/// How long to wait for change events after the write
const CHANGE_WAIT: Duration = Duration::from_secs(2);

pub async fn run(config: &Config, collection: &str, documents: usize, output: &Output) -> Result<()> {
    let (proxy_bytes, exposer_bytes) =
        ChannelBus::<Vec<u8>, Vec<u8>>::pair(config.channel_capacity.max(1));
    let proxy_bytes: Arc<dyn MessageBus<Vec<u8>, Vec<u8>>> = Arc::new(proxy_bytes);
    let exposer_bytes: Arc<dyn MessageBus<Vec<u8>, Vec<u8>>> = Arc::new(exposer_bytes);

    let exposer = expose_storage(ExposeSettings::from_config(
        Arc::new(EncodedBus::<MessageFromRemote, MessageToRemote>::new(
            exposer_bytes,
        )),
        Arc::new(MemoryStorage::new()),
        config,
    ));
    let storage = RemoteStorage::new(RemoteStorageSettings::from_config(
        Arc::new(EncodedBus::<MessageToRemote, MessageFromRemote>::new(
            proxy_bytes,
        )),
        config,
    ));

    let instance = storage
        .create_remote_instance(InstanceCreationParams::new(DATABASE_NAME, collection))
        .await
        .context("Failed to create remote instance")?;
    output.message(&format!(
        "Connected to {}/{} as {}",
        DATABASE_NAME,
        collection,
        instance.connection_id()
    ));

    let mut changes = instance.change_stream();

    let rows: Vec<BulkWriteRow> = (0..documents)
        .map(|i| BulkWriteRow::insert(demo_document(i)))
        .collect();
    let response = instance
        .bulk_write(rows, "demo")
        .await
        .context("Bulk write failed")?;
    info!(
        "Wrote {} documents, {} rejected",
        response.success.len(),
        response.error.len()
    );

    if !response.success.is_empty() {
        match tokio::time::timeout(CHANGE_WAIT, changes.next()).await {
            Ok(Some(bulk)) => output.print_changes(&bulk),
            Ok(None) => debug!("Change stream ended before any event"),
            Err(_) => output.message("No change event received."),
        }
    }

    let result = instance
        .query(PreparedQuery::all().sorted_by("index", SortDirection::Desc))
        .await
        .context("Query failed")?;
    output.print_documents(&result.documents);

    let count = instance
        .count(PreparedQuery::all())
        .await
        .context("Count failed")?;

    instance.close().await.context("Failed to close instance")?;
    exposer.shutdown().await;

    output.success(&format!(
        "{} document(s) stored in {}/{}",
        count.count, DATABASE_NAME, collection
    ));
    Ok(())
}

fn demo_document(index: usize) -> StorageDocument {
    let mut data = Map::new();
    data.insert("title".to_string(), json!(format!("Document {}", index + 1)));
    data.insert("index".to_string(), Value::from(index));
    StorageDocument::new(format!("doc-{}", index + 1), data)
}
