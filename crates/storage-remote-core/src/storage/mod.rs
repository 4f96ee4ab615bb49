//! Storage capability
//!
//! The traits a storage engine implements to be remote-controlled, and the
//! plain data types its operations exchange.
//!
//! ## Architecture
//!
//! - **Storage**: factory creating instances from creation parameters
//! - **StorageInstance**: one live engine handle with a fixed operation set
//!   and a change-event source
//!
//! The remote proxy implements the same traits, so callers cannot tell a
//! local engine from one behind a message bus.

pub mod memory;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StorageResult;

pub use memory::MemoryStorage;
pub use types::{
    AttachmentMeta, BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeEventBulk,
    ChangeOperation, ChangedDocuments, Checkpoint, CountMode, CountResult,
    InstanceCreationParams, PreparedQuery, QueryResult, SortDirection, SortField,
    StorageDocument, WriteError,
};

/// Factory for storage instances
#[async_trait]
pub trait Storage: Send + Sync {
    /// Identifier of the storage implementation
    fn name(&self) -> &str;

    /// Create a new instance for a collection
    async fn create_instance(
        &self,
        params: InstanceCreationParams,
    ) -> StorageResult<Arc<dyn StorageInstance>>;
}

/// A live storage engine instance
#[async_trait]
pub trait StorageInstance: Send + Sync {
    /// Write documents; per-document failures are returned, not raised
    async fn bulk_write(
        &self,
        document_writes: Vec<BulkWriteRow>,
        context: &str,
    ) -> StorageResult<BulkWriteResponse>;

    async fn find_documents_by_id(
        &self,
        ids: Vec<String>,
        with_deleted: bool,
    ) -> StorageResult<Vec<StorageDocument>>;

    async fn query(&self, query: PreparedQuery) -> StorageResult<QueryResult>;

    async fn count(&self, query: PreparedQuery) -> StorageResult<CountResult>;

    async fn get_attachment_data(
        &self,
        document_id: &str,
        attachment_id: &str,
        digest: &str,
    ) -> StorageResult<String>;

    /// Documents written after `checkpoint`, ordered by write time
    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<Checkpoint>,
    ) -> StorageResult<ChangedDocuments>;

    /// Change events emitted from now on
    ///
    /// Every call returns an independent subscription.
    fn change_stream(&self) -> BoxStream<'static, ChangeEventBulk>;

    /// Purge deleted documents older than `minimum_deleted_time` milliseconds
    ///
    /// Returns `true` once nothing is left to clean up.
    async fn cleanup(&self, minimum_deleted_time: i64) -> StorageResult<bool>;

    async fn close(&self) -> StorageResult<()>;

    /// Delete all data of the collection and close the instance
    async fn remove(&self) -> StorageResult<()>;
}
