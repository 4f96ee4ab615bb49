//! Storage Remote Core Library
//!
//! Remote-controls a document storage engine over an asynchronous message
//! channel. One side exposes a real storage; the other side gets a proxy
//! that implements the same storage traits.
//!
//! # Quick Start
//!
//! ```text
//! let (proxy_end, exposer_end) = ChannelBus::pair(DEFAULT_CHANNEL_CAPACITY);
//!
//! // Serve an engine
//! let exposer = expose_storage(ExposeSettings::new(
//!     Arc::new(exposer_end),
//!     Arc::new(MemoryStorage::new()),
//! ));
//!
//! // Use it from the other side
//! let storage = RemoteStorage::new(RemoteStorageSettings::new("remote", Arc::new(proxy_end)));
//! let instance = storage.create_instance(InstanceCreationParams::new("db", "items")).await?;
//! let result = instance.query(PreparedQuery::all()).await?;
//! ```
//!
//! # Modules
//!
//! - `storage`: storage traits, document types and an in-memory engine
//! - `remote`: wire envelopes, message bus, proxy and exposer
//! - `error`: error kinds shared by both sides
//! - `config`: configuration

pub mod config;
pub mod error;
pub mod remote;
pub mod storage;

pub use config::Config;
pub use error::{ErrorKind, RemoteError, StorageError, StorageResult};
pub use remote::{
    expose_storage, ChannelBus, EncodedBus, ExposeSettings, ExposerHandle, MessageBus,
    RemoteStorage, RemoteStorageInstance, RemoteStorageSettings,
};
pub use storage::{InstanceCreationParams, MemoryStorage, Storage, StorageInstance};
