//! Remote storage protocol
//!
//! Lets one side (the proxy) use a storage engine living on the other side
//! (the exposer) of an asynchronous message bus.
//!
//! ## Architecture
//!
//! - **message**: the two wire envelopes and their classification
//! - **operation**: the closed set of remotely callable operations
//! - **bus**: the transport abstraction and its in-process adapters
//! - **correlation**: proxy-side table of requests waiting for replies
//! - **registry**: exposer-side table of live sessions
//! - **exposer** / **proxy**: the two ends of the protocol
//!
//! Requests and replies are correlated by request id; change events are
//! pushed per connection and never answer a request.

pub mod bus;
pub mod correlation;
pub mod exposer;
pub mod message;
pub mod operation;
pub mod proxy;
pub mod registry;

pub use bus::{
    ChannelBus, EncodedBus, ExposerBus, Frame, MessageBus, ProxyBus, DEFAULT_CHANNEL_CAPACITY,
};
pub use correlation::{PendingRequest, PendingRequests, Resolution};
pub use exposer::{expose_storage, ExposeSettings, ExposerCommand, ExposerHandle};
pub use message::{
    CreatedInstance, IncomingMessage, MessageFromRemote, MessageToRemote, PushEvent, Reply,
    CHANGE_STREAM_METHOD, CREATE_METHOD,
};
pub use operation::{StorageCall, StorageMethod};
pub use proxy::{RemoteStorage, RemoteStorageInstance, RemoteStorageSettings};
pub use registry::ConnectionRegistry;
