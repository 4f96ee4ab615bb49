//! Message bus
//!
//! The transport is an external collaborator that only offers "send one
//! message" and "subscribe to incoming messages". Delivery order across
//! sessions is not assumed.
//!
//! Two adapters are provided:
//! - [`ChannelBus`]: in-process channels, one pair per link
//! - [`EncodedBus`]: envelopes carried as CBOR frames over a byte bus

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

use super::message::{MessageFromRemote, MessageToRemote};

/// Default capacity of in-process channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An asynchronous, order-agnostic message channel
pub trait MessageBus<Out, In>: Send + Sync {
    /// Fire-and-forget send
    fn send(&self, message: Out);

    /// Subscribe to incoming messages
    ///
    /// Every call starts a new, independent subscription that sees messages
    /// arriving from now on. The stream ends when the bus terminates.
    fn incoming(&self) -> BoxStream<'static, In>;
}

/// Bus as seen by a proxy
pub type ProxyBus = Arc<dyn MessageBus<MessageToRemote, MessageFromRemote>>;

/// Bus as seen by an exposer
pub type ExposerBus = Arc<dyn MessageBus<MessageFromRemote, MessageToRemote>>;

/// Fan-out to subscribers, each with its own bounded queue
///
/// A subscriber whose queue is full is disconnected: its stream yields what
/// was already queued and then ends. Messages are never skipped silently.
pub(crate) struct Subscribers<T> {
    senders: Mutex<Vec<mpsc::Sender<T>>>,
    capacity: usize,
}

impl<T> Subscribers<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn publish(&self, message: T) {
        let mut senders = self.lock();
        if senders.is_empty() {
            trace!("Message dropped, no subscriber on the other end");
            return;
        }
        let capacity = self.capacity;
        senders.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Subscriber fell {} messages behind, disconnecting it",
                    capacity
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub(crate) fn subscribe(&self) -> BoxStream<'static, T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().push(tx);
        stream::unfold(rx, |mut rx| async move {
            let message = rx.recv().await?;
            Some((message, rx))
        })
        .boxed()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::Sender<T>>> {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One end of an in-process bus
pub struct ChannelBus<Out, In> {
    outgoing: Arc<Subscribers<Out>>,
    incoming: Arc<Subscribers<In>>,
}

impl<Out, In> ChannelBus<Out, In>
where
    Out: Clone + Send + 'static,
    In: Clone + Send + 'static,
{
    /// Create both ends of a bus
    ///
    /// `capacity` bounds how far each subscriber may fall behind.
    pub fn pair(capacity: usize) -> (ChannelBus<Out, In>, ChannelBus<In, Out>) {
        let forward = Arc::new(Subscribers::new(capacity));
        let backward = Arc::new(Subscribers::new(capacity));
        (
            ChannelBus {
                outgoing: forward.clone(),
                incoming: backward.clone(),
            },
            ChannelBus {
                outgoing: backward,
                incoming: forward,
            },
        )
    }

    /// Number of live subscriptions on this end
    pub fn subscriber_count(&self) -> usize {
        self.incoming.len()
    }
}

impl<Out, In> MessageBus<Out, In> for ChannelBus<Out, In>
where
    Out: Clone + Send + 'static,
    In: Clone + Send + 'static,
{
    fn send(&self, message: Out) {
        self.outgoing.publish(message);
    }

    fn incoming(&self) -> BoxStream<'static, In> {
        self.incoming.subscribe()
    }
}

/// An envelope that can be carried as a byte frame
pub trait Frame: Sized {
    fn to_frame(&self) -> Vec<u8>;
    fn from_frame(bytes: &[u8]) -> Result<Self, String>;
}

impl Frame for MessageToRemote {
    fn to_frame(&self) -> Vec<u8> {
        self.encode()
    }

    fn from_frame(bytes: &[u8]) -> Result<Self, String> {
        Self::decode(bytes).map_err(|e| e.to_string())
    }
}

impl Frame for MessageFromRemote {
    fn to_frame(&self) -> Vec<u8> {
        self.encode()
    }

    fn from_frame(bytes: &[u8]) -> Result<Self, String> {
        Self::decode(bytes).map_err(|e| e.to_string())
    }
}

/// Typed bus on top of a byte-frame bus
pub struct EncodedBus<Out, In> {
    inner: Arc<dyn MessageBus<Vec<u8>, Vec<u8>>>,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> EncodedBus<Out, In> {
    pub fn new(inner: Arc<dyn MessageBus<Vec<u8>, Vec<u8>>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<Out, In> MessageBus<Out, In> for EncodedBus<Out, In>
where
    Out: Frame + Send + 'static,
    In: Frame + Send + 'static,
{
    fn send(&self, message: Out) {
        self.inner.send(message.to_frame());
    }

    fn incoming(&self) -> BoxStream<'static, In> {
        self.inner
            .incoming()
            .filter_map(|bytes| async move {
                match In::from_frame(&bytes) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Dropping undecodable frame ({} bytes): {}", bytes.len(), e);
                        None
                    }
                }
            })
            .boxed()
    }
}

/// Resolves once the watched flag turns true or its sender is dropped
pub(crate) fn closed_signal(
    mut closed: watch::Receiver<bool>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_pair_delivers_both_ways() {
        let (left, right) = ChannelBus::<String, u32>::pair(8);
        let mut at_right = right.incoming();
        let mut at_left = left.incoming();

        left.send("hello".to_string());
        right.send(7);

        assert_eq!(at_right.next().await.unwrap(), "hello");
        assert_eq!(at_left.next().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_message() {
        let (left, right) = ChannelBus::<u32, u32>::pair(8);
        let mut first = right.incoming();
        let mut second = right.incoming();

        left.send(1);
        left.send(2);

        assert_eq!(first.next().await, Some(1));
        assert_eq!(first.next().await, Some(2));
        assert_eq!(second.next().await, Some(1));
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_dropped() {
        let (left, right) = ChannelBus::<u32, u32>::pair(8);
        left.send(1);

        let mut late = right.incoming();
        left.send(2);
        assert_eq!(late.next().await, Some(2));
    }

    #[tokio::test]
    async fn test_overflowing_subscriber_is_disconnected() {
        let (left, right) = ChannelBus::<u32, u32>::pair(2);
        let mut slow = right.incoming();
        for i in 0..5 {
            left.send(i);
        }

        // What was queued still arrives, then the stream ends
        assert_eq!(slow.next().await, Some(0));
        assert_eq!(slow.next().await, Some(1));
        assert_eq!(slow.next().await, None);
        assert_eq!(right.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_encoded_bus_skips_garbage_frames() {
        let (raw_left, raw_right) = ChannelBus::<Vec<u8>, Vec<u8>>::pair(8);
        let raw_left: Arc<dyn MessageBus<Vec<u8>, Vec<u8>>> = Arc::new(raw_left);
        let raw_right: Arc<dyn MessageBus<Vec<u8>, Vec<u8>>> = Arc::new(raw_right);

        let proxy_side = EncodedBus::<MessageToRemote, MessageFromRemote>::new(raw_left.clone());
        let exposer_side = EncodedBus::<MessageFromRemote, MessageToRemote>::new(raw_right);
        let mut received = exposer_side.incoming();

        raw_left.send(vec![0xff, 0xff, 0xff]);
        let msg = MessageToRemote::call("c", "r", "count", json!({}));
        proxy_side.send(msg.clone());

        assert_eq!(received.next().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_closed_signal() {
        let (tx, rx) = watch::channel(false);
        let signal = tokio::spawn(closed_signal(rx));
        tx.send_replace(true);
        signal.await.unwrap();
    }
}
