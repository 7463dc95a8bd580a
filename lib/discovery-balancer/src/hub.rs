//! Broadcast hub fanning registry snapshots out to connected subscribers
//!
//! The hub is a single task that owns the subscriber set. Everything else talks
//! to it through the channels on [`HubHandle`]. Delivery never waits on a
//! subscriber: a subscriber whose queue is full is dropped on the spot.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SubscriberId = Uuid;

/// Outbound queue capacity per subscriber
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// A registered observer: its id and the sending side of its outbound queue
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    queue: mpsc::Sender<Bytes>,
}

impl Subscriber {
    /// Create a subscriber and the receiving end its pump drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Self {
            id: Uuid::new_v4(),
            queue,
        };
        (subscriber, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Sending side of the queue, for payloads queued before registration
    pub fn queue(&self) -> &mpsc::Sender<Bytes> {
        &self.queue
    }
}

/// Cloneable entry point into a running hub
#[derive(Clone, Debug)]
pub struct HubHandle {
    register: mpsc::Sender<Subscriber>,
    unregister: mpsc::Sender<SubscriberId>,
    broadcaster: mpsc::Sender<Bytes>,
    subscribers: watch::Receiver<usize>,
}

impl HubHandle {
    pub fn register(&self) -> &mpsc::Sender<Subscriber> {
        &self.register
    }

    pub fn unregister(&self) -> &mpsc::Sender<SubscriberId> {
        &self.unregister
    }

    pub fn broadcaster(&self) -> &mpsc::Sender<Bytes> {
        &self.broadcaster
    }

    /// Subscriber count as of the hub's last state change
    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.borrow()
    }

    /// Watch the subscriber count
    pub fn subscriber_count_watch(&self) -> watch::Receiver<usize> {
        self.subscribers.clone()
    }
}

/// The hub actor
pub struct BroadcastHub {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Bytes>>,
    register_rx: mpsc::Receiver<Subscriber>,
    unregister_rx: mpsc::Receiver<SubscriberId>,
    broadcast_rx: mpsc::Receiver<Bytes>,
    count_tx: watch::Sender<usize>,
}

impl BroadcastHub {
    pub fn new() -> (Self, HubHandle) {
        Self::with_control_capacity(CONTROL_CHANNEL_CAPACITY)
    }

    /// Hub whose register/unregister/broadcast channels hold `capacity` messages
    pub fn with_control_capacity(capacity: usize) -> (Self, HubHandle) {
        let capacity = capacity.max(1);
        let (register, register_rx) = mpsc::channel(capacity);
        let (unregister, unregister_rx) = mpsc::channel(capacity);
        let (broadcaster, broadcast_rx) = mpsc::channel(capacity);
        let (count_tx, subscribers) = watch::channel(0);

        let hub = Self {
            subscribers: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            count_tx,
        };
        let handle = HubHandle {
            register,
            unregister,
            broadcaster,
            subscribers,
        };
        (hub, handle)
    }

    /// Process hub traffic until `shutdown` completes
    ///
    /// Returns the number of subscribers still registered when the loop ended.
    /// Their queues close when the hub is dropped.
    pub async fn run<F>(mut self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Broadcast hub started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(subscriber) = self.register_rx.recv() => self.add(subscriber),
                Some(id) = self.unregister_rx.recv() => self.remove(id),
                Some(payload) = self.broadcast_rx.recv() => self.broadcast(payload),
                else => break,
            }
        }

        info!("Broadcast hub stopped with {} subscribers", self.subscribers.len());
        self.subscribers.len()
    }

    fn add(&mut self, subscriber: Subscriber) {
        debug!("Subscriber registered: {}", subscriber.id);
        self.subscribers.insert(subscriber.id, subscriber.queue);
        self.publish_count();
    }

    /// Dropping the stored sender closes the subscriber's queue
    fn remove(&mut self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            debug!("Subscriber unregistered: {}", id);
            self.publish_count();
        }
    }

    fn broadcast(&mut self, payload: Bytes) {
        let mut dead = Vec::new();

        for (id, queue) in &self.subscribers {
            match queue.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, disconnecting", id);
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} queue already closed", id);
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            self.remove(id);
        }
        debug!(
            "Broadcast {} bytes to {} subscribers",
            payload.len(),
            self.subscribers.len()
        );
    }

    fn publish_count(&self) {
        self.count_tx.send_replace(self.subscribers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn spawn_hub() -> (HubHandle, oneshot::Sender<()>, tokio::task::JoinHandle<usize>) {
        let (hub, handle) = BroadcastHub::new();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(hub.run(async move {
            let _ = stop_rx.await;
        }));
        (handle, stop_tx, task)
    }

    async fn wait_for_count(handle: &HubHandle, expected: usize) {
        let mut watch = handle.subscriber_count_watch();
        tokio::time::timeout(Duration::from_secs(1), watch.wait_for(|count| *count == expected))
            .await
            .expect("subscriber count never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_broadcast() {
        let (handle, stop, task) = spawn_hub();
        let (first, mut first_rx) = Subscriber::new(8);
        let (second, mut second_rx) = Subscriber::new(8);

        handle.register().send(first).await.unwrap();
        handle.register().send(second).await.unwrap();
        handle
            .broadcaster()
            .send(Bytes::from_static(b"snapshot"))
            .await
            .unwrap();

        assert_eq!(first_rx.recv().await.unwrap(), Bytes::from_static(b"snapshot"));
        assert_eq!(second_rx.recv().await.unwrap(), Bytes::from_static(b"snapshot"));
        assert_eq!(handle.subscriber_count(), 2);

        stop.send(()).unwrap();
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unregister_closes_queue_and_is_idempotent() {
        let (handle, stop, task) = spawn_hub();
        let (subscriber, mut rx) = Subscriber::new(8);
        let id = subscriber.id();

        handle.register().send(subscriber).await.unwrap();
        handle.unregister().send(id).await.unwrap();
        handle.unregister().send(id).await.unwrap();

        assert_eq!(rx.recv().await, None);
        wait_for_count(&handle, 0).await;

        stop.send(()).unwrap();
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let (handle, stop, task) = spawn_hub();
        let (slow, mut slow_rx) = Subscriber::new(1);
        let (fast, mut fast_rx) = Subscriber::new(8);

        handle.register().send(slow).await.unwrap();
        handle.register().send(fast).await.unwrap();

        for payload in [&b"one"[..], b"two", b"three"] {
            handle
                .broadcaster()
                .send(Bytes::copy_from_slice(payload))
                .await
                .unwrap();
        }

        // the fast subscriber gets everything
        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"three"));

        // the slow one keeps what it had buffered, then sees its queue closed
        assert_eq!(slow_rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(slow_rx.recv().await, None);

        wait_for_count(&handle, 1).await;
        stop.send(()).unwrap();
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_evicted_on_broadcast() {
        let (handle, stop, task) = spawn_hub();
        let (gone, gone_rx) = Subscriber::new(8);
        drop(gone_rx);

        handle.register().send(gone).await.unwrap();
        wait_for_count(&handle, 1).await;
        handle
            .broadcaster()
            .send(Bytes::from_static(b"ping"))
            .await
            .unwrap();
        wait_for_count(&handle, 0).await;

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_control_capacity_bounds_pending_messages() {
        let (hub, handle) = BroadcastHub::with_control_capacity(1);
        let (subscriber, mut rx) = Subscriber::new(8);

        handle.register().try_send(subscriber).unwrap();
        handle
            .broadcaster()
            .try_send(Bytes::from_static(b"first"))
            .unwrap();
        assert!(handle
            .broadcaster()
            .try_send(Bytes::from_static(b"second"))
            .is_err());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(hub.run(async move {
            let _ = stop_rx.await;
        }));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"first"));
        stop_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_control_capacity_is_clamped() {
        let (hub, handle) = BroadcastHub::with_control_capacity(0);
        assert!(handle
            .broadcaster()
            .try_send(Bytes::from_static(b"snapshot"))
            .is_ok());
        drop(hub);
    }

    #[tokio::test]
    async fn test_shutdown_stops_processing() {
        let (hub, handle) = BroadcastHub::new();
        let remaining = tokio::time::timeout(Duration::from_secs(1), hub.run(async {}))
            .await
            .expect("hub did not stop");
        assert_eq!(remaining, 0);

        let (subscriber, _rx) = Subscriber::new(8);
        assert!(handle.register().send(subscriber).await.is_err());
        assert!(handle
            .broadcaster()
            .send(Bytes::from_static(b"late"))
            .await
            .is_err());
    }
}
