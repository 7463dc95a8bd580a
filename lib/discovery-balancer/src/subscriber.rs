//! Per-connection pump between a hub subscriber queue and its transport

use crate::hub::SubscriberId;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Default interval between keepalive pings
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(2);

/// Default deadline for a single write to a subscriber
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write side of a subscriber connection
#[async_trait]
pub trait SubscriberConnection: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn send_text(&mut self, payload: Bytes) -> Result<(), Self::Error>;

    async fn send_ping(&mut self) -> Result<(), Self::Error>;

    /// Send a close frame and release the connection
    async fn close(&mut self) -> Result<(), Self::Error>;
}

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Shutdown signal fired
    Cancelled,
    /// The hub closed the queue
    Evicted,
    /// A write to the connection failed
    WriteFailed,
}

/// Moves queued payloads onto a connection and keeps it alive with pings
pub struct SubscriberPump<C> {
    id: SubscriberId,
    queue: mpsc::Receiver<Bytes>,
    connection: C,
    unregister: mpsc::Sender<SubscriberId>,
    keepalive: Duration,
    write_timeout: Duration,
}

impl<C: SubscriberConnection> SubscriberPump<C> {
    pub fn new(
        id: SubscriberId,
        queue: mpsc::Receiver<Bytes>,
        connection: C,
        unregister: mpsc::Sender<SubscriberId>,
    ) -> Self {
        Self {
            id,
            queue,
            connection,
            unregister,
            keepalive: DEFAULT_KEEPALIVE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive.max(Duration::from_millis(1));
        self
    }

    /// Bound every write; a peer that stops reading past this is dropped
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout.max(Duration::from_millis(1));
        self
    }

    /// Pump until shutdown, eviction or a failed write.
    ///
    /// Always unregisters from the hub and closes the connection on the way out.
    pub async fn run<F>(mut self, shutdown: F) -> PumpExit
    where
        F: Future<Output = ()>,
    {
        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break PumpExit::Cancelled,
                message = self.queue.recv() => match message {
                    Some(payload) => {
                        let batch = self.batch(payload);
                        match timeout(self.write_timeout, self.connection.send_text(batch)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!("Failed to write to subscriber {}: {}", self.id, e);
                                break PumpExit::WriteFailed;
                            }
                            Err(_) => {
                                warn!(
                                    "Write to subscriber {} timed out after {:?}",
                                    self.id, self.write_timeout
                                );
                                break PumpExit::WriteFailed;
                            }
                        }
                    }
                    None => {
                        debug!("Subscriber {} queue closed by hub", self.id);
                        break PumpExit::Evicted;
                    }
                },
                _ = keepalive.tick() => {
                    match timeout(self.write_timeout, self.connection.send_ping()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("Keepalive to subscriber {} failed: {}", self.id, e);
                            break PumpExit::WriteFailed;
                        }
                        Err(_) => {
                            debug!("Keepalive to subscriber {} timed out", self.id);
                            break PumpExit::WriteFailed;
                        }
                    }
                }
            }
        };

        // hub may already be gone
        let _ = self.unregister.send(self.id).await;
        match timeout(self.write_timeout, self.connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing subscriber {}: {}", self.id, e),
            Err(_) => debug!("Closing subscriber {} timed out", self.id),
        }

        debug!("Subscriber {} pump stopped: {:?}", self.id, exit);
        exit
    }

    /// Join `first` with everything already queued, newline separated
    fn batch(&mut self, first: Bytes) -> Bytes {
        let next = match self.queue.try_recv() {
            Ok(next) => next,
            Err(_) => return first,
        };

        let mut buf = BytesMut::with_capacity(first.len() + next.len() + 1);
        buf.extend_from_slice(&first);
        buf.put_u8(b'\n');
        buf.extend_from_slice(&next);
        while let Ok(more) = self.queue.try_recv() {
            buf.put_u8(b'\n');
            buf.extend_from_slice(&more);
        }
        buf.freeze()
    }
}
