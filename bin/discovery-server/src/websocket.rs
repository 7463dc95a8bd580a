//! WebSocket listener streaming registry snapshots to dashboards

use crate::routes::AppState;
use crate::wait_for_shutdown;
use async_trait::async_trait;
use async_tungstenite::tokio::accept_async;
use async_tungstenite::{WebSocketReceiver, WebSocketSender};
use bytes::Bytes;
use discovery_balancer::{Subscriber, SubscriberConnection, SubscriberPump};
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tungstenite::Message;

/// Per-subscriber knobs
#[derive(Clone, Copy, Debug)]
pub struct SubscriberSettings {
    pub capacity: usize,
    pub keepalive: Duration,
    pub write_timeout: Duration,
}

/// Write half of a WebSocket, driven by a [`SubscriberPump`]
pub struct WsConnection<S> {
    sender: WebSocketSender<S>,
}

impl<S> WsConnection<S> {
    pub fn new(sender: WebSocketSender<S>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S> SubscriberConnection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Error = tungstenite::Error;

    async fn send_text(&mut self, payload: Bytes) -> Result<(), Self::Error> {
        let text = String::from_utf8_lossy(&payload).into_owned();
        self.sender.send(Message::text(text)).await
    }

    async fn send_ping(&mut self) -> Result<(), Self::Error> {
        self.sender.send(Message::Ping(Bytes::new())).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.sender.close(None).await
    }
}

/// Accept WebSocket subscribers until shutdown
pub async fn serve_subscribers(
    listener: TcpListener,
    state: Arc<AppState>,
    settings: SubscriberSettings,
    shutdown: watch::Receiver<bool>,
) {
    let stop = wait_for_shutdown(shutdown.clone());
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(handle_subscriber(
                        stream,
                        peer_addr,
                        state.clone(),
                        settings,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("Error accepting WebSocket connection: {}", e),
            }
        }
    }

    info!("WebSocket listener stopped");
}

async fn handle_subscriber(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<AppState>,
    settings: SubscriberSettings,
    shutdown: watch::Receiver<bool>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };
    let (sender, receiver) = ws.split();

    let (subscriber, queue) = Subscriber::new(settings.capacity);
    let id = subscriber.id();

    // the current state goes out before any broadcast
    match state.snapshot().await {
        Ok(snapshot) => {
            let _ = subscriber.queue().try_send(snapshot);
        }
        Err(e) => warn!("Failed to serialize registry snapshot: {}", e),
    }

    if state.hub().register().send(subscriber).await.is_err() {
        debug!("Broadcast hub stopped; dropping subscriber {}", peer_addr);
        return;
    }
    info!("Subscriber {} connected from {}", id, peer_addr);

    let pump = SubscriberPump::new(
        id,
        queue,
        WsConnection::new(sender),
        state.hub().unregister().clone(),
    )
    .with_keepalive(settings.keepalive)
    .with_write_timeout(settings.write_timeout);

    let disconnected = drain_incoming(receiver);
    let cancelled = wait_for_shutdown(shutdown);
    let exit = pump
        .run(async move {
            tokio::select! {
                _ = disconnected => {}
                _ = cancelled => {}
            }
        })
        .await;

    info!("Subscriber {} from {} disconnected: {:?}", id, peer_addr, exit);
}

/// Read until the peer goes away. Control frames are answered by the stream itself.
async fn drain_incoming<S>(mut receiver: WebSocketReceiver<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        }
    }
}
