//! Push server for rate updates. Observers connect over a plain websocket
//! port and receive every `RateUpdate` as a JSON text frame. Each observer
//! gets its own broadcast subscription and its own forwarding task, so one
//! slow or dead connection never holds up the rest of the fan-out: a
//! lagging observer skips frames, a failing one gets dropped.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::BroadcastError;
use crate::types::RateUpdate;

const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-to-client frame. The `type` tag is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "arbitrageRateUpdated", rename_all = "camelCase")]
    ArbitrageRateUpdated {
        path_id: String,
        path_description: String,
        rate: f64,
    },
}

impl From<RateUpdate> for WireMessage {
    fn from(update: RateUpdate) -> Self {
        Self::ArbitrageRateUpdated {
            path_id: update.path_id,
            path_description: update.path_description,
            rate: update.rate,
        }
    }
}

pub struct RateServer {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateServer {
    /// Bind the observer port and start accepting connections. A bind
    /// failure is fatal; everything after that is per-observer.
    pub async fn bind(
        port: u16,
        updates: broadcast::Sender<RateUpdate>,
    ) -> Result<Self, BroadcastError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        info!(target: "broadcaster", %local_addr, "Rate server listening.");

        // A resident subscription keeps the channel open while no
        // observers are attached, and narrates traffic at debug level.
        let monitor = tokio::spawn(monitor_loop(updates.subscribe(), cancel.clone()));
        let accept = tokio::spawn(accept_loop(listener, updates, cancel.clone()));

        Ok(Self {
            cancel,
            local_addr,
            tasks: Mutex::new(vec![monitor, accept]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every observer connection, and drain.
    pub async fn shutdown(&self) {
        info!(target: "broadcaster", "Closing rate server.");
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            if timeout(SHUTDOWN_TASK_TIMEOUT, handle).await.is_err() {
                warn!(target: "broadcaster", "Server task did not stop within timeout.");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    updates: broadcast::Sender<RateUpdate>,
    cancel: CancellationToken,
) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let rx = updates.subscribe();
                        let client_cancel = cancel.child_token();
                        clients.spawn(async move {
                            if let Err(e) = serve_observer(stream, peer, rx, client_cancel).await {
                                debug!(
                                    target: "broadcaster",
                                    %peer,
                                    error = %e,
                                    "Observer connection closed with error."
                                );
                            }
                        });
                    }
                    Err(e) => warn!(target: "broadcaster", error = %e, "Accept failed."),
                }
            }
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
    clients.shutdown().await;
}

async fn serve_observer(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<RateUpdate>,
    cancel: CancellationToken,
) -> Result<(), BroadcastError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| BroadcastError::Handshake(e.to_string()))?;
    info!(target: "broadcaster", %peer, "Observer connected.");
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            update = rx.recv() => {
                match update {
                    Ok(update) => {
                        let frame = match serde_json::to_string(&WireMessage::from(update)) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(target: "broadcaster", error = %e, "Frame serialization failed.");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            debug!(
                                target: "broadcaster",
                                %peer,
                                error = %e,
                                "Send failed, dropping observer."
                            );
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "broadcaster",
                            %peer,
                            skipped,
                            "Observer too slow, rate updates skipped."
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => {
                        info!(target: "broadcaster", %peer, "Observer disconnected.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(target: "broadcaster", %peer, error = %e, "Observer read error.");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn monitor_loop(mut rx: broadcast::Receiver<RateUpdate>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = rx.recv() => match update {
                Ok(update) => debug!(
                    target: "broadcaster",
                    path_id = %update.path_id,
                    rate = update.rate,
                    "Broadcasting rate update."
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }
}
