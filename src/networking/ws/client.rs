// Copyright (c) 2026 Alpenhorn Coordinator
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Symmetric websocket client: dial with edTLS pinning, ping loop, pong
//! deadline, and round-trip latency measurement.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::conn::{PING_INTERVAL, PONG_DEADLINE};
use super::envelope::{Envelope, EnvelopeError, MAX_MESSAGE_BYTES};
use super::mux::Mux;
use crate::core::types::PublicKey;

/// Client-side websocket errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The TLS handshake or the initial websocket upgrade failed.
    #[error("dial failed")]
    Dial,
    /// The outbound queue is full.
    #[error("send queue full")]
    QueueFull,
}

/// A dialed connection to a coordinator (or any peer speaking the same
/// envelope fabric), with its own ping loop and latency tracking.
pub struct ClientConn {
    tx: mpsc::Sender<WsMessage>,
    last_latency_ms: Arc<AtomicI64>,
}

impl ClientConn {
    /// Dial `url`, pinning the peer's edTLS vouch to `expected_peer_key`.
    /// Decoded envelopes are dispatched through `mux` with `ctx` as the
    /// handler context.
    pub async fn dial<Ctx>(
        url: &str,
        expected_peer_key: PublicKey,
        mux: Arc<Mux<Ctx>>,
        ctx: Ctx,
    ) -> Result<Self, ClientError>
    where
        Ctx: Clone + Send + 'static,
    {
        let tls_config = super::super::transport::edtls::build_client_tls_config(expected_peer_key);
        let connector = tokio_tungstenite::Connector::Rustls(tls_config);
        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
            .await
            .map_err(|_| ClientError::Dial)?;
        Ok(Self::spawn(ws_stream, mux, ctx))
    }

    fn spawn<Ctx>(
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mux: Arc<Mux<Ctx>>,
        ctx: Ctx,
    ) -> Self
    where
        Ctx: Clone + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<WsMessage>(super::conn::SEND_QUEUE_CAPACITY);
        let last_latency_ms = Arc::new(AtomicI64::new(-1));
        let latency_for_task = last_latency_ms.clone();

        tokio::spawn(async move {
            let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
            let mut last_ping_sent = Instant::now();
            let mut pong_deadline = Box::pin(tokio::time::sleep(PONG_DEADLINE));

            loop {
                tokio::select! {
                    _ = &mut pong_deadline => {
                        debug!("client pong deadline elapsed; closing");
                        break;
                    }
                    _ = ping_ticker.tick() => {
                        last_ping_sent = Instant::now();
                        if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    outgoing = rx.recv() => {
                        match outgoing {
                            Some(msg) => {
                                if ws_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = ws_rx.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Pong(_))) => {
                                pong_deadline.as_mut().reset(Instant::now() + PONG_DEADLINE);
                                let rtt = Instant::now().saturating_duration_since(last_ping_sent);
                                latency_for_task.store(rtt.as_millis() as i64, Ordering::Relaxed);
                            }
                            Some(Ok(WsMessage::Text(text))) => {
                                if text.len() > MAX_MESSAGE_BYTES {
                                    warn!("oversized frame from server; closing");
                                    break;
                                }
                                match Envelope::from_frame_bytes(text.as_bytes()) {
                                    Ok(env) => {
                                        if let Err(e) = mux.dispatch(ctx.clone(), &env) {
                                            debug!(err = %e, "client dispatch error");
                                        }
                                    }
                                    Err(EnvelopeError::Oversized) => break,
                                    Err(EnvelopeError::Malformed) => {
                                        debug!("malformed envelope from server; ignoring frame");
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                }
            }
        });

        Self { tx, last_latency_ms }
    }

    /// Send an envelope to the server, non-blocking.
    pub async fn send(&self, env: &Envelope) -> Result<(), ClientError> {
        let bytes = env.to_frame_bytes().map_err(|_| ClientError::QueueFull)?;
        self.tx
            .try_send(WsMessage::Text(String::from_utf8_lossy(&bytes).into_owned()))
            .map_err(|_| ClientError::QueueFull)
    }

    /// Most recently measured ping round-trip latency, in milliseconds, or
    /// `None` if no pong has been observed yet.
    pub fn latency_ms(&self) -> Option<i64> {
        match self.last_latency_ms.load(Ordering::Relaxed) {
            v if v < 0 => None,
            v => Some(v),
        }
    }

    /// Close the connection: send a websocket close frame so the peer
    /// observes a proper close handshake, then drop the send queue, which
    /// tears down both pump halves (they share a single fused task) on
    /// its next queue poll.
    pub async fn close(self) {
        let _ = self.tx.send(WsMessage::Close(None)).await;
        drop(self.tx);
    }
}
