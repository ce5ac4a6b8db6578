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

//! A single websocket connection, run as one fused task selecting between
//! read-ready, write-ready, and the ping tick — rather than the classic
//! two-goroutines-per-socket shape, so slow application handlers (run on
//! their own spawned task via the mux) can never stall this connection's
//! read loop, and the loop itself never blocks on a send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::envelope::{Envelope, EnvelopeError, MAX_MESSAGE_BYTES};
use super::mux::Mux;

/// Outbound send queue capacity; a connection whose queue fills is shed.
pub const SEND_QUEUE_CAPACITY: usize = 64;
/// Ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Pong deadline; reset on every received pong.
pub const PONG_DEADLINE: Duration = Duration::from_secs(300);

/// Opaque per-connection identifier, assigned at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    /// Allocate the next connection ID. Process-wide and monotonic; never
    /// reused, so a stale ID from a shed connection can't alias a new one.
    pub fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Connection errors surfaced to callers outside the connection task.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The outbound queue is full; the hub sheds this connection.
    #[error("send queue full")]
    QueueFull,
}

/// A handle mux handlers and the hub use to address one connection without
/// holding a back-pointer into the hub itself (breaks the hub/connection
/// ownership cycle: the hub owns the connection's lifetime, the connection
/// is only ever reached through this handle or unregistered through the
/// channel it was handed at registration).
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::Sender<Message>,
}

impl ConnHandle {
    /// This connection's ID.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Enqueue an envelope for delivery, non-blocking. A full queue is the
    /// hub's signal to shed this connection.
    pub fn send_envelope(&self, env: &Envelope) -> Result<(), ConnError> {
        let bytes = env.to_frame_bytes().map_err(|_| ConnError::QueueFull)?;
        self.tx.try_send(Message::Text(String::from_utf8_lossy(&bytes).into_owned())).map_err(|_| ConnError::QueueFull)
    }
}

/// Drive one websocket connection until it closes, a framing error occurs,
/// the pong deadline elapses, or the outbound queue is closed by the hub.
///
/// `make_ctx` builds the context value handlers registered on `mux`
/// receive, given this connection's handle — typically bundling the
/// handle together with a shared coordinator state reference.
pub async fn run_connection<Ctx, F>(
    socket: WebSocket,
    conn_id: ConnId,
    mux: Arc<Mux<Ctx>>,
    make_ctx: F,
    unregister: mpsc::UnboundedSender<ConnId>,
) -> Arc<ConnHandle>
where
    Ctx: Clone + Send + 'static,
    F: FnOnce(Arc<ConnHandle>) -> Ctx,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
    let handle = Arc::new(ConnHandle { id: conn_id, tx: queue_tx });
    let ctx = make_ctx(handle.clone());
    let returned_handle = handle.clone();

    tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        let mut pong_deadline = Box::pin(tokio::time::sleep(PONG_DEADLINE));

        loop {
            tokio::select! {
                _ = &mut pong_deadline => {
                    debug!(conn = conn_id.0, "pong deadline elapsed; closing");
                    break;
                }
                _ = ping_ticker.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                outgoing = queue_rx.recv() => {
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
                        Some(Ok(Message::Pong(_))) => {
                            pong_deadline.as_mut().reset(Instant::now() + PONG_DEADLINE);
                        }
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_MESSAGE_BYTES {
                                warn!(conn = conn_id.0, "oversized frame; closing connection");
                                break;
                            }
                            match Envelope::from_frame_bytes(text.as_bytes()) {
                                Ok(env) => {
                                    if let Err(e) = mux.dispatch(ctx.clone(), &env) {
                                        debug!(conn = conn_id.0, err = %e, "dispatch error");
                                    }
                                }
                                Err(EnvelopeError::Oversized) => {
                                    warn!(conn = conn_id.0, "oversized frame; closing connection");
                                    break;
                                }
                                Err(EnvelopeError::Malformed) => {
                                    debug!(conn = conn_id.0, "malformed envelope; ignoring frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }

        let _ = unregister.send(conn_id);
    });

    returned_handle
}
