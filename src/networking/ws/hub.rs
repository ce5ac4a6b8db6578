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

//! Server-side connection set: registration, broadcast, and backpressure
//! shedding.
//!
//! The hub owns every connection's lifetime; a connection never holds a
//! back-pointer to the hub. Instead each connection is handed an
//! `UnregisterHandle` (an unbounded `mpsc` sender) at registration time,
//! which it uses to remove itself when its task exits, breaking the
//! cyclic ownership the original fabric has between hub and connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocket;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::conn::{run_connection, ConnHandle, ConnId};
use super::envelope::Envelope;
use super::mux::Mux;
use crate::monitoring::metrics::Metrics;

/// The live connection set for one coordinator. `Ctx` is the context value
/// handlers registered on `mux` receive.
pub struct Hub<Ctx> {
    connections: Mutex<HashMap<ConnId, Arc<ConnHandle>>>,
    mux: Arc<Mux<Ctx>>,
    unregister_tx: mpsc::UnboundedSender<ConnId>,
    metrics: Arc<Metrics>,
}

impl<Ctx: Clone + Send + 'static> Hub<Ctx> {
    /// Construct a hub and spawn its background unregistration task.
    pub fn new(mux: Arc<Mux<Ctx>>, metrics: Arc<Metrics>) -> Arc<Self> {
        let (unregister_tx, mut unregister_rx) = mpsc::unbounded_channel::<ConnId>();
        let hub = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            mux,
            unregister_tx,
            metrics,
        });

        let weak = Arc::downgrade(&hub);
        tokio::spawn(async move {
            while let Some(id) = unregister_rx.recv().await {
                if let Some(hub) = weak.upgrade() {
                    hub.remove(id);
                } else {
                    break;
                }
            }
        });

        hub
    }

    /// Accept a new websocket connection, registering it under a fresh
    /// [`ConnId`]. `make_ctx` builds the per-connection handler context
    /// from the connection's [`ConnHandle`] (see [`run_connection`]).
    pub async fn register<F>(self: &Arc<Self>, socket: WebSocket, make_ctx: F) -> ConnId
    where
        F: FnOnce(Arc<ConnHandle>) -> Ctx,
    {
        let id = ConnId::next();
        let handle = run_connection(socket, id, self.mux.clone(), make_ctx, self.unregister_tx.clone()).await;

        self.connections.lock().expect("hub connections poisoned").insert(id, handle);
        self.metrics.ws_clients_connected.set(self.connections.lock().expect("hub connections poisoned").len() as i64);
        info!(conn = id.0, "websocket client connected");
        id
    }

    fn remove(&self, id: ConnId) {
        let mut conns = self.connections.lock().expect("hub connections poisoned");
        if conns.remove(&id).is_some() {
            self.metrics.ws_clients_connected.set(conns.len() as i64);
            debug!(conn = id.0, "websocket client disconnected");
        }
    }

    /// Send an envelope to exactly one connection, if it is still live.
    pub fn send_to(&self, id: ConnId, env: &Envelope) {
        let target = self.connections.lock().expect("hub connections poisoned").get(&id).cloned();
        if let Some(handle) = target {
            if handle.send_envelope(env).is_err() {
                self.shed(id);
            }
        }
    }

    /// Broadcast `value` under message ID `id` to every live connection.
    /// The envelope is encoded once; each connection gets a non-blocking
    /// enqueue attempt in iteration order. A connection whose queue is
    /// full is shed immediately rather than allowed to slow the broadcast.
    pub fn broadcast<T: Serialize>(&self, id: &str, value: &T) {
        let env = match Envelope::encode(id, value) {
            Ok(e) => e,
            Err(_) => return,
        };

        let snapshot: Vec<(ConnId, Arc<ConnHandle>)> = self
            .connections
            .lock()
            .expect("hub connections poisoned")
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let mut shed = Vec::new();
        for (conn_id, handle) in snapshot {
            if handle.send_envelope(&env).is_err() {
                shed.push(conn_id);
            }
        }

        for conn_id in shed {
            self.metrics.ws_connections_dropped_total.inc();
            self.shed(conn_id);
        }
    }

    /// Number of currently live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().expect("hub connections poisoned").len()
    }

    /// Whether the hub currently has no live connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shed(&self, id: ConnId) {
        self.remove(id);
    }
}
