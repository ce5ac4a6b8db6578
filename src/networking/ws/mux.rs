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

//! `msgID -> handler` registry.
//!
//! The original fabric resolves the handler's argument type by runtime
//! reflection. Here each registration closes over its own `decode + invoke`
//! pair at the call site, so the mux itself never needs to know concrete
//! message types — dispatch is a `HashMap` lookup into a boxed closure,
//! not type introspection.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use super::envelope::{Envelope, EnvelopeError};

/// Mux dispatch errors.
#[derive(Debug, Error)]
pub enum MuxError {
    /// No handler is registered for the envelope's `ID`.
    #[error("unknown message id")]
    UnknownId,
    /// The payload failed to decode as the handler's declared type.
    #[error("decode: {0}")]
    Decode(#[from] EnvelopeError),
}

type Handler<Ctx> = dyn Fn(Ctx, &Envelope) -> Result<(), MuxError> + Send + Sync;

/// A mapping from message ID to a decode-and-invoke handler, parameterized
/// over the per-connection context `Ctx` handlers receive (typically an
/// `Arc<ConnHandle>` or similar cheaply-cloneable handle).
pub struct Mux<Ctx> {
    handlers: HashMap<&'static str, Arc<Handler<Ctx>>>,
}

impl<Ctx: Clone + Send + 'static> Default for Mux<Ctx> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<Ctx: Clone + Send + 'static> Mux<Ctx> {
    /// Construct an empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `id`. `f` is spawned on a fresh `tokio` task
    /// per invocation by [`Mux::dispatch`], so a slow handler can never
    /// stall the connection's read loop.
    pub fn register<T, F, Fut>(&mut self, id: &'static str, f: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Ctx, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handlers.insert(
            id,
            Arc::new(move |ctx: Ctx, env: &Envelope| -> Result<(), MuxError> {
                let value: T = env.decode()?;
                let f = f.clone();
                tokio::spawn(async move {
                    f(ctx, value).await;
                });
                Ok(())
            }),
        );
    }

    /// Decode `env`'s payload using the handler registered for its `ID`
    /// and invoke that handler on a fresh task. Returns immediately once
    /// the task is spawned; does not wait for the handler to finish.
    pub fn dispatch(&self, ctx: Ctx, env: &Envelope) -> Result<(), MuxError> {
        match self.handlers.get(env.id.as_str()) {
            Some(handler) => handler(ctx, env),
            None => {
                warn!(id = %env.id, "no handler registered for message id");
                Err(MuxError::UnknownId)
            }
        }
    }
}
