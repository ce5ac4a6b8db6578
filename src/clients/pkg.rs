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

//! `PkgClient`: request a new PKG round from every package server for the
//! AddFriend service. Identity-based key issuance itself is out of scope —
//! this is only the coordinator-side caller.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::security::keystore::SignerBackend;
use crate::core::types::{PkgRound, PublicKey, RoundNumber};
use crate::networking::transport::http::{AuthenticatedHttpClient, HttpClientError};

/// PKG client errors.
#[derive(Debug, Error)]
pub enum PkgError {
    /// The HTTP call failed or the server responded with a non-OK status.
    #[error("http: {0}")]
    Http(#[from] HttpClientError),
    /// The response body did not decode as a `PkgRound`.
    #[error("malformed response")]
    Malformed,
}

/// Requests a new PKG round.
#[async_trait]
pub trait PkgClient: Send + Sync {
    /// Ask this PKG server to produce settings for `round`.
    async fn new_round(&self, round: RoundNumber) -> Result<PkgRound, PkgError>;
}

/// Production PKG client over authenticated HTTP.
pub struct HttpPkgClient<B: SignerBackend> {
    http: std::sync::Arc<AuthenticatedHttpClient<B>>,
    base_url: String,
    addr: String,
    server_key: PublicKey,
}

impl<B: SignerBackend> HttpPkgClient<B> {
    /// Construct a client pinned to `server_key` at `addr`.
    pub fn new(http: std::sync::Arc<AuthenticatedHttpClient<B>>, base_url: String, addr: String, server_key: PublicKey) -> Self {
        Self { http, base_url, addr, server_key }
    }
}

#[async_trait]
impl<B: SignerBackend + Send + Sync> PkgClient for HttpPkgClient<B> {
    async fn new_round(&self, round: RoundNumber) -> Result<PkgRound, PkgError> {
        let url = format!("{}/newround?round={}", self.base_url, round.0);
        let body = self
            .http
            .post(&url, &self.addr, &self.server_key, "application/octet-stream", Vec::new())
            .await?;
        serde_json::from_slice(&body).map_err(|_| PkgError::Malformed)
    }
}
