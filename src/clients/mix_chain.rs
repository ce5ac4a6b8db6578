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

//! `MixChainClient`: ask the first mix server to set up a round, then hand
//! it the accumulated onions at dispatch. Onion peeling and shuffling
//! happen inside the mix chain itself — out of scope for this crate.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::security::keystore::SignerBackend;
use crate::core::types::{MailboxUrl, MixRound, PublicKey, RoundNumber, ServiceName};
use crate::networking::transport::http::{AuthenticatedHttpClient, HttpClientError};

/// Mix-chain client errors.
#[derive(Debug, Error)]
pub enum MixChainError {
    /// The HTTP call failed or the server responded with a non-OK status.
    #[error("http: {0}")]
    Http(#[from] HttpClientError),
    /// The response body did not decode as expected.
    #[error("malformed response")]
    Malformed,
}

/// Requests round setup and carries dispatch through the mix chain's
/// entry server. The rest of the chain is reached, and signed off on, by
/// that entry server alone.
#[async_trait]
pub trait MixChainClient: Send + Sync {
    /// Ask the chain to agree on settings for `round`, given opaque
    /// `service_data` (CDN coordinates plus mailbox count). Returns the
    /// full settings with one signature per chain position.
    async fn new_round(
        &self,
        service: ServiceName,
        round: RoundNumber,
        service_data: Vec<u8>,
    ) -> Result<MixRound, MixChainError>;

    /// Hand the accumulated onions for `round` to the chain and await the
    /// published mailbox location.
    async fn run_round(
        &self,
        service: ServiceName,
        round: RoundNumber,
        onions: Vec<Vec<u8>>,
    ) -> Result<MailboxUrl, MixChainError>;
}

/// Production mix-chain client talking to the chain's entry server over
/// authenticated HTTP.
pub struct HttpMixChainClient<B: SignerBackend> {
    http: std::sync::Arc<AuthenticatedHttpClient<B>>,
    base_url: String,
    addr: String,
    entry_key: PublicKey,
}

impl<B: SignerBackend> HttpMixChainClient<B> {
    /// Construct a client pinned to the chain entry server's `entry_key`.
    pub fn new(http: std::sync::Arc<AuthenticatedHttpClient<B>>, base_url: String, addr: String, entry_key: PublicKey) -> Self {
        Self { http, base_url, addr, entry_key }
    }
}

#[async_trait]
impl<B: SignerBackend + Send + Sync> MixChainClient for HttpMixChainClient<B> {
    async fn new_round(
        &self,
        service: ServiceName,
        round: RoundNumber,
        service_data: Vec<u8>,
    ) -> Result<MixRound, MixChainError> {
        let url = format!("{}/newround?service={}&round={}", self.base_url, service.as_str(), round.0);
        let body = self
            .http
            .post(&url, &self.addr, &self.entry_key, "application/octet-stream", service_data)
            .await?;
        serde_json::from_slice(&body).map_err(|_| MixChainError::Malformed)
    }

    async fn run_round(
        &self,
        service: ServiceName,
        round: RoundNumber,
        onions: Vec<Vec<u8>>,
    ) -> Result<MailboxUrl, MixChainError> {
        let url = format!("{}/run?service={}&round={}", self.base_url, service.as_str(), round.0);
        let body = serde_json::to_vec(&onions).map_err(|_| MixChainError::Malformed)?;
        let resp = self.http.post(&url, &self.addr, &self.entry_key, "application/json", body).await?;
        serde_json::from_slice(&resp).map_err(|_| MixChainError::Malformed)
    }
}
