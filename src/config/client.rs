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

//! `ConfigClient`: fetch the current signed config for a service. Modeled
//! as a narrow async trait so tests can substitute an in-memory fake
//! instead of the production HTTP implementation, the same seam the
//! keystore uses for [`crate::core::security::keystore::SignerBackend`].

use async_trait::async_trait;
use thiserror::Error;

use crate::core::security::keystore::SignerBackend;
use crate::core::types::{PublicKey, ServiceName};
use crate::networking::transport::http::{AuthenticatedHttpClient, HttpClientError};

use super::signed_config::SignedConfig;

/// Config client errors.
#[derive(Debug, Error)]
pub enum ConfigClientError {
    /// The HTTP fetch failed.
    #[error("http: {0}")]
    Http(#[from] HttpClientError),
    /// The response body could not be parsed as a `SignedConfig`.
    #[error("malformed response")]
    Malformed,
}

/// Fetches the current signed config for a service.
#[async_trait]
pub trait ConfigClient: Send + Sync {
    /// Retrieve the currently active config for `service`.
    async fn current_config(&self, service: ServiceName) -> Result<SignedConfig, ConfigClientError>;
}

/// Production `ConfigClient` backed by an authenticated HTTP GET against
/// the signed-config server.
pub struct HttpConfigClient<B: SignerBackend> {
    http: std::sync::Arc<AuthenticatedHttpClient<B>>,
    base_url: String,
    addr: String,
    server_key: PublicKey,
}

impl<B: SignerBackend> HttpConfigClient<B> {
    /// Construct a client pinned to `server_key` at `addr`, issuing
    /// requests against `base_url`.
    pub fn new(http: std::sync::Arc<AuthenticatedHttpClient<B>>, base_url: String, addr: String, server_key: PublicKey) -> Self {
        Self { http, base_url, addr, server_key }
    }
}

#[async_trait]
impl<B: SignerBackend + Send + Sync> ConfigClient for HttpConfigClient<B> {
    async fn current_config(&self, service: ServiceName) -> Result<SignedConfig, ConfigClientError> {
        let url = format!("{}/current?service={}", self.base_url, service.as_str());
        let body = self.http.get(&url, &self.addr, &self.server_key).await?;
        serde_json::from_slice(&body).map_err(|_| ConfigClientError::Malformed)
    }
}
