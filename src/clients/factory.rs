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

//! Production [`crate::coordinator::ClientFactory`]: builds HTTP-backed
//! PKG/CDN/mix-chain clients fresh from each round's fetched
//! [`SignedConfig`], sharing one connection-cached
//! [`AuthenticatedHttpClient`] underneath.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::signed_config::SignedConfig;
use crate::coordinator::ClientFactory;
use crate::core::security::keystore::SignerBackend;
use crate::networking::transport::http::AuthenticatedHttpClient;

use super::cdn::HttpCdnClient;
use super::mix_chain::HttpMixChainClient;
use super::pkg::HttpPkgClient;

/// Builds the three collaborator clients a coordinator needs for one
/// round, all sharing `http`'s connection cache.
pub struct HttpClientFactory<B: SignerBackend> {
    http: Arc<AuthenticatedHttpClient<B>>,
}

impl<B: SignerBackend> HttpClientFactory<B> {
    /// Construct a factory presenting `http`'s identity to every peer.
    pub fn new(http: Arc<AuthenticatedHttpClient<B>>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl<B: SignerBackend + Send + Sync + 'static> ClientFactory for HttpClientFactory<B> {
    type Pkg = HttpPkgClient<B>;
    type Cdn = HttpCdnClient<B>;
    type MixChain = HttpMixChainClient<B>;

    fn pkg_clients(&self, config: &SignedConfig) -> Vec<Arc<Self::Pkg>> {
        config
            .payload
            .pkg_servers
            .as_ref()
            .map(|servers| {
                servers
                    .iter()
                    .map(|s| {
                        Arc::new(HttpPkgClient::new(
                            self.http.clone(),
                            s.address.clone(),
                            s.address.clone(),
                            s.key.clone(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn cdn_client(&self, config: &SignedConfig) -> Arc<Self::Cdn> {
        Arc::new(HttpCdnClient::new(
            self.http.clone(),
            config.payload.cdn_endpoint.clone(),
            config.payload.cdn_endpoint.clone(),
            config.payload.cdn_key.clone(),
        ))
    }

    fn mix_chain_client(&self, config: &SignedConfig) -> Arc<Self::MixChain> {
        // `SignedConfig::validate` rejects an empty mix chain unconditionally
        // (not just when a previous config is available), and
        // `PersistedState::bootstrap` now runs that same structural check
        // against the operator-supplied seed config, so every config this
        // factory is ever handed is guaranteed to have a first hop.
        let first = config
            .payload
            .mix_chain
            .first()
            .expect("signed config validation guarantees a non-empty mix chain");
        Arc::new(HttpMixChainClient::new(
            self.http.clone(),
            first.address.clone(),
            first.address.clone(),
            first.key.clone(),
        ))
    }
}
