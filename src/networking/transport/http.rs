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

//! Authenticated HTTP client: the edTLS handshake wrapped in a `reqwest`
//! client, pinned to the peer's expected long-lived Ed25519 key and cached
//! per `(addr, pinned key)` so repeated calls to the same CDN/PKG/mix
//! server reuse one connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

use super::edtls::{EdtlsError, EphemeralCert};
use crate::core::security::keystore::{Keystore, SignerBackend};
use crate::core::types::PublicKey;

/// Authenticated HTTP client errors.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The edTLS handshake or vouch verification failed.
    #[error("edTLS: {0}")]
    Edtls(#[from] EdtlsError),
    /// The underlying HTTP request failed.
    #[error("request")]
    Request,
    /// The server responded with a non-success status.
    #[error("server responded with status {0}")]
    Status(u16),
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct CacheKey {
    addr: String,
    pinned_key: Vec<u8>,
}

/// HTTPS client authenticated by edTLS, pinning the expected peer key per
/// request and caching one `(EphemeralCert, reqwest::Client)` pair per
/// `(addr, pinned_key)`.
pub struct AuthenticatedHttpClient<B: SignerBackend> {
    signer: Arc<Keystore<B>>,
    cache: Mutex<HashMap<CacheKey, (EphemeralCert, Client)>>,
}

impl<B: SignerBackend> AuthenticatedHttpClient<B> {
    /// Construct a client that presents `signer`'s identity to every peer.
    pub fn new(signer: Arc<Keystore<B>>) -> Self {
        Self { signer, cache: Mutex::new(HashMap::new()) }
    }

    /// Fetch or build the cached client for `(addr, pinned_key)`. A fresh
    /// ephemeral certificate is minted for every new cache entry; entries
    /// whose certificate has crossed the refresh threshold are rebuilt.
    fn client_for(&self, addr: &str, pinned_key: &PublicKey) -> Result<Client, HttpClientError> {
        let key = CacheKey { addr: addr.to_string(), pinned_key: pinned_key.0.clone() };

        let mut cache = self.cache.lock().expect("http client cache poisoned");
        if let Some((cert, client)) = cache.get(&key) {
            if !cert.needs_refresh() {
                return Ok(client.clone());
            }
        }

        let cert = EphemeralCert::mint(&self.signer)?;
        let client = build_client(&cert, pinned_key)?;
        cache.insert(key, (cert, client.clone()));
        Ok(client)
    }

    /// Issue an authenticated `GET`, verifying the peer vouches for
    /// `expected_peer_key` before returning the body.
    pub async fn get(
        &self,
        url: &str,
        addr: &str,
        expected_peer_key: &PublicKey,
    ) -> Result<Vec<u8>, HttpClientError> {
        let client = self.client_for(addr, expected_peer_key)?;
        let resp = client.get(url).send().await.map_err(|_| HttpClientError::Request)?;
        self.finish(resp).await
    }

    /// Issue an authenticated `POST` with an opaque body, verifying the
    /// peer vouches for `expected_peer_key`.
    pub async fn post(
        &self,
        url: &str,
        addr: &str,
        expected_peer_key: &PublicKey,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, HttpClientError> {
        let client = self.client_for(addr, expected_peer_key)?;
        let resp = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|_| HttpClientError::Request)?;
        self.finish(resp).await
    }

    async fn finish(&self, resp: reqwest::Response) -> Result<Vec<u8>, HttpClientError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpClientError::Status(status.as_u16()));
        }
        resp.bytes().await.map(|b| b.to_vec()).map_err(|_| HttpClientError::Request)
    }
}

/// Build a `reqwest::Client` presenting `cert` as its client identity and
/// pinning the peer to `expected_peer_key`.
///
/// `reqwest`'s high-level TLS options (`identity`, `danger_accept_invalid_certs`,
/// `min_tls_version`) only configure its default backend; they are bypassed
/// here in favor of `use_preconfigured_tls`, which installs a `rustls`
/// `ClientConfig` built by
/// [`crate::networking::transport::edtls::build_authenticated_client_config`]
/// — the same `PinnedServerVerifier` the websocket client's
/// [`crate::networking::ws::client::ClientConn::dial`] installs, plus this
/// side's own client certificate for the peer's mutual-auth handshake. A
/// peer presenting any certificate other than the one vouched for by
/// `expected_peer_key` fails the handshake; there is no longer a
/// trust-bypassing code path on this client.
fn build_client(cert: &EphemeralCert, expected_peer_key: &PublicKey) -> Result<Client, HttpClientError> {
    let tls_config = super::edtls::build_authenticated_client_config(cert, expected_peer_key.clone())?;

    Client::builder()
        .use_preconfigured_tls(tls_config)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|_| HttpClientError::Request)
}
