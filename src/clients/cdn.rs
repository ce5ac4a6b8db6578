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

//! `CdnClient`: bucket provisioning ahead of a round and mailbox
//! publication at dispatch. The CDN's own on-disk store is out of scope —
//! this is only the coordinator- and mix-server-side caller.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::security::keystore::SignerBackend;
use crate::core::types::{encode_canonical, PublicKey, RoundNumber, ServiceName};
use crate::networking::transport::http::{AuthenticatedHttpClient, HttpClientError};

/// CDN client errors.
#[derive(Debug, Error)]
pub enum CdnError {
    /// The HTTP call failed or the server responded with a non-OK status.
    #[error("http: {0}")]
    Http(#[from] HttpClientError),
    /// The mailbox mapping could not be canonically encoded.
    #[error("encode")]
    Encode,
}

fn bucket_name(service: ServiceName, round: RoundNumber) -> String {
    format!("{}/{}", service.as_str(), round.0)
}

/// Provisions buckets and publishes per-round mailbox contents.
#[async_trait]
pub trait CdnClient: Send + Sync {
    /// Create `bucket = {service}/{round}`, authorizing `uploader_key` as
    /// the sole key permitted to `put` into it.
    async fn new_bucket(
        &self,
        service: ServiceName,
        round: RoundNumber,
        uploader_key: &PublicKey,
    ) -> Result<(), CdnError>;

    /// Upload the grouped `mailbox -> bytes` mapping for `{service}/{round}`.
    /// Returns the base URL clients append `&key=<mailbox>` to.
    async fn put(
        &self,
        service: ServiceName,
        round: RoundNumber,
        mapping: BTreeMap<String, Vec<u8>>,
    ) -> Result<String, CdnError>;
}

/// Production CDN client over authenticated HTTP.
///
/// The reference CDN's wire format for the mailbox mapping is
/// implementation-defined by its own (out-of-scope) on-disk store; this
/// client canonically bincode-encodes `BTreeMap<String, Vec<u8>>` rather
/// than assume a specific foreign encoding, since the CDN's internals are
/// explicitly out of scope for this crate (see DESIGN.md).
pub struct HttpCdnClient<B: SignerBackend> {
    http: std::sync::Arc<AuthenticatedHttpClient<B>>,
    base_url: String,
    addr: String,
    cdn_key: PublicKey,
}

impl<B: SignerBackend> HttpCdnClient<B> {
    /// Construct a client pinned to `cdn_key` at `addr`. Cheap: the
    /// connection cache lives on the shared `http` client, keyed by
    /// `(addr, pinned key)`, so a fresh wrapper can be built every round
    /// from that round's config without losing connection reuse.
    pub fn new(http: std::sync::Arc<AuthenticatedHttpClient<B>>, base_url: String, addr: String, cdn_key: PublicKey) -> Self {
        Self { http, base_url, addr, cdn_key }
    }

    /// The public mailbox URL clients use, given a round's bucket.
    pub fn mailbox_url(&self, service: ServiceName, round: RoundNumber) -> String {
        format!("{}/get?bucket={}", self.base_url, bucket_name(service, round))
    }
}

#[async_trait]
impl<B: SignerBackend + Send + Sync> CdnClient for HttpCdnClient<B> {
    async fn new_bucket(
        &self,
        service: ServiceName,
        round: RoundNumber,
        uploader_key: &PublicKey,
    ) -> Result<(), CdnError> {
        let url = format!(
            "{}/newbucket?bucket={}&uploader={}",
            self.base_url,
            bucket_name(service, round),
            hex::encode(&uploader_key.0),
        );
        self.http
            .post(&url, &self.addr, &self.cdn_key, "application/octet-stream", Vec::new())
            .await?;
        Ok(())
    }

    async fn put(
        &self,
        service: ServiceName,
        round: RoundNumber,
        mapping: BTreeMap<String, Vec<u8>>,
    ) -> Result<String, CdnError> {
        let url = format!("{}/put?bucket={}", self.base_url, bucket_name(service, round));
        let body = encode_canonical(&mapping).map_err(|_| CdnError::Encode)?;
        self.http.post(&url, &self.addr, &self.cdn_key, "application/octet-stream", body).await?;
        Ok(self.mailbox_url(service, round))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory CDN fake for coordinator and mixer tests.
    #[derive(Default)]
    pub struct FakeCdnClient {
        buckets: Mutex<std::collections::BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    }

    #[async_trait]
    impl CdnClient for FakeCdnClient {
        async fn new_bucket(
            &self,
            service: ServiceName,
            round: RoundNumber,
            _uploader_key: &PublicKey,
        ) -> Result<(), CdnError> {
            self.buckets
                .lock()
                .expect("fake cdn poisoned")
                .entry(bucket_name(service, round))
                .or_default();
            Ok(())
        }

        async fn put(
            &self,
            service: ServiceName,
            round: RoundNumber,
            mapping: BTreeMap<String, Vec<u8>>,
        ) -> Result<String, CdnError> {
            let bucket = bucket_name(service, round);
            self.buckets.lock().expect("fake cdn poisoned").insert(bucket.clone(), mapping);
            Ok(format!("memory://{bucket}"))
        }
    }

    impl FakeCdnClient {
        /// Fetch `bucket/key` as a test would via `GET url&key=`.
        pub fn get(&self, service: ServiceName, round: RoundNumber, key: &str) -> Option<Vec<u8>> {
            self.buckets
                .lock()
                .expect("fake cdn poisoned")
                .get(&bucket_name(service, round))?
                .get(key)
                .cloned()
        }
    }
}
