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

//! Mixer building blocks shared by the AddFriend and Dialing flavors: the
//! fixed-size mix-message layout, Laplace cover-noise generation, onion
//! wrapping, final-hop shuffling, per-mailbox grouping, and mailbox
//! publication. The per-flavor noise/shuffle/group logic is a library used
//! by the mix chain's own servers, which are external collaborators
//! outside this crate's scope; [`generate_noise_counted`] and
//! [`publish_round`] below are this crate's own composition of that
//! library with the CDN client and metrics, for whichever binary in the
//! mix chain embeds it.

pub mod addfriend;
pub mod dialing;
pub mod onion;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use rand_distr::{Distribution, Laplace};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::clients::cdn::{CdnClient, CdnError};
use crate::core::types::{decode_canonical_limited, encode_canonical, RoundNumber, RoundSettings, ServiceName};
use crate::monitoring::metrics::Metrics;

/// 4-byte big-endian mailbox index prefixing every inner mix message.
pub const MAILBOX_HEADER_LEN: usize = 4;
/// Fixed AddFriend payload length (encrypted introduction, first 32 bytes
/// of which may carry a hash-to-curve image).
pub const SIZE_ENCRYPTED_INTRO: usize = 256;
/// Fixed Dialing payload length (a call-setup token).
pub const SIZE_DIALING_TOKEN: usize = 32;
/// Mix messages are fanned out to noise-generation workers in chunks of
/// this size, the unit of work handed to each spawned task.
const NOISE_CHUNK_SIZE: usize = 64;
/// Target false-positive rate for per-mailbox dialing Bloom filters.
pub const DIALING_BLOOM_FPR: f64 = 1e-6;

/// Mixer errors.
#[derive(Debug, Error)]
pub enum MixerError {
    /// Onion wrapping failed.
    #[error("onion: {0}")]
    Onion(#[from] onion::OnionError),
    /// Service data failed to encode or decode.
    #[error("service data codec")]
    Codec,
    /// A noise-generation worker task was lost (panicked or was dropped).
    #[error("noise worker lost")]
    WorkerLost,
    /// The grouped mailbox mapping failed to publish to the CDN.
    #[error("publish: {0}")]
    Publish(#[from] CdnError),
}

/// Laplace cover-noise parameters, one pair per round, carried inside
/// [`ServiceData`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LaplaceParams {
    /// Distribution mean.
    pub mu: f64,
    /// Distribution scale.
    pub b: f64,
}

/// Opaque service data a mixer parses out of `RoundSettings::service_data`:
/// how many mailboxes this round has, and this round's cover-noise
/// parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceData {
    /// Number of real mailboxes; mailbox `0` is always the dummy
    /// dead-drop, so valid mailbox labels range `1..=num_mailboxes`.
    pub num_mailboxes: u32,
    /// This round's Laplace cover-noise parameters.
    pub laplace: LaplaceParams,
}

const SERVICE_DATA_VERSION: u8 = 1;

impl ServiceData {
    /// Version-prefixed canonical encoding, matching the versioning
    /// discipline `persistence::PersistedState` uses on disk.
    pub fn encode(&self) -> Result<Vec<u8>, MixerError> {
        let mut out = Vec::with_capacity(1 + 32);
        out.push(SERVICE_DATA_VERSION);
        out.extend(encode_canonical(self).map_err(|_| MixerError::Codec)?);
        Ok(out)
    }

    /// Inverse of [`ServiceData::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, MixerError> {
        match bytes.first() {
            Some(&SERVICE_DATA_VERSION) => {
                decode_canonical_limited(&bytes[1..], 1 << 16).map_err(|_| MixerError::Codec)
            }
            _ => Err(MixerError::Codec),
        }
    }
}

/// Shared contract implemented by both mix-message flavors. Neither flavor
/// expects a reply, so `bidirectional` is always `false` and `size_reply`
/// always `None`.
#[async_trait]
pub trait Mixer: Send + Sync {
    /// Whether clients expect a per-submission reply. Always `false` here.
    fn bidirectional(&self) -> bool {
        false
    }

    /// Fixed size, in bytes, of every inner mix message this flavor
    /// produces and consumes (mailbox header plus payload).
    fn size_incoming(&self) -> usize;

    /// Fixed reply size, or `None` when unidirectional. Always `None` here.
    fn size_reply(&self) -> Option<usize> {
        None
    }

    /// Parse this round's opaque `service_data` into typed settings.
    fn parse_service_data(&self, bytes: &[u8]) -> Result<ServiceData, MixerError>;

    /// Generate this mix server's cover-noise onions for `settings`,
    /// wrapped for the chain remaining beyond `my_pos`.
    async fn generate_noise(
        &self,
        settings: &RoundSettings,
        my_pos: usize,
        data: &ServiceData,
    ) -> Result<Vec<Vec<u8>>, MixerError>;

    /// Final-hop handling: shuffle the fully peeled batch, drop malformed
    /// and dummy messages, and group the rest by mailbox.
    fn handle_messages(
        &self,
        data: &ServiceData,
        messages: Vec<Vec<u8>>,
    ) -> Result<std::collections::BTreeMap<String, Vec<u8>>, MixerError>;
}

/// Run [`Mixer::generate_noise`] and record how many cover-noise onions it
/// produced against [`Metrics::noise_onions_generated_total`], labeled by
/// `service`. This is the counted entry point the mix chain's own server
/// calls instead of `Mixer::generate_noise` directly, so the metric stays
/// accurate however many mix-server positions embed this library.
pub async fn generate_noise_counted<M: Mixer + ?Sized>(
    mixer: &M,
    settings: &RoundSettings,
    my_pos: usize,
    data: &ServiceData,
    metrics: &Metrics,
    service: ServiceName,
) -> Result<Vec<Vec<u8>>, MixerError> {
    let onions = mixer.generate_noise(settings, my_pos, data).await?;
    metrics
        .noise_onions_generated_total
        .with_label_values(&[service.as_str()])
        .inc_by(onions.len() as u64);
    Ok(onions)
}

/// Compose final-hop handling with CDN publication: run
/// [`Mixer::handle_messages`] to shuffle, drop, and group the fully peeled
/// batch, then `PUT` the grouped mapping to the bucket the coordinator
/// provisioned for `(service, round)`, returning the mailbox URL clients
/// are broadcast. This is the last mix server's own responsibility per the
/// mixer-primitives contract; `handle_messages` alone never reaches the
/// CDN on its own.
pub async fn publish_round<M, C>(
    mixer: &M,
    cdn: &C,
    service: ServiceName,
    round: RoundNumber,
    data: &ServiceData,
    messages: Vec<Vec<u8>>,
) -> Result<String, MixerError>
where
    M: Mixer + ?Sized,
    C: CdnClient + ?Sized,
{
    let grouped: BTreeMap<String, Vec<u8>> = mixer.handle_messages(data, messages)?;
    let url = cdn.put(service, round, grouped).await?;
    Ok(url)
}

/// Sample a non-negative integer count from `Lap(mu, b)`, resampling on
/// negative draws. Not constant-time: an accepted limitation noted in
/// DESIGN.md, since constant-time sampling is out of scope for this core.
fn sample_truncated_laplace_count<R: Rng + ?Sized>(params: &LaplaceParams, rng: &mut R) -> u32 {
    let dist = Laplace::new(params.mu, params.b).expect("laplace params validated at config load");
    loop {
        let sample = dist.sample(rng);
        if sample >= 0.0 {
            return sample.round() as u32;
        }
    }
}

/// Build the length-`N` noise plan: for each mailbox label `b` in
/// `[0, num_mailboxes]` (inclusive; `0` is the dummy), sample a count from
/// the truncated Laplace distribution and append that many copies of `b`
/// in block order.
pub fn generate_noise_plan<R: Rng + ?Sized>(num_mailboxes: u32, laplace: &LaplaceParams, rng: &mut R) -> Vec<u32> {
    let mut plan = Vec::new();
    for mailbox in 0..=num_mailboxes {
        let count = sample_truncated_laplace_count(laplace, rng);
        plan.extend(std::iter::repeat(mailbox).take(count as usize));
    }
    plan
}

/// Build one onion per entry in `plan` by calling `build_slot` (which must
/// be cheap to clone via `Arc` and safe to run on any task), fanning the
/// work out across chunked `tokio::spawn`ed workers the way `ws::hub`
/// spawns one task per dispatched message rather than pulling in a
/// generic data-parallelism dependency the base crate never used.
pub(crate) async fn generate_slots_parallel<F>(plan: Vec<u32>, build_slot: F) -> Result<Vec<Vec<u8>>, MixerError>
where
    F: Fn(u32) -> Result<Vec<u8>, MixerError> + Send + Sync + 'static,
{
    if plan.is_empty() {
        return Ok(Vec::new());
    }
    let build_slot = Arc::new(build_slot);
    let chunk_count = plan.len().div_ceil(NOISE_CHUNK_SIZE);
    let (tx, mut rx) = mpsc::channel(chunk_count.max(1));

    for chunk in plan.chunks(NOISE_CHUNK_SIZE) {
        let chunk = chunk.to_vec();
        let build_slot = Arc::clone(&build_slot);
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut out = Vec::with_capacity(chunk.len());
            for mailbox in chunk {
                out.push(build_slot(mailbox));
            }
            let _ = tx.send(out).await;
        });
    }
    drop(tx);

    let mut onions = Vec::new();
    let mut received_chunks = 0usize;
    while let Some(batch) = rx.recv().await {
        received_chunks += 1;
        for slot in batch {
            onions.push(slot?);
        }
    }
    if received_chunks != chunk_count {
        return Err(MixerError::WorkerLost);
    }
    Ok(onions)
}

/// Drop malformed inner messages (wrong length) and parse the rest into
/// `(mailbox, payload)` pairs, shared by both flavors' `handle_messages`.
pub(crate) fn parse_fixed_size_messages(messages: Vec<Vec<u8>>, size_incoming: usize) -> Vec<(u32, Vec<u8>)> {
    messages
        .into_iter()
        .filter_map(|msg| {
            if msg.len() != size_incoming {
                return None;
            }
            let mailbox = u32::from_be_bytes(msg[..MAILBOX_HEADER_LEN].try_into().expect("checked length"));
            Some((mailbox, msg[MAILBOX_HEADER_LEN..].to_vec()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::cdn::fake::FakeCdnClient;
    use crate::core::types::{PublicKey, RoundNumber};
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn generate_noise_counted_increments_metrics_by_onion_count() {
        let mixer = addfriend::AddFriendMixer;
        let metrics = Metrics::new().unwrap();
        let settings = RoundSettings {
            service: ServiceName::AddFriend,
            round: RoundNumber(1),
            onion_keys: vec![PublicKey(vec![1u8; 32])],
            service_data: Vec::new(),
        };
        let data = ServiceData { num_mailboxes: 4, laplace: LaplaceParams { mu: 3.0, b: 1.0 } };

        let onions = generate_noise_counted(&mixer, &settings, 0, &data, &metrics, ServiceName::AddFriend)
            .await
            .unwrap();

        assert_eq!(
            metrics.noise_onions_generated_total.with_label_values(&["addfriend"]).get(),
            onions.len() as u64
        );
    }

    #[tokio::test]
    async fn publish_round_composes_handle_messages_with_cdn_put() {
        let mixer = dialing::DialingMixer;
        let cdn = FakeCdnClient::default();
        let data = ServiceData { num_mailboxes: 1, laplace: LaplaceParams { mu: 1.0, b: 1.0 } };
        let size = mixer.size_incoming();

        let mut token = vec![0u8; size];
        token[..MAILBOX_HEADER_LEN].copy_from_slice(&1u32.to_be_bytes());
        token[MAILBOX_HEADER_LEN] = 0x42;

        let round = RoundNumber(7);
        let url = publish_round(&mixer, &cdn, ServiceName::Dialing, round, &data, vec![token])
            .await
            .unwrap();

        assert_eq!(url, format!("memory://{}/{}", ServiceName::Dialing.as_str(), round.0));
        let published = cdn.get(ServiceName::Dialing, round, "1").expect("mailbox 1 published");
        assert!(!published.is_empty());
    }

    #[test]
    fn service_data_round_trips() {
        let data = ServiceData { num_mailboxes: 7, laplace: LaplaceParams { mu: 2.0, b: 1.0 } };
        let bytes = data.encode().unwrap();
        let back = ServiceData::decode(&bytes).unwrap();
        assert_eq!(back.num_mailboxes, 7);
        assert_eq!(back.laplace.mu, 2.0);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let err = ServiceData::decode(&[0xFF, 0, 0]).unwrap_err();
        assert!(matches!(err, MixerError::Codec));
    }

    #[test]
    fn noise_plan_covers_every_mailbox_label_in_block_order() {
        let laplace = LaplaceParams { mu: 3.0, b: 1.0 };
        let mut rng = OsRng;
        let plan = generate_noise_plan(4, &laplace, &mut rng);
        // block order: every occurrence of label b precedes every
        // occurrence of label b+1.
        let mut last = 0i64;
        for &label in &plan {
            assert!(label as i64 >= last);
            last = label as i64;
        }
    }

    #[tokio::test]
    async fn parallel_slot_generation_preserves_count() {
        let plan: Vec<u32> = (0..500).map(|i| i % 3).collect();
        let n = plan.len();
        let onions = generate_slots_parallel(plan, |mailbox| Ok(vec![mailbox as u8])).await.unwrap();
        assert_eq!(onions.len(), n);
    }

    #[test]
    fn parse_fixed_size_messages_drops_wrong_length() {
        let messages = vec![vec![0u8; 10], vec![0u8; 8]];
        let parsed = parse_fixed_size_messages(messages, 8);
        assert_eq!(parsed.len(), 1);
    }
}
