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

//! Dialing mix-message flavor: cover-noise payloads are plain random
//! tokens (no hash-to-curve shaping), and the final hop publishes each
//! mailbox's group as a Bloom filter rather than a concatenated byte
//! string, so observers cannot tell which specific tokens were deposited.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::RngCore;

use crate::bloom::BloomFilter;
use crate::core::types::RoundSettings;

use super::onion;
use super::{
    generate_noise_plan, generate_slots_parallel, parse_fixed_size_messages, Mixer, MixerError, ServiceData,
    DIALING_BLOOM_FPR, MAILBOX_HEADER_LEN, SIZE_DIALING_TOKEN,
};

/// The Dialing mixer: fixed-size call-setup tokens, unidirectional,
/// published per mailbox as a Bloom filter.
#[derive(Default)]
pub struct DialingMixer;

#[async_trait]
impl Mixer for DialingMixer {
    fn size_incoming(&self) -> usize {
        MAILBOX_HEADER_LEN + SIZE_DIALING_TOKEN
    }

    fn parse_service_data(&self, bytes: &[u8]) -> Result<ServiceData, MixerError> {
        ServiceData::decode(bytes)
    }

    async fn generate_noise(
        &self,
        settings: &RoundSettings,
        my_pos: usize,
        data: &ServiceData,
    ) -> Result<Vec<Vec<u8>>, MixerError> {
        let mut rng = OsRng;
        let plan = generate_noise_plan(data.num_mailboxes, &data.laplace, &mut rng);
        let onion_keys = settings.onion_keys.get(my_pos + 1..).unwrap_or(&[]).to_vec();

        generate_slots_parallel(plan, move |mailbox| {
            let mut payload = vec![0u8; SIZE_DIALING_TOKEN];
            OsRng.fill_bytes(&mut payload);
            let mut message = Vec::with_capacity(MAILBOX_HEADER_LEN + SIZE_DIALING_TOKEN);
            message.extend_from_slice(&mailbox.to_be_bytes());
            message.extend_from_slice(&payload);
            onion::wrap(&onion_keys, &message).map_err(MixerError::from)
        })
        .await
    }

    fn handle_messages(
        &self,
        _data: &ServiceData,
        mut messages: Vec<Vec<u8>>,
    ) -> Result<BTreeMap<String, Vec<u8>>, MixerError> {
        messages.shuffle(&mut OsRng);
        let parsed = parse_fixed_size_messages(messages, self.size_incoming());

        let mut grouped: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();
        for (mailbox, token) in parsed {
            if mailbox == 0 {
                continue;
            }
            grouped.entry(mailbox).or_default().push(token);
        }

        Ok(grouped
            .into_iter()
            .map(|(mailbox, tokens)| {
                let mut filter = BloomFilter::new(tokens.len().max(1), DIALING_BLOOM_FPR);
                for token in &tokens {
                    filter.insert(token);
                }
                (mailbox.to_string(), filter.encode())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PublicKey, RoundNumber, ServiceName};

    fn settings_with_hops(n: usize) -> RoundSettings {
        RoundSettings {
            service: ServiceName::Dialing,
            round: RoundNumber(1),
            onion_keys: (0..n).map(|i| PublicKey(vec![i as u8; 32])).collect(),
            service_data: Vec::new(),
        }
    }

    #[tokio::test]
    async fn generate_noise_produces_wrapped_fixed_size_tokens() {
        let mixer = DialingMixer;
        let data = ServiceData { num_mailboxes: 2, laplace: super::super::LaplaceParams { mu: 2.0, b: 1.0 } };
        let settings = settings_with_hops(1);
        let onions = mixer.generate_noise(&settings, 0, &data).await.unwrap();
        for onion in &onions {
            assert!(onion.len() > mixer.size_incoming());
        }
    }

    #[tokio::test]
    async fn generate_noise_wraps_only_remaining_hops() {
        let mixer = DialingMixer;
        let data = ServiceData { num_mailboxes: 2, laplace: super::super::LaplaceParams { mu: 2.0, b: 1.0 } };
        let settings = settings_with_hops(3);

        // At position 1 of 3 hops, only hop 2 remains (1 layer), not the
        // full chain (3 layers).
        let onions = mixer.generate_noise(&settings, 1, &data).await.unwrap();
        let expected_len = mixer.size_incoming() + onion::LAYER_OVERHEAD;
        for onion in &onions {
            assert_eq!(onion.len(), expected_len);
        }

        let full_chain_onions = mixer.generate_noise(&settings, 0, &data).await.unwrap();
        let full_chain_len = mixer.size_incoming() + 3 * onion::LAYER_OVERHEAD;
        for onion in &full_chain_onions {
            assert_eq!(onion.len(), full_chain_len);
        }
    }

    #[test]
    fn handle_messages_publishes_bloom_filter_containing_every_token() {
        let mixer = DialingMixer;
        let size = mixer.size_incoming();

        let mut tok1 = vec![0u8; size];
        tok1[..4].copy_from_slice(&1u32.to_be_bytes());
        tok1[4..].copy_from_slice(&[0xAAu8; SIZE_DIALING_TOKEN]);

        let mut tok2 = vec![0u8; size];
        tok2[..4].copy_from_slice(&1u32.to_be_bytes());
        tok2[4..].copy_from_slice(&[0xBBu8; SIZE_DIALING_TOKEN]);

        let mut dummy = vec![0u8; size];
        dummy[..4].copy_from_slice(&0u32.to_be_bytes());

        let data = ServiceData { num_mailboxes: 1, laplace: super::super::LaplaceParams { mu: 1.0, b: 1.0 } };
        let grouped = mixer.handle_messages(&data, vec![tok1.clone(), dummy, tok2.clone()]).unwrap();

        assert_eq!(grouped.len(), 1);
        let filter = BloomFilter::decode(&grouped["1"]).unwrap();
        assert!(filter.test(&tok1[4..]));
        assert!(filter.test(&tok2[4..]));
    }
}
