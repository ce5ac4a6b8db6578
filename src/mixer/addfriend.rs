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

//! AddFriend mix-message flavor: cover-noise payloads are shaped to look
//! like genuine IBE ciphertexts by replacing their leading 32 bytes with a
//! hash-to-curve image on BN254 G1, and the final hop concatenates
//! payloads per mailbox in shuffled order.

use std::collections::BTreeMap;

use ark_bn254::{Fq, G1Affine};
use ark_ff::PrimeField;
use ark_serialize::CanonicalSerialize;
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::RngCore;

use crate::core::types::RoundSettings;

use super::onion;
use super::{
    generate_noise_plan, generate_slots_parallel, parse_fixed_size_messages, Mixer, MixerError, ServiceData,
    MAILBOX_HEADER_LEN, SIZE_ENCRYPTED_INTRO,
};

/// Map 32 arbitrary bytes to a BN254 G1 point by try-and-increment: hash
/// `seed || counter` with SHA-256, interpret the digest as a field element
/// mod the curve's base field, and accept the first `x` for which a point
/// exists, so the resulting payload is indistinguishable from genuine
/// IBE ciphertext to anyone who doesn't hold the mailbox's key.
pub fn hash_to_g1_bn254(seed: &[u8; 32]) -> [u8; 32] {
    let mut counter: u8 = 0;
    loop {
        let mut input = Vec::with_capacity(33);
        input.extend_from_slice(seed);
        input.push(counter);
        let digest = ring::digest::digest(&ring::digest::SHA256, &input);
        let x = Fq::from_le_bytes_mod_order(digest.as_ref());
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, false) {
            let mut out = [0u8; 32];
            point.serialize_compressed(&mut out[..]).expect("compressed BN254 G1 point fits 32 bytes");
            return out;
        }
        counter = counter.wrapping_add(1);
    }
}

/// The AddFriend mixer: fixed-size encrypted introductions, unidirectional.
#[derive(Default)]
pub struct AddFriendMixer;

#[async_trait]
impl Mixer for AddFriendMixer {
    fn size_incoming(&self) -> usize {
        MAILBOX_HEADER_LEN + SIZE_ENCRYPTED_INTRO
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
            let mut payload = vec![0u8; SIZE_ENCRYPTED_INTRO];
            OsRng.fill_bytes(&mut payload);
            if mailbox != 0 {
                let seed: [u8; 32] = payload[..32].try_into().expect("payload is longer than 32 bytes");
                let point = hash_to_g1_bn254(&seed);
                payload[..32].copy_from_slice(&point);
            }
            let mut message = Vec::with_capacity(MAILBOX_HEADER_LEN + SIZE_ENCRYPTED_INTRO);
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

        let mut grouped: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for (mailbox, payload) in parsed {
            if mailbox == 0 {
                continue;
            }
            grouped.entry(mailbox).or_default().extend_from_slice(&payload);
        }

        Ok(grouped.into_iter().map(|(mailbox, bytes)| (mailbox.to_string(), bytes)).collect())
    }
}
