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

use proptest::prelude::*;
use tempfile::tempdir;

use alpenhorn_coordinator::config::signed_config::{ServerLocator, ServicePayload, SignedConfig};
use alpenhorn_coordinator::core::types::{PublicKey, RoundNumber, ServiceName};
use alpenhorn_coordinator::persistence::{default_path, PersistedState};

fn genesis(guardian_byte: u8) -> SignedConfig {
    SignedConfig {
        service: ServiceName::AddFriend,
        created_unix: 1,
        expires_unix: 1000,
        previous_config_hash: None,
        guardians: vec![PublicKey(vec![guardian_byte; 32])],
        threshold: 1,
        payload: ServicePayload {
            mix_chain: vec![ServerLocator { key: PublicKey(vec![1; 32]), address: "https://mix1.example".into() }],
            pkg_servers: Some(vec![ServerLocator { key: PublicKey(vec![2; 32]), address: "https://pkg1.example".into() }]),
            cdn_endpoint: "https://cdn.example".into(),
            cdn_key: PublicKey(vec![3; 32]),
        },
        signatures: Default::default(),
    }
}

proptest! {
    // Persist-then-load is idempotent: the round-trip reproduces every
    // field, and persisting the loaded copy again produces byte-identical
    // output, regardless of how many configs are in the chain or what the
    // current round counter is set to.
    #[test]
    fn persist_then_load_round_trips(
        guardian_byte in any::<u8>(),
        round_value in 0u32..1_000_000,
        repeat_persists in 1usize..4,
    ) {
        let dir = tempdir().unwrap();
        let path = default_path(dir.path().to_str().unwrap());

        let mut state = PersistedState::bootstrap(genesis(guardian_byte)).unwrap();
        state.round = RoundNumber(round_value);

        let mut first_bytes = None;
        for _ in 0..repeat_persists {
            state.persist(&path).unwrap();
            let bytes = std::fs::read(&path).unwrap();
            if let Some(prev) = &first_bytes {
                prop_assert_eq!(&bytes, prev);
            }
            first_bytes = Some(bytes);

            let loaded = PersistedState::load(&path).unwrap();
            prop_assert_eq!(loaded.round, state.round);
            prop_assert_eq!(loaded.current_config_hash, state.current_config_hash);
            prop_assert_eq!(loaded.configs.len(), state.configs.len());
            state = loaded;
        }
    }
}
