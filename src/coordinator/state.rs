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

//! Coordinator shared state: round, onion buffer, cached round settings,
//! and the config chain, behind one mutex — every mutation takes it,
//! there is no finer-grained locking.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::config::signed_config::SignedConfig;
use crate::core::types::{ConfigHash, MixRound, PkgRound, RoundNumber};
use crate::persistence::PersistedState;

/// A submitted onion was refused because it named a round other than
/// the current one.
#[derive(Debug, Clone, Copy)]
pub struct WrongRound {
    /// The round the coordinator is actually on.
    pub current: RoundNumber,
}

struct Inner {
    round: RoundNumber,
    onions: Vec<Vec<u8>>,
    latest_mix_round: Option<MixRound>,
    latest_pkg_round: Option<PkgRound>,
    all_configs: BTreeMap<ConfigHash, SignedConfig>,
    current_config_hash: ConfigHash,
    closed: bool,
}

/// In-memory coordinator state, mutex-guarded as a single unit: one
/// mutex, every mutation takes it.
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    /// Build the initial state from a bootstrapped or loaded persisted
    /// snapshot.
    pub fn from_persisted(persisted: &PersistedState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                round: persisted.round,
                onions: Vec::new(),
                latest_mix_round: None,
                latest_pkg_round: None,
                all_configs: persisted.configs.clone(),
                current_config_hash: persisted.current_config_hash,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("coordinator state poisoned")
    }

    /// The current round number.
    pub fn round(&self) -> RoundNumber {
        self.lock().round
    }

    /// Advance to the next round and return it, along with the config
    /// hash pinned for this iteration, so the caller can persist the new
    /// snapshot before announcing.
    pub fn advance_round(&self) -> (RoundNumber, ConfigHash) {
        let mut inner = self.lock();
        inner.round = inner.round.next();
        (inner.round, inner.current_config_hash)
    }

    /// Insert a newly validated config into the chain and pin it as
    /// current.
    pub fn adopt_config(&self, hash: ConfigHash, config: SignedConfig) {
        let mut inner = self.lock();
        inner.all_configs.insert(hash, config);
        inner.current_config_hash = hash;
    }

    /// The config hash currently pinned for the active round.
    pub fn current_config_hash(&self) -> ConfigHash {
        self.lock().current_config_hash
    }

    /// Whether a config with this hash has already been observed.
    pub fn has_config(&self, hash: &ConfigHash) -> bool {
        self.lock().all_configs.contains_key(hash)
    }

    /// Look up a previously observed config by hash, for validating a
    /// newly fetched successor against it.
    pub fn config_for_hash(&self, hash: &ConfigHash) -> Option<SignedConfig> {
        self.lock().all_configs.get(hash).cloned()
    }

    /// Snapshot persisted state as it would be written to disk right now.
    pub fn to_persisted(&self) -> PersistedState {
        let inner = self.lock();
        PersistedState {
            round: inner.round,
            current_config_hash: inner.current_config_hash,
            configs: inner.all_configs.clone(),
        }
    }

    /// Append a submitted onion if `round` matches the current round;
    /// otherwise return the current round so the caller can reply with a
    /// wrong-round error.
    pub fn submit_onion(&self, round: RoundNumber, onion: Vec<u8>) -> Result<(), WrongRound> {
        let mut inner = self.lock();
        if inner.round != round {
            return Err(WrongRound { current: inner.round });
        }
        inner.onions.push(onion);
        Ok(())
    }

    /// Snapshot the onion buffer and replace it with an empty buffer of
    /// the same *capacity* (not length) it had before the swap. Resetting
    /// with length instead would reallocate a buffer sized for zero
    /// elements every round, discarding the amortized growth from prior
    /// rounds' submissions.
    pub fn take_onions(&self) -> Vec<Vec<u8>> {
        let mut inner = self.lock();
        let cap = inner.onions.capacity();
        std::mem::replace(&mut inner.onions, Vec::with_capacity(cap))
    }

    /// Cache the mix round settings so late-joining clients can resume
    /// mid-round via `onConnect`.
    pub fn set_latest_mix_round(&self, round: MixRound) {
        self.lock().latest_mix_round = Some(round);
    }

    /// Cache the PKG round snapshot for the same reason.
    pub fn set_latest_pkg_round(&self, round: PkgRound) {
        self.lock().latest_pkg_round = Some(round);
    }

    /// The cached settings a reconnecting client should be replayed, in
    /// `onConnect` order: mix settings first, then PKG (if any).
    pub fn latest_for_on_connect(&self) -> (Option<MixRound>, Option<PkgRound>) {
        let inner = self.lock();
        (inner.latest_mix_round.clone(), inner.latest_pkg_round.clone())
    }

    /// Mark the coordinator closed. Returns `false` if it was already
    /// closed, so the caller can surface `AlreadyClosed`.
    pub fn mark_closed(&self) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        true
    }

    /// Whether `Close()` has already been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
