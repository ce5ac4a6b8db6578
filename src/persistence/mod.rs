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

//! Crash-safe snapshot of `(round, currentConfigHash, allConfigs)`: a
//! single version byte followed by a JSON body, written via temp-file +
//! `fsync` + rename so a crash mid-write never yields a torn read.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::signed_config::SignedConfig;
use crate::core::types::{ConfigHash, RoundNumber};

/// The only version this build writes or accepts.
pub const PERSISTED_STATE_VERSION: u8 = 0x01;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// An I/O operation failed.
    #[error("io")]
    Io,
    /// The file was shorter than the minimum version-byte-plus-body length.
    #[error("truncated persisted state")]
    Truncated,
    /// The leading version byte did not match [`PERSISTED_STATE_VERSION`].
    #[error("unsupported persisted state version {0}")]
    UnsupportedVersion(u8),
    /// The JSON body failed to parse.
    #[error("malformed persisted state body")]
    Malformed,
}

/// `(Round, CurrentConfigHash, Configs)`, the coordinator's durable state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    /// Current round number.
    pub round: RoundNumber,
    /// Hash of the config currently pinned for the active round.
    pub current_config_hash: ConfigHash,
    /// Every config ever observed, for historical lookup.
    pub configs: BTreeMap<ConfigHash, SignedConfig>,
}

impl PersistedState {
    /// Seed the very first persisted state from an operator-trusted
    /// genesis config. Does not verify its signatures — the operator is
    /// responsible for out-of-band verification of the seed — but still
    /// enforces the structural invariants `SignedConfig::validate` checks
    /// before consulting a previous config (non-empty, distinct guardian
    /// set; well-formed timestamps; non-empty mix chain), so a malformed
    /// seed can never reach client code that assumes those invariants
    /// already hold (e.g. `ClientFactory::mix_chain_client`'s
    /// first-hop lookup).
    pub fn bootstrap(starting_config: SignedConfig) -> Result<Self, PersistenceError> {
        starting_config.validate(None).map_err(|_| PersistenceError::Malformed)?;
        let hash = starting_config.hash().map_err(|_| PersistenceError::Malformed)?;
        let mut configs = BTreeMap::new();
        configs.insert(hash, starting_config);
        Ok(Self { round: RoundNumber(0), current_config_hash: hash, configs })
    }

    /// Encode as `{version=1}{JSON body}` and write atomically: write to
    /// `<path>.tmp`, `fsync`, then rename over `path`.
    pub fn persist(&self, path: &Path) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec(self).map_err(|_| PersistenceError::Malformed)?;

        let mut tmp = path.to_path_buf();
        tmp.set_extension("tmp");

        {
            let mut f = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .map_err(|_| PersistenceError::Io)?;
            f.write_all(&[PERSISTED_STATE_VERSION]).map_err(|_| PersistenceError::Io)?;
            f.write_all(&body).map_err(|_| PersistenceError::Io)?;
            f.sync_all().map_err(|_| PersistenceError::Io)?;
        }

        fs::rename(&tmp, path).map_err(|_| PersistenceError::Io)?;
        Ok(())
    }

    /// Load and validate persisted state from `path`. Refuses any version
    /// mismatch or truncated file rather than reinitializing silently.
    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        let bytes = fs::read(path).map_err(|_| PersistenceError::Io)?;
        if bytes.is_empty() {
            return Err(PersistenceError::Truncated);
        }
        let version = bytes[0];
        if version != PERSISTED_STATE_VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }
        if bytes.len() < 2 {
            return Err(PersistenceError::Truncated);
        }
        serde_json::from_slice(&bytes[1..]).map_err(|_| PersistenceError::Malformed)
    }
}

/// Default persisted-state file name under the coordinator's data directory.
pub fn default_path(data_dir: &str) -> PathBuf {
    let mut p = PathBuf::from(data_dir);
    p.push("state.json");
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::signed_config::{ServerLocator, ServicePayload};
    use crate::core::types::{PublicKey, ServiceName};
    use tempfile::tempdir;

    fn genesis() -> SignedConfig {
        SignedConfig {
            service: ServiceName::AddFriend,
            created_unix: 1,
            expires_unix: 1000,
            previous_config_hash: None,
            guardians: vec![PublicKey(vec![9; 32])],
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

    #[test]
    fn load_after_persist_round_trips() {
        let dir = tempdir().unwrap();
        let path = default_path(dir.path().to_str().unwrap());

        let state = PersistedState::bootstrap(genesis()).unwrap();
        state.persist(&path).unwrap();

        let loaded = PersistedState::load(&path).unwrap();
        assert_eq!(loaded.round, state.round);
        assert_eq!(loaded.current_config_hash, state.current_config_hash);
        assert_eq!(loaded.configs.len(), 1);
    }

    #[test]
    fn bootstrap_rejects_seed_config_with_empty_mix_chain() {
        let mut bad = genesis();
        bad.payload.mix_chain.clear();
        assert!(matches!(PersistedState::bootstrap(bad), Err(PersistenceError::Malformed)));
    }

    #[test]
    fn bootstrap_rejects_seed_config_with_duplicate_guardians() {
        let mut bad = genesis();
        bad.guardians = vec![PublicKey(vec![9; 32]), PublicKey(vec![9; 32])];
        assert!(matches!(PersistedState::bootstrap(bad), Err(PersistenceError::Malformed)));
    }

    #[test]
    fn wrong_version_byte_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, [0x02, b'{', b'}']).unwrap();
        assert!(matches!(PersistedState::load(&path), Err(PersistenceError::UnsupportedVersion(2))));
    }

    #[test]
    fn empty_file_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, []).unwrap();
        assert!(matches!(PersistedState::load(&path), Err(PersistenceError::Truncated)));
    }
}
