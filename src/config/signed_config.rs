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

//! `SignedConfig`: the immutable, guardian-attested configuration for one
//! service's mix chain, PKG set, and CDN endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::security::keystore::verify_sig_bytes;
use crate::core::types::{encode_canonical, CodecError, ConfigHash, PublicKey, ServiceName, Signature};

/// Config validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `expires` did not lie after `created`.
    #[error("expires must be after created")]
    BadTimestamps,
    /// The guardian list was empty or contained a duplicate key.
    #[error("guardian set must be non-empty and distinct")]
    BadGuardianSet,
    /// The mix chain was empty; every round needs at least one hop.
    #[error("mix chain must be non-empty")]
    EmptyMixChain,
    /// `previous_config_hash` did not match the hash of the config it
    /// claims to replace.
    #[error("previous-config hash mismatch")]
    PreviousHashMismatch,
    /// A signature was produced by a key absent from the previous config's
    /// guardian set.
    #[error("signer not a guardian of the previous config")]
    UnknownSigner,
    /// Fewer valid signatures were present than the previous config's
    /// threshold requires.
    #[error("guardian signature threshold not met")]
    ThresholdNotMet,
    /// Canonical encoding of the signing message failed.
    #[error("encode: {0}")]
    Codec(#[from] CodecError),
}

/// A server's signing key paired with the network address the
/// coordinator dials to reach it. `SignedConfig` only ever describes
/// *who* a collaborator is and *where* to reach it; the collaborator's
/// own internal behavior is out of scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLocator {
    /// Ed25519 signing key, pinned for edTLS vouch verification.
    pub key: PublicKey,
    /// `scheme://host:port` the coordinator dials.
    pub address: String,
}

/// Per-service payload carried by a [`SignedConfig`]: the mix chain (in
/// hop order), the optional PKG set (AddFriend only), and the CDN
/// endpoint the round's mailbox will be published to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePayload {
    /// Mix servers, first hop first.
    pub mix_chain: Vec<ServerLocator>,
    /// PKG servers; `None` for Dialing.
    pub pkg_servers: Option<Vec<ServerLocator>>,
    /// CDN base URL this service's rounds publish to.
    pub cdn_endpoint: String,
    /// CDN signing key, pinned for edTLS when talking to it.
    pub cdn_key: PublicKey,
}

/// Fields that are actually signed; excludes `signatures` itself, so
/// guardians and verifiers compute identical bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SigningPayload {
    service: ServiceName,
    created_unix: u64,
    expires_unix: u64,
    previous_config_hash: Option<ConfigHash>,
    guardians: Vec<PublicKey>,
    threshold: u32,
    payload: ServicePayload,
}

/// An immutable, guardian-attested configuration. Authorizes a successor
/// config by requiring `threshold` valid signatures, by guardians in
/// *this* config's guardian set, over the successor's signing message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedConfig {
    /// Which service this config describes.
    pub service: ServiceName,
    /// Issuance time, seconds since the Unix epoch.
    pub created_unix: u64,
    /// Expiry time, seconds since the Unix epoch. Must exceed `created_unix`.
    pub expires_unix: u64,
    /// Hash of the config this one replaces; `None` only at genesis.
    pub previous_config_hash: Option<ConfigHash>,
    /// Ordered, distinct guardian signing keys authorized to sign the
    /// *next* config in the chain.
    pub guardians: Vec<PublicKey>,
    /// Minimum number of valid guardian signatures a successor config
    /// must carry.
    pub threshold: u32,
    /// Mix chain / PKG set / CDN payload for this service.
    pub payload: ServicePayload,
    /// Guardian signatures over this config's signing message, collected
    /// from the *previous* config's guardians.
    pub signatures: BTreeMap<PublicKey, Signature>,
}

impl SignedConfig {
    fn signing_payload(&self) -> SigningPayload {
        SigningPayload {
            service: self.service,
            created_unix: self.created_unix,
            expires_unix: self.expires_unix,
            previous_config_hash: self.previous_config_hash,
            guardians: self.guardians.clone(),
            threshold: self.threshold,
            payload: self.payload.clone(),
        }
    }

    /// Canonical bytes guardians sign and verifiers re-derive; excludes
    /// `signatures`, stable field order via [`encode_canonical`].
    pub fn signing_message(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(encode_canonical(&self.signing_payload())?)
    }

    /// Content hash of this config (SHA-256 over its signing message).
    pub fn hash(&self) -> Result<ConfigHash, ConfigError> {
        let msg = self.signing_message()?;
        let digest = ring::digest::digest(&ring::digest::SHA256, &msg);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Ok(ConfigHash(out))
    }

    /// Validate structural invariants and, for non-genesis configs,
    /// guardian-threshold authorization from `previous`.
    ///
    /// A genesis config (`previous_config_hash: None`) skips signature
    /// verification: its attestation is out-of-band, per the operator's
    /// `Bootstrap` seeding step.
    pub fn validate(&self, previous: Option<&SignedConfig>) -> Result<(), ConfigError> {
        if self.expires_unix <= self.created_unix {
            return Err(ConfigError::BadTimestamps);
        }
        if self.guardians.is_empty() {
            return Err(ConfigError::BadGuardianSet);
        }
        let mut sorted = self.guardians.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.guardians.len() {
            return Err(ConfigError::BadGuardianSet);
        }
        if self.payload.mix_chain.is_empty() {
            return Err(ConfigError::EmptyMixChain);
        }

        let Some(previous) = previous else {
            return Ok(());
        };

        let expected_hash = previous.hash()?;
        if self.previous_config_hash != Some(expected_hash) {
            return Err(ConfigError::PreviousHashMismatch);
        }

        let msg = self.signing_message()?;
        let mut valid = 0u32;
        for (signer, sig) in &self.signatures {
            if !previous.guardians.contains(signer) {
                return Err(ConfigError::UnknownSigner);
            }
            if verify_sig_bytes(signer, &msg, sig).is_ok() {
                valid += 1;
            }
        }

        if valid < previous.threshold {
            return Err(ConfigError::ThresholdNotMet);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::keystore::{FileEd25519Backend, Keystore};
    use tempfile::tempdir;

    fn guardian() -> (Keystore<FileEd25519Backend>, PublicKey) {
        let dir = tempdir().unwrap();
        let ks = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        let pk = PublicKey(ks.public_key().to_vec());
        (ks, pk)
    }

    fn payload() -> ServicePayload {
        ServicePayload {
            mix_chain: vec![ServerLocator { key: PublicKey(vec![1; 32]), address: "https://mix1.example".into() }],
            pkg_servers: None,
            cdn_endpoint: "https://cdn.example".into(),
            cdn_key: PublicKey(vec![2; 32]),
        }
    }

    fn genesis(guardians: Vec<PublicKey>, threshold: u32) -> SignedConfig {
        SignedConfig {
            service: ServiceName::Dialing,
            created_unix: 1000,
            expires_unix: 2000,
            previous_config_hash: None,
            guardians,
            threshold,
            payload: payload(),
            signatures: BTreeMap::new(),
        }
    }

    #[test]
    fn genesis_skips_signature_checks() {
        let (_ks, pk) = guardian();
        let g0 = genesis(vec![pk], 1);
        assert!(g0.validate(None).is_ok());
    }

    #[test]
    fn empty_mix_chain_rejected() {
        let (_ks, pk) = guardian();
        let mut g0 = genesis(vec![pk], 1);
        g0.payload.mix_chain.clear();
        assert!(matches!(g0.validate(None), Err(ConfigError::EmptyMixChain)));
    }

    #[test]
    fn successor_below_threshold_rejected() {
        let (ks1, pk1) = guardian();
        let (_ks2, pk2) = guardian();
        let (_ks3, pk3) = guardian();
        let g0 = genesis(vec![pk1.clone(), pk2.clone(), pk3.clone()], 2);

        let mut g1 = SignedConfig {
            service: ServiceName::Dialing,
            created_unix: 2000,
            expires_unix: 3000,
            previous_config_hash: Some(g0.hash().unwrap()),
            guardians: vec![pk1.clone(), pk2.clone(), pk3.clone()],
            threshold: 2,
            payload: payload(),
            signatures: BTreeMap::new(),
        };
        let msg = g1.signing_message().unwrap();
        let sig1 = ks1.sign(&msg).unwrap();
        g1.signatures.insert(pk1, sig1);

        assert!(matches!(g1.validate(Some(&g0)), Err(ConfigError::ThresholdNotMet)));
    }

    #[test]
    fn successor_at_threshold_accepted() {
        let (ks1, pk1) = guardian();
        let (_ks2, pk2) = guardian();
        let (ks3, pk3) = guardian();
        let g0 = genesis(vec![pk1.clone(), pk2.clone(), pk3.clone()], 2);

        let mut g1 = SignedConfig {
            service: ServiceName::Dialing,
            created_unix: 2000,
            expires_unix: 3000,
            previous_config_hash: Some(g0.hash().unwrap()),
            guardians: vec![pk1.clone(), pk2.clone(), pk3.clone()],
            threshold: 2,
            payload: payload(),
            signatures: BTreeMap::new(),
        };
        let msg = g1.signing_message().unwrap();
        g1.signatures.insert(pk1.clone(), ks1.sign(&msg).unwrap());
        g1.signatures.insert(pk3.clone(), ks3.sign(&msg).unwrap());

        assert!(g1.validate(Some(&g0)).is_ok());
    }
}
