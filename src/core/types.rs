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

//! Deterministic core types and canonical encoding helpers shared across
//! the coordinator, mixer, and config-validation modules.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Base64 `serde(with = ...)` codec for `Vec<u8>` fields that ride inside
/// the websocket envelope's JSON payload (`networking::ws::envelope`).
/// serde's default `Vec<u8>` encoding is a JSON array of decimal numbers,
/// roughly 3-4x the raw byte count; base64 keeps wire sizing close to
/// what `envelope::MAX_MESSAGE_BYTES` is budgeted against.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(D::Error::custom)
    }
}

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization")]
    Serialize,
    /// Deserialization failed.
    #[error("deserialization")]
    Deserialize,
    /// Decoded payload exceeded the caller's size limit.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (fixed-width integers, no trailing bytes).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules so every signer produces identical
/// bytes for the same logical value.
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap, rejecting both oversized wire payloads
/// and container-length bombs inside the encoding.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// A service's name. AddFriend and Dialing are the only two the core
/// coordinator drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceName {
    /// Friend-introduction protocol.
    AddFriend,
    /// Call-setup (dialing) protocol.
    Dialing,
}

impl ServiceName {
    /// Stable wire string, used in CDN bucket names and config lookups.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::AddFriend => "addfriend",
            ServiceName::Dialing => "dialing",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonically increasing per-service round counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundNumber(pub u32);

impl RoundNumber {
    /// The next round number. Saturates rather than wrapping; a service
    /// that runs out of `u32` rounds has far larger problems.
    pub fn next(self) -> Self {
        RoundNumber(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for RoundNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a `SignedConfig` (SHA-256 over its signing message).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigHash(pub [u8; 32]);

impl ConfigHash {
    /// Hex-encoded representation, used in wire messages and bucket names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(ConfigHash(out))
    }
}

impl std::fmt::Debug for ConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigHash({})", self.to_hex())
    }
}

impl std::fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Ed25519 signature bytes (expected length 64).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Ed25519 public key bytes (expected length 32), used for guardians,
/// mix servers, PKG servers, and the CDN.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    /// Interpret as a 32-byte Ed25519 public key, if the length matches.
    pub fn as_bytes32(&self) -> Option<[u8; 32]> {
        if self.0.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0);
        Some(out)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0))
    }
}

/// Per-hop onion public keys in mixer order (ordered, first hop first).
pub type OnionKeyChain = Vec<PublicKey>;

/// Settings describing one round of the mix chain, shared by every mixer
/// and signed in sequence by each server in the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundSettings {
    /// Which service this round belongs to.
    pub service: ServiceName,
    /// The round number.
    pub round: RoundNumber,
    /// Per-hop onion public keys, ordered first-hop first.
    pub onion_keys: OnionKeyChain,
    /// Opaque, service-specific data (CDN key/address + mailbox count).
    #[serde(with = "base64_bytes")]
    pub service_data: Vec<u8>,
}

/// `(RoundSettings, per-server signatures, endTime)` broadcast to clients
/// once the mix chain has set up a round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixRound {
    /// The agreed settings for this round.
    pub settings: RoundSettings,
    /// One signature per mix server, in chain order, each over
    /// `(settings, position)`.
    pub signatures: Vec<Signature>,
    /// Deadline (ms since UNIX epoch) after which clients should stop
    /// expecting a response for this round.
    pub end_time_ms: u64,
}

/// Broadcast immediately after a round is numbered and persisted, before
/// any phase that can fail: `newround:{round, configHash}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRoundAnnouncement {
    /// The round just advanced to.
    pub round: RoundNumber,
    /// The config hash pinned for this round.
    pub config_hash: ConfigHash,
}

/// `(round, PKGSettings)` snapshot broadcast to clients during the PKG
/// phase of an AddFriend round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PkgRound {
    /// The round this snapshot belongs to.
    pub round: RoundNumber,
    /// Opaque PKG settings (per-server public parameters for this round).
    pub settings: Vec<u8>,
}

/// A client-submitted onion for the current round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnionSubmission {
    /// The round the client believes is current.
    pub round: RoundNumber,
    /// The onion-wrapped payload.
    #[serde(with = "base64_bytes")]
    pub onion: Vec<u8>,
}

/// Broadcast once a round's mailbox has been published to the CDN.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxUrl {
    /// The round this mailbox belongs to.
    pub round: RoundNumber,
    /// Base URL; clients append `&key=<mailbox>`.
    pub url: String,
    /// Total number of mailboxes in this round.
    pub num_mailboxes: u32,
}

/// Error payload sent back to a client on a protocol-level refusal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundError {
    /// The round the error pertains to.
    pub round: RoundNumber,
    /// Human-readable reason.
    pub reason: String,
}
