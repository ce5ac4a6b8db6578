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

//! Onion wrapping for the remaining mix chain: nested AEAD layers, one per
//! hop, each keyed by an ephemeral X25519 Diffie-Hellman exchange against
//! that hop's per-round public key. A hop peels exactly one layer and
//! forwards the plaintext, which is itself the next layer.
//!
//! The per-hop onion keys themselves are X25519 keys carried in
//! `RoundSettings::onion_keys` (distinct from the long-lived Ed25519
//! identity keys used for edTLS and config signing).

use rand::rngs::OsRng;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as XPublicKey};

use crate::core::types::PublicKey;

/// Length of the ephemeral X25519 public key prefixing each layer.
pub const EPHEMERAL_PK_LEN: usize = 32;
/// AES-256-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-256-GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Per-layer overhead added by [`wrap`]: ephemeral key, nonce, and tag.
pub const LAYER_OVERHEAD: usize = EPHEMERAL_PK_LEN + NONCE_LEN + TAG_LEN;

/// Onion wrap/peel errors.
#[derive(Debug, Error)]
pub enum OnionError {
    /// A hop's onion key was not a valid 32-byte X25519 public key.
    #[error("invalid hop key")]
    InvalidKey,
    /// AEAD sealing failed (RNG exhaustion or similar).
    #[error("seal failed")]
    Seal,
    /// AEAD opening failed: wrong key or tampered ciphertext.
    #[error("open failed")]
    Open,
    /// The layer was shorter than the minimum framing length.
    #[error("truncated onion layer")]
    Truncated,
}

fn derive_layer_key(shared_secret: &[u8; 32]) -> Result<LessSafeKey, OnionError> {
    // Domain-separate the raw X25519 shared secret before using it as an
    // AEAD key, the same SHA-256-as-KDF pattern the keystore uses for
    // edTLS vouch messages rather than pulling in a separate HKDF crate.
    let digest = ring::digest::digest(&ring::digest::SHA256, shared_secret);
    let unbound = UnboundKey::new(&aead::AES_256_GCM, digest.as_ref()).map_err(|_| OnionError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

fn seal_layer(hop_key: &[u8; 32], inner: &[u8]) -> Result<Vec<u8>, OnionError> {
    let hop_pk = XPublicKey::from(*hop_key);
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pk = XPublicKey::from(&eph_secret);
    let shared = eph_secret.diffie_hellman(&hop_pk);

    let key = derive_layer_key(shared.as_bytes())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new().fill(&mut nonce_bytes).map_err(|_| OnionError::Seal)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = inner.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out).map_err(|_| OnionError::Seal)?;

    let mut out = Vec::with_capacity(EPHEMERAL_PK_LEN + NONCE_LEN + in_out.len());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Wrap `payload` for the remaining chain in `hop_keys` (first-hop
/// first): the innermost AEAD layer is sealed to the last hop, the
/// outermost to the first, so each hop along the way peels exactly one
/// layer before forwarding what remains. An empty `hop_keys` (the last
/// hop generating its own cover traffic) returns `payload` unchanged.
pub fn wrap(hop_keys: &[PublicKey], payload: &[u8]) -> Result<Vec<u8>, OnionError> {
    let mut layer = payload.to_vec();
    for hop in hop_keys.iter().rev() {
        let key_bytes = hop.as_bytes32().ok_or(OnionError::InvalidKey)?;
        layer = seal_layer(&key_bytes, &layer)?;
    }
    Ok(layer)
}

/// Peel exactly one onion layer with `hop_secret`. The production mix
/// chain's peeling pipeline is out of scope for this crate; this exists
/// so [`wrap`] can be exercised end-to-end in tests.
#[cfg(test)]
pub(crate) fn peel(hop_secret: &x25519_dalek::StaticSecret, layer: &[u8]) -> Result<Vec<u8>, OnionError> {
    if layer.len() < LAYER_OVERHEAD {
        return Err(OnionError::Truncated);
    }
    let eph_pk_bytes: [u8; EPHEMERAL_PK_LEN] =
        layer[..EPHEMERAL_PK_LEN].try_into().expect("checked length");
    let nonce_bytes: [u8; NONCE_LEN] =
        layer[EPHEMERAL_PK_LEN..EPHEMERAL_PK_LEN + NONCE_LEN].try_into().expect("checked length");
    let ciphertext = &layer[EPHEMERAL_PK_LEN + NONCE_LEN..];

    let eph_pk = XPublicKey::from(eph_pk_bytes);
    let shared = hop_secret.diffie_hellman(&eph_pk);
    let key = derive_layer_key(shared.as_bytes())?;

    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let mut in_out = ciphertext.to_vec();
    let plain = key.open_in_place(nonce, Aad::empty(), &mut in_out).map_err(|_| OnionError::Open)?;
    Ok(plain.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn keypair() -> (StaticSecret, PublicKey) {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = XPublicKey::from(&sk);
        (sk, PublicKey(pk.as_bytes().to_vec()))
    }

    #[test]
    fn wrap_then_peel_through_chain_recovers_payload() {
        let (sk1, pk1) = keypair();
        let (sk2, pk2) = keypair();
        let (sk3, pk3) = keypair();
        let chain = vec![pk1, pk2, pk3];

        let payload = b"addfriend introduction bytes".to_vec();
        let onion = wrap(&chain, &payload).unwrap();

        let layer1 = peel(&sk1, &onion).unwrap();
        let layer2 = peel(&sk2, &layer1).unwrap();
        let layer3 = peel(&sk3, &layer2).unwrap();
        assert_eq!(layer3, payload);
    }

    #[test]
    fn empty_chain_is_identity() {
        let payload = b"dummy".to_vec();
        let onion = wrap(&[], &payload).unwrap();
        assert_eq!(onion, payload);
    }

    #[test]
    fn wrong_hop_secret_fails_to_open() {
        let (_sk1, pk1) = keypair();
        let (sk_wrong, _pk_wrong) = keypair();
        let onion = wrap(&[pk1], b"secret").unwrap();
        assert!(peel(&sk_wrong, &onion).is_err());
    }
}
