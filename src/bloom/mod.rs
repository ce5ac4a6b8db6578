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

//! Bloom filter used to publish dialing tokens to a mailbox without
//! revealing which specific tokens were deposited: compact set membership
//! at a fixed false-positive rate, with a self-describing binary codec.

use siphasher::sip128::{Hasher128, SipHasher13};
use std::hash::Hasher;
use thiserror::Error;

/// Second SipHash key shared by every hash round, per the fixed keying
/// scheme `(i, 666666)`.
const SIP_KEY1: u64 = 666_666;

/// Bloom filter codec errors.
#[derive(Debug, Error)]
pub enum BloomError {
    /// The encoded form was too short to contain a header.
    #[error("truncated bloom filter")]
    Truncated,
}

/// A Bloom filter sized by [`BloomFilter::optimal`], hashed with
/// SipHash-128 keyed `(i, 666666)` for `i` in `[0, ceil(k/4))`; each
/// 128-bit digest yields four 32-bit indices, and the first `k` indices
/// across increasing `i` are used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    num_hashes: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Optimal `(m_bits, k)` for `n` elements at false-positive rate `p`:
    /// `m = ceil(-(n+0.5)*ln(p) / (ln 2)^2 + 1)`, `k = ceil(-log2 p)`.
    pub fn optimal(n: usize, p: f64) -> (usize, u32) {
        let n = n as f64;
        let m = (-(n + 0.5) * p.ln() / std::f64::consts::LN_2.powi(2) + 1.0).ceil();
        let k = (-p.log2()).ceil();
        (m.max(8.0) as usize, k.max(1.0) as u32)
    }

    /// Construct an empty filter sized for `n` elements at false-positive
    /// rate `p`.
    pub fn new(n: usize, p: f64) -> Self {
        let (m_bits, k) = Self::optimal(n, p);
        let byte_len = m_bits.div_ceil(8);
        Self { num_hashes: k, bits: vec![0u8; byte_len] }
    }

    fn bit_len(&self) -> usize {
        self.bits.len() * 8
    }

    fn indices(&self, elem: &[u8]) -> Vec<u32> {
        let m = self.bit_len() as u64;
        let mut out = Vec::with_capacity(self.num_hashes as usize);
        let rounds = (self.num_hashes as usize).div_ceil(4);
        'outer: for i in 0..rounds {
            let mut hasher = SipHasher13::new_with_keys(i as u64, SIP_KEY1);
            hasher.write(elem);
            let h = hasher.finish128();
            for word in [h.h1 as u32, (h.h1 >> 32) as u32, h.h2 as u32, (h.h2 >> 32) as u32] {
                if out.len() == self.num_hashes as usize {
                    break 'outer;
                }
                out.push((word as u64 % m) as u32);
            }
        }
        out
    }

    /// Insert `elem` into the filter.
    pub fn insert(&mut self, elem: &[u8]) {
        for idx in self.indices(elem) {
            let idx = idx as usize;
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Test whether `elem` may have been inserted. False positives are
    /// possible; false negatives are not.
    pub fn test(&self, elem: &[u8]) -> bool {
        self.indices(elem).into_iter().all(|idx| {
            let idx = idx as usize;
            self.bits[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    /// Encode as `{num_hashes: u32 be, bitmap}`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bits.len());
        out.extend_from_slice(&self.num_hashes.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Decode from the wire form produced by [`BloomFilter::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, BloomError> {
        if bytes.len() < 4 {
            return Err(BloomError::Truncated);
        }
        let num_hashes = u32::from_be_bytes(bytes[..4].try_into().expect("checked length"));
        Ok(Self { num_hashes, bits: bytes[4..].to_vec() })
    }
}
