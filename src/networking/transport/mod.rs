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

//! edTLS: TLS whose peer identity is an Ed25519 signing key rather than a
//! CA chain, and the authenticated HTTP client built on top of it.

/// Ephemeral P-256 certificate minting, vouching, and verification.
pub mod edtls;
/// Authenticated HTTP client with a pinned-key connection cache.
pub mod http;
