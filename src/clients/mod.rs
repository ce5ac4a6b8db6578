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

//! Narrow async traits for the CDN, PKG set, and mix chain. Each
//! collaborator's *internal* implementation is out of scope; these are the
//! client-side seams the coordinator calls through, with one production
//! HTTP-backed implementation per trait and in-memory fakes for tests.

/// CDN bucket provisioning and mailbox publication.
pub mod cdn;
/// PKG round requests for the AddFriend service.
pub mod pkg;
/// Mix-chain round setup and dispatch.
pub mod mix_chain;
/// Production [`crate::coordinator::ClientFactory`] wiring the three
/// traits above to HTTP-backed implementations.
pub mod factory;
