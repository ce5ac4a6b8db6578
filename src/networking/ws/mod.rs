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

//! Typed, multiplexed websocket fabric: server-side hub/connection and the
//! symmetric client, built on `{ID, Message}` envelopes.

/// Wire envelope and canonical message IDs.
pub mod envelope;
/// Compile-time tagged-variant handler registry.
pub mod mux;
/// Server-side connection set, broadcast, and backpressure shedding.
pub mod hub;
/// Per-connection fused read/write/ping task.
pub mod conn;
/// Symmetric client: dial, ping/pong, latency measurement.
pub mod client;
