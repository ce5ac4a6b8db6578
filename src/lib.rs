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

//! Alpenhorn coordinator: the round-driven entry server that numbers
//! rounds for the AddFriend and Dialing services, fetches and pins the
//! signed configuration chain, drives each round's phases to completion,
//! and fans out per-round state to thousands of websocket-connected
//! clients.
//!
//! This crate provides:
//! - The coordinator round state machine (`coordinator`), persisted
//!   atomically to disk between rounds (`persistence`).
//! - The mixer building blocks used by mix-chain servers: fixed-size
//!   mix-message layout, Laplace cover-noise generation, onion wrapping,
//!   final-hop shuffling and per-mailbox grouping (`mixer`), plus the
//!   Bloom filter used to publish dialing tokens (`bloom`).
//! - An authenticated transport whose peer identity is an Ed25519 signing
//!   key rather than a CA chain (`networking::transport`), and a typed,
//!   backpressure-aware websocket fabric built on it
//!   (`networking::ws`).
//! - Clients for the coordinator's external collaborators — the
//!   signed-config server, PKG servers, the mix chain's entry server, and
//!   the CDN (`config::client`, `clients`).
//! - Observability via Prometheus metrics (`monitoring`) and an
//!   error type that carries an optional cause (`error`).

/// Core protocol primitives (canonical types, encoding, signing keystore).
pub mod core;
/// Round dispatch, shared coordinator state, and the round state machine.
pub mod coordinator;
/// Signed-config data model and client.
pub mod config;
/// Clients for the CDN, PKG servers, and the mix chain's entry server.
pub mod clients;
/// Compact approximate set membership, used to publish dialing tokens.
pub mod bloom;
/// Shared error type carrying an optional cause.
pub mod error;
/// Mixer building blocks: message layout, cover noise, onion wrapping,
/// shuffling, and per-mailbox grouping.
pub mod mixer;
/// Observability (Prometheus metrics).
pub mod monitoring;
/// Authenticated transport and the typed websocket fabric.
pub mod networking;
/// Crash-safe, versioned persistence of round and configuration state.
pub mod persistence;
