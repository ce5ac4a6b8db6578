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

//! Signed configuration: the guardian-attested description of a service's
//! mix chain, PKG set, and CDN endpoint, plus the client that fetches it.

/// `SignedConfig` and its guardian-threshold validation.
pub mod signed_config;
/// `ConfigClient`: fetch the current signed config over authenticated HTTP.
pub mod client;
