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

//! Generate (or load) this server's long-term Ed25519 identity key under
//! `<data-dir>/identity.key` and print its public key as hex. A thin
//! wrapper over [`alpenhorn_coordinator::core::security::keystore::Keystore::open`]
//! so keygen shares the same atomic-write, `0o600`-permission, and
//! optional passphrase-encryption path every server process uses at
//! startup, rather than a bespoke key-writing routine.

use anyhow::Result;
use alpenhorn_coordinator::core::security::keystore::Keystore;

fn main() -> Result<()> {
    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    std::fs::create_dir_all(&data_dir)?;

    let keystore = Keystore::open(&data_dir).map_err(|e| anyhow::anyhow!("keystore open failed: {e:?}"))?;
    println!("{}", hex::encode(keystore.public_key()));
    Ok(())
}
