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

//! Wire envelope `{ID, Message}` and the canonical message IDs exchanged
//! over the coordinator's websocket.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Maximum accepted envelope size, enforced by the read task.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024;

/// Client-to-server message ID: a submitted onion for the current round.
pub const ID_ONION: &str = "onion";
/// Server-to-client: a new round has been announced.
pub const ID_NEWROUND: &str = "newround";
/// Server-to-client: a PKG round snapshot.
pub const ID_PKG: &str = "pkg";
/// Server-to-client: mix-chain round settings.
pub const ID_MIX: &str = "mix";
/// Server-to-client: the round's mailbox URL.
pub const ID_MAILBOX: &str = "mailbox";
/// Server-to-client: a protocol-level refusal.
pub const ID_ERROR: &str = "error";

/// Envelope (de)serialization errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope or its payload could not be decoded as JSON.
    #[error("malformed envelope")]
    Malformed,
    /// The envelope exceeded [`MAX_MESSAGE_BYTES`].
    #[error("oversized frame")]
    Oversized,
}

/// `{ID, Message}` as carried over the wire. `message` is left undecoded
/// until the mux looks up a handler and knows the target type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    /// Message ID, used by the mux to find a handler.
    #[serde(rename = "ID")]
    pub id: String,
    /// Raw JSON payload, decoded by the handler's declared type.
    #[serde(rename = "Message")]
    pub message: Box<RawValue>,
}

impl Envelope {
    /// Build an envelope by encoding `value` as the payload of `id`.
    pub fn encode<T: Serialize>(id: &str, value: &T) -> Result<Self, EnvelopeError> {
        let raw = serde_json::value::to_raw_value(value).map_err(|_| EnvelopeError::Malformed)?;
        Ok(Self { id: id.to_string(), message: raw })
    }

    /// Serialize this envelope to a JSON frame, rejecting it if it would
    /// exceed [`MAX_MESSAGE_BYTES`] on the wire.
    pub fn to_frame_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = serde_json::to_vec(self).map_err(|_| EnvelopeError::Malformed)?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(EnvelopeError::Oversized);
        }
        Ok(bytes)
    }

    /// Parse a JSON frame into an envelope, rejecting oversized frames
    /// before touching the JSON parser.
    pub fn from_frame_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(EnvelopeError::Oversized);
        }
        serde_json::from_slice(bytes).map_err(|_| EnvelopeError::Malformed)
    }

    /// Decode the payload as `T`, given a handler has already matched `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_str(self.message.get()).map_err(|_| EnvelopeError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn encode_decode_round_trips() {
        let env = Envelope::encode(ID_ONION, &Ping { n: 7 }).unwrap();
        let bytes = env.to_frame_bytes().unwrap();
        let back = Envelope::from_frame_bytes(&bytes).unwrap();
        assert_eq!(back.id, ID_ONION);
        let decoded: Ping = back.decode().unwrap();
        assert_eq!(decoded, Ping { n: 7 });
    }

    #[test]
    fn oversized_frame_rejected() {
        let huge = "x".repeat(MAX_MESSAGE_BYTES + 1);
        let res = Envelope::from_frame_bytes(huge.as_bytes());
        assert!(matches!(res, Err(EnvelopeError::Oversized)));
    }
}
