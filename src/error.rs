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

//! Umbrella error type carrying an optional cause, mirroring the Go
//! convention of errors-as-values with a `Cause()` accessor.

use std::fmt;

/// Top-level coordinator error. `cause()` returns the immediate cause
/// only (never walks the full chain) per the error handling design.
#[derive(Debug)]
pub struct AlpenError {
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AlpenError {
    /// Construct an error with no cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Construct an error wrapping an immediate cause.
    pub fn wrap(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// The immediate cause, if any. Does not walk further up the chain.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for AlpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(c) => write!(f, "{}: {}", self.message, c),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for AlpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Error category driving the retry/fatal policy described in the
/// coordinator's error handling design.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Transient network/RPC failure: sleep and retry the iteration.
    Transient,
    /// Fatal initialization failure: the loop exits.
    Fatal,
    /// Dispatch failure: broadcast an error, continue with the next round.
    Dispatch,
    /// Protocol-level client error: refuse on the offending connection.
    Protocol,
}
