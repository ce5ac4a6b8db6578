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

//! Round dispatch: hand the accumulated onions to the mix chain and
//! broadcast the outcome, detached from the loop's own progress.

use std::sync::Arc;

use tracing::{error, info};

use crate::clients::mix_chain::MixChainClient;
use crate::core::types::{RoundError, RoundNumber, ServiceName};
use crate::error::ErrorPolicy;
use crate::monitoring::metrics::Metrics;
use crate::networking::ws::envelope::{ID_ERROR, ID_MAILBOX};
use crate::networking::ws::hub::Hub;

/// Run one round's dispatch to completion and broadcast its outcome.
/// Spawned as a detached task: the loop does not await this, and starts
/// the next iteration's setup immediately.
pub fn spawn_run_round<Mix, Ctx>(
    mix_chain: Arc<Mix>,
    hub: Arc<Hub<Ctx>>,
    metrics: Arc<Metrics>,
    service: ServiceName,
    round: RoundNumber,
    onions: Vec<Vec<u8>>,
) where
    Mix: MixChainClient + 'static,
    Ctx: Clone + Send + 'static,
{
    tokio::spawn(async move {
        info!(round = round.0, onions = onions.len(), "dispatching round");
        match mix_chain.run_round(service, round, onions).await {
            Ok(mailbox) => {
                metrics.rounds_dispatched_total.with_label_values(&[service.as_str()]).inc();
                hub.broadcast(ID_MAILBOX, &mailbox);
            }
            Err(e) => {
                error!(round = round.0, err = %e, policy = ?ErrorPolicy::Dispatch, "round dispatch failed");
                metrics.rounds_failed_total.with_label_values(&[service.as_str()]).inc();
                hub.broadcast(ID_ERROR, &RoundError { round, reason: "server error".to_string() });
            }
        }
    });
}
