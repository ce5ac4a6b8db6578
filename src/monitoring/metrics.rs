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

//! Coordinator metrics, exposed over HTTP in Prometheus text format.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric could not be constructed or registered.
    #[error("prometheus")]
    Prom,
}

/// Coordinator metrics container, shared across the coordinator loop, the
/// mixer, and the websocket hub.
#[derive(Clone)]
pub struct Metrics {
    /// Registry backing every metric below; served by [`Metrics::gather`].
    pub registry: Registry,

    /// Total rounds started, labeled by service name.
    pub rounds_started_total: IntCounterVec,
    /// Total rounds whose settings were dispatched to clients.
    pub rounds_dispatched_total: IntCounterVec,
    /// Total rounds that failed before dispatch.
    pub rounds_failed_total: IntCounterVec,
    /// Current round number per service (last label wins; one gauge per service
    /// would be preferable but the set of services is fixed and small).
    pub current_round: IntGauge,

    /// Currently connected websocket clients.
    pub ws_clients_connected: IntGauge,
    /// Connections dropped due to a full outbound queue (backpressure).
    pub ws_connections_dropped_total: IntCounter,

    /// Onions accepted into the current round.
    pub onions_accepted_total: IntCounterVec,
    /// Onions rejected for naming a round other than the current one.
    pub onions_wrong_round_total: IntCounterVec,

    /// Cover-noise onions generated by the mixer.
    pub noise_onions_generated_total: IntCounterVec,
}

impl Metrics {
    /// Construct and register every metric. Returns `Err` only if the
    /// registry rejects a duplicate name, which would indicate a bug.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let rounds_started_total = IntCounterVec::new(
            Opts::new("alpenhorn_rounds_started_total", "Rounds started"),
            &["service"],
        )
        .map_err(|_| MetricsError::Prom)?;
        let rounds_dispatched_total = IntCounterVec::new(
            Opts::new(
                "alpenhorn_rounds_dispatched_total",
                "Rounds whose settings were dispatched to clients",
            ),
            &["service"],
        )
        .map_err(|_| MetricsError::Prom)?;
        let rounds_failed_total = IntCounterVec::new(
            Opts::new(
                "alpenhorn_rounds_failed_total",
                "Rounds that failed before dispatch",
            ),
            &["service"],
        )
        .map_err(|_| MetricsError::Prom)?;
        let current_round = IntGauge::new("alpenhorn_current_round", "Current round number")
            .map_err(|_| MetricsError::Prom)?;

        let ws_clients_connected = IntGauge::new(
            "alpenhorn_ws_clients_connected",
            "Currently connected websocket clients",
        )
        .map_err(|_| MetricsError::Prom)?;
        let ws_connections_dropped_total = IntCounter::new(
            "alpenhorn_ws_connections_dropped_total",
            "Connections dropped for backpressure",
        )
        .map_err(|_| MetricsError::Prom)?;

        let onions_accepted_total = IntCounterVec::new(
            Opts::new("alpenhorn_onions_accepted_total", "Onions accepted"),
            &["service"],
        )
        .map_err(|_| MetricsError::Prom)?;
        let onions_wrong_round_total = IntCounterVec::new(
            Opts::new(
                "alpenhorn_onions_wrong_round_total",
                "Onions rejected for naming a stale or future round",
            ),
            &["service"],
        )
        .map_err(|_| MetricsError::Prom)?;

        let noise_onions_generated_total = IntCounterVec::new(
            Opts::new(
                "alpenhorn_noise_onions_generated_total",
                "Cover-noise onions generated by the mixer",
            ),
            &["service"],
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(rounds_started_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(rounds_dispatched_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(rounds_failed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(current_round.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(ws_clients_connected.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(ws_connections_dropped_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(onions_accepted_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(onions_wrong_round_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(noise_onions_generated_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            rounds_started_total,
            rounds_dispatched_total,
            rounds_failed_total,
            current_round,
            ws_clients_connected,
            ws_connections_dropped_total,
            onions_accepted_total,
            onions_wrong_round_total,
            noise_onions_generated_total,
        })
    }

    /// Render every registered metric in Prometheus text exposition format,
    /// for the `/metrics` route.
    pub fn gather(&self) -> Result<Vec<u8>, MetricsError> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|_| MetricsError::Prom)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_registered_metric_names() {
        let m = Metrics::new().unwrap();
        m.rounds_started_total.with_label_values(&["addfriend"]).inc();
        let text = String::from_utf8(m.gather().unwrap()).unwrap();
        assert!(text.contains("alpenhorn_rounds_started_total"));
    }
}
