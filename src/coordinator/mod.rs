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

//! The coordinator round state machine: fetches and pins the signed
//! config chain, numbers and persists each round, drives the PKG and
//! mix-chain setup phases, and dispatches the round once clients have
//! had a chance to submit onions.

pub mod dispatch;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clients::cdn::CdnClient;
use crate::clients::mix_chain::MixChainClient;
use crate::clients::pkg::PkgClient;
use crate::config::client::ConfigClient;
use crate::config::signed_config::SignedConfig;
use crate::core::types::{
    encode_canonical, MixRound, NewRoundAnnouncement, OnionSubmission, PkgRound, RoundError, RoundNumber, ServiceName,
};
use crate::error::{AlpenError, ErrorPolicy};
use crate::monitoring::metrics::Metrics;
use crate::networking::ws::conn::{ConnHandle, ConnId};
use crate::networking::ws::envelope::{Envelope, ID_ERROR, ID_MIX, ID_NEWROUND, ID_ONION, ID_PKG};
use crate::networking::ws::hub::Hub;
use crate::networking::ws::mux::Mux;
use crate::persistence::{default_path, PersistedState};

use state::SharedState;

const RETRY_SLEEP: Duration = Duration::from_secs(10);
const ANNOUNCE_SETTLE: Duration = Duration::from_millis(500);

/// Per-round timing and sizing knobs a coordinator is configured with.
/// Everything here is a deployment parameter, not a protocol constant —
/// the end-to-end test harness overrides every wait to a few
/// milliseconds so tests run fast.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorConfig {
    /// Number of mailboxes this service's rounds are sized for, packed
    /// into the `service_data` handed to the mix chain's first hop.
    pub num_mailboxes: u32,
    /// How long clients are given to settle after `newround` before the
    /// PKG/mix-chain phases start.
    pub announce_settle: Duration,
    /// How long to wait after broadcasting `pkg:` before moving on.
    pub pkg_wait: Duration,
    /// How long to wait after broadcasting `mix:` before dispatching.
    pub mix_wait: Duration,
    /// How long to wait after dispatch before starting the next round.
    pub round_wait: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            num_mailboxes: 1 << 16,
            announce_settle: ANNOUNCE_SETTLE,
            pkg_wait: Duration::from_secs(2),
            mix_wait: Duration::from_secs(2),
            round_wait: Duration::from_secs(2),
        }
    }
}

/// Errors `Coordinator::close` and construction can surface.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// `close()` was called on an already-closed coordinator.
    #[error("coordinator already closed")]
    AlreadyClosed,
    /// The persisted state on disk could not be loaded.
    #[error("persistence: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
}

/// Builds the per-round client wrappers (config-pinned PKG/CDN/mix-chain
/// callers) fresh from the round's fetched [`SignedConfig`], while still
/// sharing one connection-cached `AuthenticatedHttpClient` underneath.
/// This is the seam a production coordinator uses
/// `networking::transport::http::AuthenticatedHttpClient` behind, and a
/// test harness substitutes with in-memory fakes, matching the trait
/// seam already used for [`crate::core::security::keystore::SignerBackend`].
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Concrete PKG client type this factory builds.
    type Pkg: PkgClient + 'static;
    /// Concrete CDN client type this factory builds.
    type Cdn: CdnClient + 'static;
    /// Concrete mix-chain client type this factory builds.
    type MixChain: MixChainClient + 'static;

    /// Build the PKG clients named in `payload.pkg_servers`, one per
    /// server, in listed order.
    fn pkg_clients(&self, config: &SignedConfig) -> Vec<Arc<Self::Pkg>>;

    /// Build the CDN client pinned to `payload.cdn_key`/`cdn_endpoint`.
    fn cdn_client(&self, config: &SignedConfig) -> Arc<Self::Cdn>;

    /// Build the mix-chain entry-server client pinned to the first hop.
    fn mix_chain_client(&self, config: &SignedConfig) -> Arc<Self::MixChain>;
}

/// Per-connection context the `onion` handler receives: the submitting
/// connection's handle (for targeted error replies) plus the shared
/// coordinator state.
#[derive(Clone)]
pub struct ConnCtx {
    /// The connection this message arrived on.
    pub handle: Arc<ConnHandle>,
    /// Shared coordinator state, for onion submission and replay.
    pub state: Arc<SharedState>,
    /// Metrics, for onion accept/reject counters.
    pub metrics: Arc<Metrics>,
    /// Hub, for sending a targeted error reply.
    pub hub: Arc<Hub<ConnCtx>>,
    /// Which service this coordinator instance serves.
    pub service: ServiceName,
}

/// Build the mux with every message handler this coordinator registers.
/// Currently just `onion`: a submission for the live round.
pub fn build_mux() -> Mux<ConnCtx> {
    let mut mux = Mux::new();
    mux.register::<OnionSubmission, _, _>(ID_ONION, |ctx: ConnCtx, msg| async move {
        match ctx.state.submit_onion(msg.round, msg.onion) {
            Ok(()) => {
                ctx.metrics.onions_accepted_total.with_label_values(&[ctx.service.as_str()]).inc();
            }
            Err(wrong) => {
                ctx.metrics.onions_wrong_round_total.with_label_values(&[ctx.service.as_str()]).inc();
                let reason = format!("wrong round (want {})", wrong.current);
                let env = Envelope::encode(ID_ERROR, &RoundError { round: wrong.current, reason });
                if let Ok(env) = env {
                    ctx.hub.send_to(ctx.handle.id(), &env);
                }
            }
        }
    });
    mux
}

/// Replay the cached round state to a newly connected client, in order:
/// mix settings first, then PKG (if any), matching the order a client
/// would have received them live.
pub fn replay_on_connect(hub: &Hub<ConnCtx>, conn: ConnId, state: &SharedState) {
    let (mix, pkg) = state.latest_for_on_connect();
    if let Some(mix) = mix {
        if let Ok(env) = Envelope::encode(ID_MIX, &mix) {
            hub.send_to(conn, &env);
        }
    }
    if let Some(pkg) = pkg {
        if let Ok(env) = Envelope::encode(ID_PKG, &pkg) {
            hub.send_to(conn, &env);
        }
    }
}

/// The coordinator: owns the round loop task, the websocket hub, and
/// shared round state. One instance serves exactly one service.
pub struct Coordinator<F: ClientFactory> {
    service: ServiceName,
    data_dir: String,
    config: CoordinatorConfig,
    state: Arc<SharedState>,
    hub: Arc<Hub<ConnCtx>>,
    metrics: Arc<Metrics>,
    config_client: Arc<dyn ConfigClient>,
    factory: Arc<F>,
    cancel: CancellationToken,
    /// Set once the loop completes its first round, for `/healthz`.
    ready_flag: AtomicBool,
}

impl<F: ClientFactory> Coordinator<F> {
    /// Load or bootstrap persisted state under `data_dir` and build a
    /// coordinator ready to `run()`. Does not itself start the loop.
    pub fn new(
        service: ServiceName,
        data_dir: String,
        config: CoordinatorConfig,
        config_client: Arc<dyn ConfigClient>,
        factory: Arc<F>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let path = default_path(&data_dir);
        let persisted = PersistedState::load(&path)?;
        let state = Arc::new(SharedState::from_persisted(&persisted));
        let mux = Arc::new(build_mux());
        let hub = Hub::new(mux, metrics.clone());

        Ok(Arc::new(Self {
            service,
            data_dir,
            config,
            state,
            hub,
            metrics,
            config_client,
            factory,
            cancel: CancellationToken::new(),
            ready_flag: AtomicBool::new(false),
        }))
    }

    /// The websocket hub, for wiring into the axum `/ws` route.
    pub fn hub(&self) -> Arc<Hub<ConnCtx>> {
        self.hub.clone()
    }

    /// Shared state, for the `/ws` handler's context construction.
    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    /// Metrics, for the `/metrics` route.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The service this coordinator drives rounds for.
    pub fn service(&self) -> ServiceName {
        self.service
    }

    /// Whether the loop has completed at least one round, for `/healthz`.
    pub fn is_ready(&self) -> bool {
        self.ready_flag.load(Ordering::Acquire)
    }

    /// Signal the loop to stop at its next interruptible wait. Calling
    /// this a second time returns `AlreadyClosed` rather than silently
    /// succeeding, matching the base fabric's re-close detection.
    pub fn close(&self) -> Result<(), CoordinatorError> {
        if !self.state.mark_closed() {
            return Err(CoordinatorError::AlreadyClosed);
        }
        self.cancel.cancel();
        Ok(())
    }

    /// Sleep for `dur`, or return early if `close()` is called first.
    /// Every interruptible wait in the loop goes through this so a close
    /// request is never held up behind a multi-second sleep.
    async fn sleep_or_cancelled(&self, dur: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Run the round loop until `close()` is called. Spawned as its own
    /// task by callers; this function returns once the loop exits.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                info!(service = %self.service, "coordinator loop exiting");
                return;
            }

            if let Err(retry) = self.run_iteration().await {
                if retry {
                    self.sleep_or_cancelled(RETRY_SLEEP).await;
                    continue;
                }
                error!(service = %self.service, "coordinator loop exiting after fatal error");
                return;
            }

            self.ready_flag.store(true, Ordering::Release);
        }
    }

    /// Run one iteration of the 8-phase round state machine. `Ok(())` on
    /// a completed iteration; `Err(true)` for a transient failure the
    /// caller should sleep-and-retry; `Err(false)` for a fatal failure
    /// the caller should stop on.
    async fn run_iteration(&self) -> Result<(), bool> {
        // Phase 1: fetch the current signed config.
        let config = match self.config_client.current_config(self.service).await {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, policy = ?ErrorPolicy::Transient, "config fetch failed; retrying");
                return Err(true);
            }
        };

        let hash = match config.hash() {
            Ok(h) => h,
            Err(e) => {
                warn!(err = %e, policy = ?ErrorPolicy::Transient, "config hash failed; retrying");
                return Err(true);
            }
        };

        if !self.state.has_config(&hash) {
            let previous = config
                .previous_config_hash
                .and_then(|prev_hash| self.state.config_for_hash(&prev_hash));
            if let Err(e) = config.validate(previous.as_ref()) {
                warn!(err = %e, policy = ?ErrorPolicy::Transient, "fetched config failed validation; retrying");
                return Err(true);
            }
            self.state.adopt_config(hash, config.clone());
        }

        // Phase 2/3: advance and persist the round before announcing it.
        let (round, config_hash) = self.state.advance_round();
        self.metrics.current_round.set(round.0 as i64);
        self.metrics.rounds_started_total.with_label_values(&[self.service.as_str()]).inc();

        if let Err(e) = self.state.to_persisted().persist(&default_path(&self.data_dir)) {
            let err = AlpenError::wrap("persisting round state", e);
            error!(err = %err, policy = ?ErrorPolicy::Fatal, "stopping");
            return Err(false);
        }

        // Phase 4: announce, then settle briefly.
        self.hub.broadcast(ID_NEWROUND, &NewRoundAnnouncement { round, config_hash });
        self.sleep_or_cancelled(self.config.announce_settle).await;

        // Phase 5: PKG phase (AddFriend only).
        let pkg_settings = if self.service == ServiceName::AddFriend {
            match self.run_pkg_phase(&config, round).await {
                Ok(settings) => Some(settings),
                Err(()) => return Err(true),
            }
        } else {
            None
        };
        if let Some(ref pkg_round) = pkg_settings {
            self.state.set_latest_pkg_round(pkg_round.clone());
            self.hub.broadcast(ID_PKG, pkg_round);
            self.sleep_or_cancelled(self.config.pkg_wait).await;
        }

        // Phase 6: CDN bucket preparation, keyed by the last mix hop.
        let cdn = self.factory.cdn_client(&config);
        let uploader_key = config
            .payload
            .mix_chain
            .last()
            .map(|l| l.key.clone())
            .unwrap_or_else(|| config.payload.cdn_key.clone());
        if let Err(e) = cdn.new_bucket(self.service, round, &uploader_key).await {
            let err = AlpenError::wrap("cdn bucket preparation", e);
            error!(err = %err, policy = ?ErrorPolicy::Fatal, "stopping");
            return Err(false);
        }

        // Phase 7: mix-chain round setup.
        let service_data = match build_service_data(&config, self.config.num_mailboxes) {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e, policy = ?ErrorPolicy::Transient, "service data encoding failed; retrying");
                return Err(true);
            }
        };
        let mix_chain = self.factory.mix_chain_client(&config);
        let mix_round: MixRound = match mix_chain.new_round(self.service, round, service_data).await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, policy = ?ErrorPolicy::Transient, "mix chain setup failed; retrying");
                return Err(true);
            }
        };
        self.state.set_latest_mix_round(mix_round.clone());
        self.hub.broadcast(ID_MIX, &mix_round);
        self.sleep_or_cancelled(self.config.mix_wait).await;

        // Phase 8: dispatch, detached from this loop's progress.
        let onions = self.state.take_onions();
        dispatch::spawn_run_round(mix_chain, self.hub.clone(), self.metrics.clone(), self.service, round, onions);
        self.sleep_or_cancelled(self.config.round_wait).await;

        Ok(())
    }

    async fn run_pkg_phase(&self, config: &SignedConfig, round: RoundNumber) -> Result<PkgRound, ()> {
        let clients = self.factory.pkg_clients(config);
        if clients.is_empty() {
            return Ok(PkgRound { round, settings: Vec::new() });
        }

        let results = futures::future::join_all(clients.iter().map(|c| c.new_round(round))).await;
        let mut combined = Vec::new();
        for res in results {
            match res {
                Ok(r) => combined.extend(r.settings),
                Err(e) => {
                    warn!(err = %e, policy = ?ErrorPolicy::Transient, "pkg phase failed; retrying");
                    return Err(());
                }
            }
        }
        Ok(PkgRound { round, settings: combined })
    }
}

const SERVICE_DATA_VERSION: u8 = 1;

/// Pack `{CDNKey, CDNAddress, NumMailboxes}` with a leading version byte,
/// the opaque payload `RoundSettings.service_data` carries to the mix
/// chain's first hop (see [`crate::mixer::ServiceData`] for the typed
/// form a mix server decodes this into together with its own
/// locally-configured Laplace noise parameters).
fn build_service_data(config: &SignedConfig, num_mailboxes: u32) -> Result<Vec<u8>, crate::core::types::CodecError> {
    #[derive(serde::Serialize)]
    struct CdnCoordinates<'a> {
        cdn_key: &'a crate::core::types::PublicKey,
        cdn_address: &'a str,
        num_mailboxes: u32,
    }
    let body = encode_canonical(&CdnCoordinates {
        cdn_key: &config.payload.cdn_key,
        cdn_address: &config.payload.cdn_endpoint,
        num_mailboxes,
    })?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(SERVICE_DATA_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::cdn::fake::FakeCdnClient;
    use crate::clients::mix_chain::fake::FakeMixChainClient;
    use crate::clients::pkg::fake::FakePkgClient;
    use crate::config::signed_config::{ServerLocator, ServicePayload};
    use crate::core::types::PublicKey;
    use std::collections::BTreeMap;

    fn genesis_config(service: ServiceName) -> SignedConfig {
        SignedConfig {
            service,
            created_unix: 1,
            expires_unix: u64::MAX,
            previous_config_hash: None,
            guardians: vec![PublicKey(vec![9; 32])],
            threshold: 1,
            payload: ServicePayload {
                mix_chain: vec![ServerLocator { key: PublicKey(vec![1; 32]), address: "https://mix1.example".into() }],
                pkg_servers: if service == ServiceName::AddFriend {
                    Some(vec![ServerLocator { key: PublicKey(vec![4; 32]), address: "https://pkg1.example".into() }])
                } else {
                    None
                },
                cdn_endpoint: "https://cdn.example".into(),
                cdn_key: PublicKey(vec![3; 32]),
            },
            signatures: BTreeMap::new(),
        }
    }

    struct FakeConfigClient(SignedConfig);

    #[async_trait]
    impl ConfigClient for FakeConfigClient {
        async fn current_config(&self, _service: ServiceName) -> Result<SignedConfig, crate::config::client::ConfigClientError> {
            Ok(self.0.clone())
        }
    }

    struct FakeFactory {
        pkg: Arc<FakePkgClient>,
        cdn: Arc<FakeCdnClient>,
        mix_chain: Arc<FakeMixChainClient>,
    }

    #[async_trait]
    impl ClientFactory for FakeFactory {
        type Pkg = FakePkgClient;
        type Cdn = FakeCdnClient;
        type MixChain = FakeMixChainClient;

        fn pkg_clients(&self, config: &SignedConfig) -> Vec<Arc<Self::Pkg>> {
            match &config.payload.pkg_servers {
                Some(servers) => servers.iter().map(|_| self.pkg.clone()).collect(),
                None => Vec::new(),
            }
        }

        fn cdn_client(&self, _config: &SignedConfig) -> Arc<Self::Cdn> {
            self.cdn.clone()
        }

        fn mix_chain_client(&self, _config: &SignedConfig) -> Arc<Self::MixChain> {
            self.mix_chain.clone()
        }
    }

    fn test_config() -> CoordinatorConfig {
        let wait = Duration::from_millis(5);
        CoordinatorConfig { num_mailboxes: 4, announce_settle: wait, pkg_wait: wait, mix_wait: wait, round_wait: wait }
    }

    fn build_coordinator(service: ServiceName, dir: &std::path::Path) -> Arc<Coordinator<FakeFactory>> {
        let config = genesis_config(service);
        let persisted = PersistedState::bootstrap(config.clone()).unwrap();
        persisted.persist(&default_path(dir.to_str().unwrap())).unwrap();

        let factory = Arc::new(FakeFactory {
            pkg: Arc::new(FakePkgClient),
            cdn: Arc::new(FakeCdnClient::default()),
            mix_chain: Arc::new(FakeMixChainClient::default()),
        });
        let metrics = Arc::new(Metrics::new().unwrap());
        let config_client: Arc<dyn ConfigClient> = Arc::new(FakeConfigClient(config));

        Coordinator::new(service, dir.to_str().unwrap().to_string(), test_config(), config_client, factory, metrics).unwrap()
    }

    #[tokio::test]
    async fn one_iteration_advances_round_and_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(ServiceName::Dialing, dir.path());

        coordinator.run_iteration().await.unwrap();
        assert_eq!(coordinator.state.round(), RoundNumber(1));

        // onions taken at dispatch are empty on a fresh round, but
        // submit_onion should now accept round 1.
        assert!(coordinator.state.submit_onion(RoundNumber(1), vec![1, 2, 3]).is_ok());
    }

    #[tokio::test]
    async fn addfriend_round_runs_pkg_phase() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(ServiceName::AddFriend, dir.path());

        coordinator.run_iteration().await.unwrap();
        let (_, pkg) = coordinator.state.latest_for_on_connect();
        assert!(pkg.is_some());
    }

    #[tokio::test]
    async fn wrong_round_onion_is_rejected_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(ServiceName::Dialing, dir.path());
        coordinator.run_iteration().await.unwrap();

        let err = coordinator.state.submit_onion(RoundNumber(999), vec![1]).unwrap_err();
        assert_eq!(err.current, RoundNumber(1));
    }

    #[test]
    fn close_twice_reports_already_closed() {
        let dir = tempfile::tempdir().unwrap();
        let config = genesis_config(ServiceName::Dialing);
        PersistedState::bootstrap(config).unwrap().persist(&default_path(dir.path().to_str().unwrap())).unwrap();

        let factory = Arc::new(FakeFactory {
            pkg: Arc::new(FakePkgClient),
            cdn: Arc::new(FakeCdnClient::default()),
            mix_chain: Arc::new(FakeMixChainClient::default()),
        });
        let metrics = Arc::new(Metrics::new().unwrap());
        let config_client: Arc<dyn ConfigClient> = Arc::new(FakeConfigClient(genesis_config(ServiceName::Dialing)));
        let coordinator = Coordinator::new(
            ServiceName::Dialing,
            dir.path().to_str().unwrap().to_string(),
            test_config(),
            config_client,
            factory,
            metrics,
        )
        .unwrap();

        assert!(coordinator.close().is_ok());
        assert!(matches!(coordinator.close(), Err(CoordinatorError::AlreadyClosed)));
    }
}
