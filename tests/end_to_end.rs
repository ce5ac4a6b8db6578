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

//! End-to-end coordinator scenarios driven over a real websocket, against
//! in-memory fakes for the PKG, CDN, and mix-chain collaborators (their
//! own internals are out of scope; only the coordinator-side calls are
//! exercised here). The library's own `#[cfg(test)] pub mod fake` fakes
//! live behind `cfg(test)` and are not visible to this external test
//! binary, so equivalent fakes are written directly below.
//!
//! CDN bucket TTL/expiry is not covered here: the CDN's own storage
//! lifecycle is the out-of-scope collaborator's concern, not this
//! crate's.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use alpenhorn_coordinator::clients::cdn::{CdnClient, CdnError};
use alpenhorn_coordinator::clients::mix_chain::{MixChainClient, MixChainError};
use alpenhorn_coordinator::clients::pkg::{PkgClient, PkgError};
use alpenhorn_coordinator::config::client::{ConfigClient, ConfigClientError};
use alpenhorn_coordinator::config::signed_config::{ServerLocator, ServicePayload, SignedConfig};
use alpenhorn_coordinator::coordinator::{replay_on_connect, ClientFactory, ConnCtx, Coordinator, CoordinatorConfig};
use alpenhorn_coordinator::core::types::{
    MailboxUrl, MixRound, OnionSubmission, PkgRound, PublicKey, RoundNumber, RoundSettings, ServiceName, Signature,
};
use alpenhorn_coordinator::mixer::dialing::DialingMixer;
use alpenhorn_coordinator::mixer::{LaplaceParams, Mixer, ServiceData};
use alpenhorn_coordinator::bloom::BloomFilter;
use alpenhorn_coordinator::monitoring::metrics::Metrics;
use alpenhorn_coordinator::networking::ws::envelope::{Envelope, ID_ERROR, ID_MAILBOX, ID_MIX, ID_NEWROUND, ID_ONION, ID_PKG};
use alpenhorn_coordinator::persistence::{default_path, PersistedState};

// ---- in-memory fakes, mirroring the library's own cfg(test) fakes ----

struct FakeConfigClient {
    configs: Mutex<VecDeque<SignedConfig>>,
    last: Mutex<Option<SignedConfig>>,
}

impl FakeConfigClient {
    fn new(configs: Vec<SignedConfig>) -> Self {
        Self { configs: Mutex::new(configs.into()), last: Mutex::new(None) }
    }
}

#[async_trait]
impl ConfigClient for FakeConfigClient {
    async fn current_config(&self, _service: ServiceName) -> Result<SignedConfig, ConfigClientError> {
        let mut queue = self.configs.lock().expect("fake config poisoned");
        let next = queue.pop_front();
        let mut last = self.last.lock().expect("fake config poisoned");
        if let Some(c) = next {
            *last = Some(c);
        }
        Ok(last.clone().expect("at least one config queued"))
    }
}

#[derive(Default)]
struct FakePkgClient;

#[async_trait]
impl PkgClient for FakePkgClient {
    async fn new_round(&self, round: RoundNumber) -> Result<PkgRound, PkgError> {
        Ok(PkgRound { round, settings: vec![0xAB; 16] })
    }
}

#[derive(Default)]
struct FakeCdnClient;

#[async_trait]
impl CdnClient for FakeCdnClient {
    async fn new_bucket(&self, _service: ServiceName, _round: RoundNumber, _uploader_key: &PublicKey) -> Result<(), CdnError> {
        Ok(())
    }

    async fn put(&self, service: ServiceName, round: RoundNumber, _mapping: BTreeMap<String, Vec<u8>>) -> Result<String, CdnError> {
        Ok(format!("memory://{}/{}", service.as_str(), round.0))
    }
}

#[derive(Default)]
struct FakeMixChainClient {
    rounds: Mutex<Vec<(ServiceName, RoundNumber, Vec<Vec<u8>>)>>,
}

#[async_trait]
impl MixChainClient for FakeMixChainClient {
    async fn new_round(&self, service: ServiceName, round: RoundNumber, service_data: Vec<u8>) -> Result<MixRound, MixChainError> {
        Ok(MixRound {
            settings: RoundSettings { service, round, onion_keys: vec![PublicKey(vec![0xEE; 32])], service_data },
            signatures: vec![Signature(vec![0x11; 64])],
            end_time_ms: 0,
        })
    }

    async fn run_round(&self, service: ServiceName, round: RoundNumber, onions: Vec<Vec<u8>>) -> Result<MailboxUrl, MixChainError> {
        let num_mailboxes = onions.len() as u32;
        self.rounds.lock().expect("fake mix chain poisoned").push((service, round, onions));
        Ok(MailboxUrl { round, url: format!("memory://{}/{}", service.as_str(), round.0), num_mailboxes })
    }
}

impl FakeMixChainClient {
    fn last_round_onions(&self) -> Option<Vec<Vec<u8>>> {
        self.rounds.lock().expect("fake mix chain poisoned").last().map(|(_, _, o)| o.clone())
    }
}

struct TestFactory {
    pkg: Arc<FakePkgClient>,
    cdn: Arc<FakeCdnClient>,
    mix_chain: Arc<FakeMixChainClient>,
}

#[async_trait]
impl ClientFactory for TestFactory {
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

type TestCoordinator = Coordinator<TestFactory>;

fn genesis_config(service: ServiceName, guardians: Vec<PublicKey>, threshold: u32) -> SignedConfig {
    SignedConfig {
        service,
        created_unix: 1,
        expires_unix: u64::MAX,
        previous_config_hash: None,
        guardians,
        threshold,
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

fn fast_config() -> CoordinatorConfig {
    let wait = Duration::from_millis(20);
    CoordinatorConfig { num_mailboxes: 4, announce_settle: wait, pkg_wait: wait, mix_wait: wait, round_wait: wait }
}

async fn ws_handler(State(coordinator): State<Arc<TestCoordinator>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| async move {
        let hub = coordinator.hub();
        let ctx_hub = hub.clone();
        let state = coordinator.state();
        let metrics = coordinator.metrics();
        let service = coordinator.service();
        let conn_id = hub
            .register(socket, move |handle| ConnCtx { handle, state, metrics, hub: ctx_hub, service })
            .await;
        replay_on_connect(&hub, conn_id, &coordinator.state());
    })
}

/// Spin up a coordinator over `configs` (the first is fetched on the
/// first round, the rest replace it as `current_config` on later polls)
/// behind a real listening websocket server, and start its round loop.
/// Returns the server's `ws://` URL and the coordinator handle.
async fn spin_up(
    service: ServiceName,
    cfg: CoordinatorConfig,
    configs: Vec<SignedConfig>,
) -> (String, Arc<TestCoordinator>) {
    let dir = tempfile::tempdir().unwrap();
    let genesis = configs[0].clone();
    PersistedState::bootstrap(genesis).unwrap().persist(&default_path(dir.path().to_str().unwrap())).unwrap();

    let factory = Arc::new(TestFactory {
        pkg: Arc::new(FakePkgClient),
        cdn: Arc::new(FakeCdnClient),
        mix_chain: Arc::new(FakeMixChainClient::default()),
    });
    let metrics = Arc::new(Metrics::new().unwrap());
    let config_client: Arc<dyn ConfigClient> = Arc::new(FakeConfigClient::new(configs));

    let coordinator: Arc<TestCoordinator> =
        Coordinator::new(service, dir.path().to_str().unwrap().to_string(), cfg, config_client, factory, metrics).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let app = Router::new().route("/ws", get(ws_handler)).with_state(coordinator.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::spawn(coordinator.clone().run());

    // Leak the tempdir for the test's lifetime; cleaned up by the OS on
    // process exit, fine for a short-lived test binary.
    std::mem::forget(dir);

    (format!("ws://{addr}/ws"), coordinator)
}

async fn connect(url: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn recv_envelope(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Envelope {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            WsMessage::Text(text) => return Envelope::from_frame_bytes(text.as_bytes()).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_envelope(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    env: &Envelope,
) {
    let bytes = env.to_frame_bytes().unwrap();
    ws.send(WsMessage::Text(String::from_utf8(bytes).unwrap())).await.unwrap();
}

// ---- scenario 1: single-client AddFriend round ----

#[tokio::test]
async fn addfriend_round_flows_newround_pkg_mix_onion_mailbox() {
    let genesis = genesis_config(ServiceName::AddFriend, vec![PublicKey(vec![9; 32])], 1);
    let (url, _coordinator) = spin_up(ServiceName::AddFriend, fast_config(), vec![genesis]).await;

    let mut ws = connect(&url).await;

    let newround = recv_envelope(&mut ws).await;
    assert_eq!(newround.id, ID_NEWROUND);
    let announcement: alpenhorn_coordinator::core::types::NewRoundAnnouncement = newround.decode().unwrap();
    assert_eq!(announcement.round, RoundNumber(1));

    let pkg = recv_envelope(&mut ws).await;
    assert_eq!(pkg.id, ID_PKG);

    let mix = recv_envelope(&mut ws).await;
    assert_eq!(mix.id, ID_MIX);

    let onion_env = Envelope::encode(ID_ONION, &OnionSubmission { round: announcement.round, onion: vec![7; 8] }).unwrap();
    send_envelope(&mut ws, &onion_env).await;

    let mailbox_env = recv_envelope(&mut ws).await;
    assert_eq!(mailbox_env.id, ID_MAILBOX);
    let mailbox: MailboxUrl = mailbox_env.decode().unwrap();
    assert_eq!(mailbox.round, RoundNumber(1));
    assert_eq!(mailbox.num_mailboxes, 1);
}

// ---- scenario 2: wrong-round submission is rejected, not silently dropped ----

#[tokio::test]
async fn wrong_round_submission_gets_targeted_error_reply() {
    let genesis = genesis_config(ServiceName::Dialing, vec![PublicKey(vec![9; 32])], 1);
    let (url, _coordinator) = spin_up(ServiceName::Dialing, fast_config(), vec![genesis]).await;

    let mut ws = connect(&url).await;
    let newround = recv_envelope(&mut ws).await;
    assert_eq!(newround.id, ID_NEWROUND);

    let bogus = Envelope::encode(ID_ONION, &OnionSubmission { round: RoundNumber(999), onion: vec![1] }).unwrap();
    send_envelope(&mut ws, &bogus).await;

    let err_env = recv_envelope(&mut ws).await;
    assert_eq!(err_env.id, ID_ERROR);
    let err: alpenhorn_coordinator::core::types::RoundError = err_env.decode().unwrap();
    assert_eq!(err.round, RoundNumber(1));
    assert!(err.reason.contains("wrong round"));
}

// ---- scenario 4: guardian-threshold config chain is adopted once observed ----

#[tokio::test]
async fn successor_config_is_adopted_once_threshold_signatures_are_present() {
    let (ks1, pk1) = {
        let dir = tempfile::tempdir().unwrap();
        let ks = alpenhorn_coordinator::core::security::keystore::Keystore::open(dir.path().to_str().unwrap()).unwrap();
        let pk = PublicKey(ks.public_key().to_vec());
        std::mem::forget(dir);
        (ks, pk)
    };

    let genesis = genesis_config(ServiceName::Dialing, vec![pk1.clone()], 1);
    let genesis_hash = genesis.hash().unwrap();

    let mut successor = genesis_config(ServiceName::Dialing, vec![pk1.clone()], 1);
    successor.created_unix = 2;
    successor.previous_config_hash = Some(genesis_hash);
    let msg = successor.signing_message().unwrap();
    successor.signatures.insert(pk1, ks1.sign(&msg).unwrap());
    let successor_hash = successor.hash().unwrap();

    let (_url, coordinator) =
        spin_up(ServiceName::Dialing, fast_config(), vec![genesis, successor]).await;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if coordinator.state().current_config_hash() == successor_hash {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "successor config was never adopted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(coordinator.state().has_config(&genesis_hash));
    assert!(coordinator.state().has_config(&successor_hash));
}

// ---- scenario 5: a stalled client is shed under broadcast backpressure ----

#[derive(Serialize)]
struct LoadTestPayload {
    filler: String,
}

#[tokio::test]
async fn stalled_client_is_shed_while_others_keep_receiving() {
    let genesis = genesis_config(ServiceName::Dialing, vec![PublicKey(vec![9; 32])], 1);
    let (url, coordinator) = spin_up(ServiceName::Dialing, fast_config(), vec![genesis]).await;

    const NUM_CLIENTS: usize = 10;
    const STALLED_INDEX: usize = 6;
    const NUM_BROADCASTS: usize = 1000;

    let mut counters = Vec::with_capacity(NUM_CLIENTS - 1);
    let mut stalled_ws = None;

    for i in 0..NUM_CLIENTS {
        let mut ws = connect(&url).await;
        let _newround = recv_envelope(&mut ws).await;

        if i == STALLED_INDEX {
            stalled_ws = Some(ws);
            continue;
        }

        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter_task = counter.clone();
        tokio::spawn(async move {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(_))) => {
                        counter_task.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        });
        counters.push(counter);
    }
    // Hold the stalled client's connection open without ever reading from
    // it, so its outbound queue and then its TCP receive window fill up.
    let _stalled_ws = stalled_ws.unwrap();

    let filler = "x".repeat(2048);
    for _ in 0..NUM_BROADCASTS {
        coordinator.hub().broadcast("loadtest", &LoadTestPayload { filler: filler.clone() });
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(coordinator.hub().len() < NUM_CLIENTS, "the stalled client should have been shed");
    let delivered: usize = counters.iter().map(|c| c.load(std::sync::atomic::Ordering::Relaxed)).max().unwrap_or(0);
    assert!(delivered > NUM_BROADCASTS / 2, "an actively-reading client should have received most broadcasts, got {delivered}");
}

// ---- scenario 6: dialing round publishes a bloom filter containing every submitted token ----

#[tokio::test]
async fn dialing_round_dispatch_yields_bloom_filter_over_submitted_tokens() {
    let genesis = genesis_config(ServiceName::Dialing, vec![PublicKey(vec![9; 32])], 1);

    let dir = tempfile::tempdir().unwrap();
    PersistedState::bootstrap(genesis.clone()).unwrap().persist(&default_path(dir.path().to_str().unwrap())).unwrap();

    let mix_chain = Arc::new(FakeMixChainClient::default());
    let factory = Arc::new(TestFactory { pkg: Arc::new(FakePkgClient), cdn: Arc::new(FakeCdnClient), mix_chain: mix_chain.clone() });
    let metrics = Arc::new(Metrics::new().unwrap());
    let config_client: Arc<dyn ConfigClient> = Arc::new(FakeConfigClient::new(vec![genesis]));

    let coordinator: Arc<TestCoordinator> = Coordinator::new(
        ServiceName::Dialing,
        dir.path().to_str().unwrap().to_string(),
        fast_config(),
        config_client,
        factory,
        metrics,
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/ws", get(ws_handler)).with_state(coordinator.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::spawn(coordinator.clone().run());

    let mut ws = connect(&format!("ws://{addr}/ws")).await;
    let newround = recv_envelope(&mut ws).await;
    let announcement: alpenhorn_coordinator::core::types::NewRoundAnnouncement = newround.decode().unwrap();
    let _mix = recv_envelope(&mut ws).await;

    // Ten distinct tokens for mailbox 1, already in the wire format the
    // Dialing mixer's final hop expects (mailbox header + fixed token),
    // since the fake mix chain below does no onion peeling of its own.
    let mut tokens = Vec::new();
    for i in 0u8..10 {
        let mut onion = vec![0u8; 4 + 32];
        onion[..4].copy_from_slice(&1u32.to_be_bytes());
        onion[4..].copy_from_slice(&[i; 32]);
        tokens.push(onion[4..].to_vec());
        let env = Envelope::encode(ID_ONION, &OnionSubmission { round: announcement.round, onion }).unwrap();
        send_envelope(&mut ws, &env).await;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let onions = loop {
        if let Some(onions) = mix_chain.last_round_onions() {
            if onions.len() == tokens.len() {
                break onions;
            }
        }
        assert!(std::time::Instant::now() < deadline, "round never dispatched the submitted onions");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let mixer = DialingMixer;
    let data = ServiceData { num_mailboxes: 1, laplace: LaplaceParams { mu: 0.0, b: 1.0 } };
    let grouped = mixer.handle_messages(&data, onions).unwrap();

    let filter = BloomFilter::decode(&grouped["1"]).unwrap();
    for token in &tokens {
        assert!(filter.test(token));
    }
}
