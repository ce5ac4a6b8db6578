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

//! Alpenhorn coordinator entrypoint (systemd-friendly). Reads its
//! identity and peer-pinning config from the environment, loads or
//! bootstraps persisted round state, then serves the round loop and the
//! websocket fabric side by side: the round loop drives `/ws`, `/metrics`
//! reports `prometheus::Registry`, and `/healthz` flips once the loop has
//! completed a round.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{info, warn};

use alpenhorn_coordinator::clients::factory::HttpClientFactory;
use alpenhorn_coordinator::config::client::HttpConfigClient;
use alpenhorn_coordinator::config::signed_config::SignedConfig;
use alpenhorn_coordinator::coordinator::{replay_on_connect, ConnCtx, Coordinator, CoordinatorConfig};
use alpenhorn_coordinator::core::security::keystore::{FileEd25519Backend, Keystore};
use alpenhorn_coordinator::core::types::{PublicKey, ServiceName};
use alpenhorn_coordinator::monitoring::metrics::Metrics;
use alpenhorn_coordinator::networking::transport::edtls::EphemeralCert;
use alpenhorn_coordinator::networking::transport::http::AuthenticatedHttpClient;
use alpenhorn_coordinator::persistence::{default_path, PersistedState};

type AppCoordinator = Coordinator<HttpClientFactory<FileEd25519Backend>>;

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_ms(key: &str, default_ms: u64) -> std::time::Duration {
    let ms = std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default_ms);
    std::time::Duration::from_millis(ms)
}

fn parse_service(s: &str) -> Result<ServiceName> {
    match s {
        "addfriend" => Ok(ServiceName::AddFriend),
        "dialing" => Ok(ServiceName::Dialing),
        other => Err(anyhow!("unknown ALPENHORN_SERVICE {other:?}, want addfriend or dialing")),
    }
}

fn parse_hex_key(s: &str) -> Result<PublicKey> {
    Ok(PublicKey(hex::decode(s).context("hex-decoding key")?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let data_dir = env("ALPENHORN_DATA_DIR", "./data");
    std::fs::create_dir_all(&data_dir).context("creating data dir")?;
    let service = parse_service(&env("ALPENHORN_SERVICE", "addfriend"))?;
    let listen_addr: SocketAddr =
        env("ALPENHORN_LISTEN_ADDR", "0.0.0.0:8443").parse().context("parsing ALPENHORN_LISTEN_ADDR")?;

    let config = CoordinatorConfig {
        num_mailboxes: env_u32("ALPENHORN_NUM_MAILBOXES", 1 << 16),
        announce_settle: env_ms("ALPENHORN_ANNOUNCE_SETTLE_MS", 500),
        pkg_wait: env_ms("ALPENHORN_PKG_WAIT_MS", 2000),
        mix_wait: env_ms("ALPENHORN_MIX_WAIT_MS", 2000),
        round_wait: env_ms("ALPENHORN_ROUND_WAIT_MS", 2000),
    };

    bootstrap_if_missing(&data_dir).context("bootstrapping persisted state")?;

    let keystore =
        Arc::new(Keystore::open(&data_dir).map_err(|e| anyhow!("keystore open failed: {e:?}"))?);
    info!(service = service.as_str(), pubkey = %hex::encode(keystore.public_key()), "coordinator identity");

    let http = Arc::new(AuthenticatedHttpClient::new(keystore.clone()));

    let config_server_addr = env("ALPENHORN_CONFIG_SERVER_ADDR", "");
    let config_server_key = parse_hex_key(&env("ALPENHORN_CONFIG_SERVER_KEY", ""))
        .context("parsing ALPENHORN_CONFIG_SERVER_KEY")?;
    let config_client = Arc::new(HttpConfigClient::new(
        http.clone(),
        config_server_addr.clone(),
        config_server_addr,
        config_server_key,
    ));

    let factory = Arc::new(HttpClientFactory::new(http));
    let metrics = Arc::new(Metrics::new().map_err(|e| anyhow!("metrics init failed: {e:?}"))?);

    let coordinator: Arc<AppCoordinator> =
        Coordinator::new(service, data_dir.clone(), config, config_client, factory, metrics)
            .map_err(|e| anyhow!("coordinator init failed: {e}"))?;

    let tls_cert = EphemeralCert::mint(&keystore).map_err(|e| anyhow!("minting listener cert failed: {e}"))?;
    // The listener's certificate is minted once at startup rather than
    // live-rotated the way `AuthenticatedHttpClient`'s outbound cache
    // refreshes per connection; restarting the process is how this
    // coordinator's own listening identity rotates (see DESIGN.md).
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(tls_cert.cert_pem(), tls_cert.key_pem())
        .await
        .context("building listener TLS config")?;

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(coordinator.clone());

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            if let Err(e) = shutdown_coordinator.close() {
                warn!(err = %e, "coordinator close");
            }
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        }
    });

    let round_loop = tokio::spawn(coordinator.clone().run());

    info!(%listen_addr, "coordinator listening");
    axum_server::bind_rustls(listen_addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("serving http")?;

    let _ = round_loop.await;
    Ok(())
}

/// Seed `data_dir/state.json` from `ALPENHORN_BOOTSTRAP_CONFIG` (a JSON
/// `SignedConfig`, operator-trusted, signatures unchecked) the first time
/// this coordinator starts against an empty data directory.
fn bootstrap_if_missing(data_dir: &str) -> Result<()> {
    let path = default_path(data_dir);
    if path.exists() {
        return Ok(());
    }
    let bootstrap_path = env("ALPENHORN_BOOTSTRAP_CONFIG", "");
    if bootstrap_path.is_empty() {
        return Err(anyhow!(
            "no persisted state at {} and ALPENHORN_BOOTSTRAP_CONFIG is unset",
            path.display()
        ));
    }
    let bytes = std::fs::read(Path::new(&bootstrap_path)).context("reading ALPENHORN_BOOTSTRAP_CONFIG")?;
    let genesis: SignedConfig = serde_json::from_slice(&bytes).context("parsing bootstrap config")?;
    let state = PersistedState::bootstrap(genesis).map_err(|e| anyhow!("bootstrap failed: {e}"))?;
    state.persist(&path).map_err(|e| anyhow!("persisting bootstrap state failed: {e}"))?;
    info!(path = %path.display(), "seeded persisted state from bootstrap config");
    Ok(())
}

async fn ws_handler(
    State(coordinator): State<Arc<AppCoordinator>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
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

async fn metrics_handler(State(coordinator): State<Arc<AppCoordinator>>) -> impl IntoResponse {
    match coordinator.metrics().gather() {
        Ok(body) => (axum::http::StatusCode::OK, body),
        Err(_) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
    }
}

async fn healthz_handler(State(coordinator): State<Arc<AppCoordinator>>) -> impl IntoResponse {
    if coordinator.is_ready() {
        (axum::http::StatusCode::OK, "ok")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "round loop has not completed a round yet")
    }
}
