use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, UdpSocket},
    sync::{mpsc, Mutex},
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use fence_common::{
    captive_dns,
    config::{HOLD_THRESHOLD_MS, RESTART_DELAY_MS},
    save_settings, FenceController, FileStore, HoldDetector, HoldStatus, OutputError, Relay,
    RelayController, RelayOutputs, SessionSink, SettingsForm, SinkError, TargetProfile,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const SETTINGS_HTML: &str = include_str!("../web/settings.html");
const STYLE_CSS: &str = include_str!("../web/style.css");
const BIND_ATTEMPTS: u32 = 20;

static RESET_BUTTON: HoldDetector = HoldDetector::new(HOLD_THRESHOLD_MS);

type Controller = FenceController<SimulatedRelays, FileStore, ChannelSink>;

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<Controller>>,
    store: FileStore,
    ws_port: u16,
    next_session: Arc<AtomicI32>,
}

struct HostConfig {
    data_dir: PathBuf,
    http_port: u16,
    ws_port: u16,
    dns_port: Option<u16>,
}

impl HostConfig {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("FENCE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.fence-controller")),
            http_port: env_port("FENCE_HTTP_PORT").unwrap_or(8080),
            ws_port: env_port("FENCE_WS_PORT").unwrap_or(8081),
            dns_port: env_port("FENCE_DNS_PORT"),
        }
    }
}

/// Stand-in for the relay pins. Logs the level each pin would be driven to.
struct SimulatedRelays {
    profile: TargetProfile,
}

impl RelayOutputs for SimulatedRelays {
    fn drive(&mut self, relay: Relay, on: bool) -> Result<(), OutputError> {
        let pin = match relay {
            Relay::Fence => self.profile.fence_pin,
            Relay::Siren => self.profile.siren_pin,
        };
        let high = self.profile.relay_active.pin_high(on);
        info!(
            "GPIO{pin} ({}) -> {}",
            relay.as_str(),
            if high { "HIGH" } else { "LOW" }
        );
        Ok(())
    }
}

/// Outbound queue feeding one WebSocket task.
struct ChannelSink(mpsc::UnboundedSender<String>);

impl SessionSink for ChannelSink {
    fn send_text(&mut self, text: &str) -> Result<(), SinkError> {
        self.0
            .send(text.to_string())
            .map_err(|err| SinkError(err.to_string()))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = FileStore::new(&config.data_dir);

    let creds = store.load_credentials();
    info!(
        "stored network settings: ssid=`{}` mode={}",
        creds.ssid(),
        creds.mode().as_str()
    );

    let profile = TargetProfile::resolve();
    info!("board profile `{}`", profile.name);
    let relays = RelayController::new(SimulatedRelays { profile }, store.clone());

    let app_state = AppState {
        controller: Arc::new(Mutex::new(FenceController::new(relays))),
        store,
        ws_port: config.ws_port,
        next_session: Arc::new(AtomicI32::new(1)),
    };

    spawn_button_console();
    spawn_reset_watcher(app_state.store.clone());
    if let Some(port) = config.dns_port {
        spawn_captive_dns(port);
    }

    let ws_app = Router::new()
        .route("/", get(handle_ws_upgrade))
        .with_state(app_state.clone());
    let ws_listener = bind_with_retry(config.ws_port).await?;
    info!("websocket listening on ws://{}", ws_listener.local_addr()?);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(ws_listener, ws_app).await {
            warn!("websocket server stopped: {err}");
        }
    });

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/settings", get(handle_settings))
        .route("/style.css", get(handle_style))
        .route("/save", post(handle_save))
        .route("/clear", get(handle_clear))
        .route("/api/status", get(handle_get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let listener = bind_with_retry(config.http_port).await?;
    info!("controller listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    Html(INDEX_HTML.replace("{{WS_PORT}}", &state.ws_port.to_string()))
}

async fn handle_settings() -> impl IntoResponse {
    Html(SETTINGS_HTML)
}

async fn handle_style() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css")], STYLE_CSS)
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    let creds = match tokio::task::spawn_blocking(move || store.load_credentials()).await {
        Ok(creds) => creds,
        Err(err) => {
            warn!("status task failed: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let status = state.controller.lock().await.status(&creds);
    Json(status).into_response()
}

async fn handle_save(
    State(state): State<AppState>,
    Form(form): Form<SettingsForm>,
) -> impl IntoResponse {
    let store = state.store.clone();
    let saved = tokio::task::spawn_blocking(move || save_settings(&store, &form)).await;

    match saved {
        Ok(Ok(_)) => {
            schedule_restart();
            (StatusCode::OK, "Settings Saved! Rebooting...")
        }
        Ok(Err(err)) => {
            warn!("settings not saved: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to save settings")
        }
        Err(err) => {
            warn!("settings save task failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to save settings")
        }
    }
}

async fn handle_clear(State(state): State<AppState>) -> impl IntoResponse {
    clear_store(state.store.clone()).await;
    schedule_restart();
    "Credentials Cleared! Rebooting..."
}

async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let id = state.next_session.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.controller.lock().await.connect(id, ChannelSink(tx));

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch_text(Arc::clone(&state.controller), id, text.to_string()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("websocket session {id} failed: {err}");
                    break;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = socket.send(Message::Text(text.into())).await {
                        warn!("websocket session {id} write failed: {err}");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    state.controller.lock().await.disconnect(id);
}

/// Runs one inbound frame on the blocking pool. A toggle persists relay
/// state with synchronous file writes.
async fn dispatch_text(controller: Arc<Mutex<Controller>>, id: i32, text: String) {
    let handled = tokio::task::spawn_blocking(move || {
        controller.blocking_lock().handle_text(id, &text);
    })
    .await;
    if let Err(err) = handled {
        warn!("websocket session {id} command task failed: {err}");
    }
}

async fn clear_store(store: FileStore) {
    match tokio::task::spawn_blocking(move || store.clear_all()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("clear incomplete: {err}"),
        Err(err) => warn!("clear task failed: {err}"),
    }
}

/// Reads `press` / `release` lines from stdin in place of the reset button.
fn spawn_button_console() {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("type `press` / `release` to simulate the reset button");
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "press" => RESET_BUTTON.on_edge(true, millis()),
                "release" => RESET_BUTTON.on_edge(false, millis()),
                "" => {}
                other => warn!("unknown button command `{other}`"),
            }
        }
    });
}

fn spawn_reset_watcher(store: FileStore) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            interval.tick().await;
            if RESET_BUTTON.poll(millis()) != HoldStatus::ResetRequested {
                continue;
            }

            warn!("reset button held, restoring factory settings");
            clear_store(store.clone()).await;
            tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
            restart_process();
        }
    });
}

fn spawn_captive_dns(port: u16) {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("captive DNS disabled, bind on port {port} failed: {err}");
                return;
            }
        };
        info!("captive DNS answering on udp port {port}");

        let mut request = [0u8; 512];
        let mut reply = [0u8; 512];
        loop {
            let (len, peer) = match socket.recv_from(&mut request).await {
                Ok(received) => received,
                Err(err) => {
                    warn!("captive DNS receive failed: {err}");
                    continue;
                }
            };
            let Some(reply_len) = captive_dns::build_captive_response(
                &request[..len],
                Ipv4Addr::LOCALHOST,
                &mut reply,
            ) else {
                continue;
            };
            if let Err(err) = socket.send_to(&reply[..reply_len], peer).await {
                warn!("captive DNS reply to {peer} failed: {err}");
            }
        }
    });
}

fn schedule_restart() {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
        restart_process();
    });
}

/// Relaunches the current binary with the same arguments and exits.
fn restart_process() -> ! {
    let relaunch = std::env::current_exe().and_then(|exe| {
        std::process::Command::new(exe)
            .args(std::env::args_os().skip(1))
            .spawn()
    });
    match relaunch {
        Ok(child) => info!("restarting as pid {}", child.id()),
        Err(err) => warn!("failed to relaunch controller: {err}"),
    }
    std::process::exit(0);
}

/// The relaunched process may start before the old one has released its ports.
async fn bind_with_retry(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) if attempt < BIND_ATTEMPTS => {
                warn!("bind {addr} failed (attempt {attempt}/{BIND_ATTEMPTS}): {err}");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to bind controller server at {addr}"));
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn env_port(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Wrapping millisecond clock fed to the hold detector.
fn millis() -> u32 {
    monotonic_ms() as u32
}
