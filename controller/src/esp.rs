use core::convert::TryInto;
use std::{
    net::{Ipv4Addr, UdpSocket},
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{
        ws::{EspHttpWsConnection, EspHttpWsDetachedSender},
        Configuration as HttpConfiguration, EspHttpServer,
    },
    log::EspLogger,
    mdns::EspMdns,
    nvs::EspDefaultNvsPartition,
    sys::{esp, esp_vfs_spiffs_conf_t, esp_vfs_spiffs_register, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use fence_common::{
    captive_dns,
    config::{
        DNS_PORT, HTTP_PORT, MAX_WS_FRAME, MDNS_HOSTNAME, MDNS_INSTANCE_NAME, RESTART_DELAY_MS,
        WS_PORT,
    },
    run_session_events, save_settings, FenceController, FileStore, HoldStatus,
    NetworkCredentials, RelayController, SessionEvent, SessionSink, SettingsForm, SinkError,
    TargetProfile, WifiMode,
};

use crate::board::{self, BoardRelays, ResetButton, RESET_BUTTON};

const STORAGE_ROOT: &str = "/spiffs";
const MAX_HTTP_BODY: usize = 512;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const LOOP_TICK_MS: u64 = 20;
const WS_CTRL_PORT: u16 = 32_769;
const MIN_WPA2_PASSWORD_LEN: usize = 8;

const INDEX_HTML: &str = include_str!("../web/index.html");
const SETTINGS_HTML: &str = include_str!("../web/settings.html");
const STYLE_CSS: &str = include_str!("../web/style.css");

/// Probe URLs phones and laptops fetch to detect a captive portal.
const PORTAL_PROBES: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

type Controller = FenceController<BoardRelays, FileStore, WsSink>;

enum WifiStartup {
    Station(EspWifi<'static>),
    AccessPoint(EspWifi<'static>, Ipv4Addr),
}

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<Controller>>,
    store: FileStore,
}

struct WsSink(EspHttpWsDetachedSender);

impl SessionSink for WsSink {
    fn send_text(&mut self, text: &str) -> Result<(), SinkError> {
        self.0
            .send(FrameType::Text(false), text.as_bytes())
            .map_err(|err| SinkError(err.to_string()))
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    mount_storage()?;
    let store = FileStore::new(STORAGE_ROOT);
    let creds = store.load_credentials();
    info!(
        "stored network settings: ssid=`{}` mode={}",
        creds.ssid(),
        creds.mode().as_str()
    );

    let profile = TargetProfile::resolve();
    info!("board profile `{}`", profile.name);

    // Relays are restored before any network service can reach them.
    let relays = RelayController::new(BoardRelays::new(&profile)?, store.clone());
    let mut reset_button = ResetButton::new(profile.reset_pin)?;

    let state = SharedState {
        controller: Arc::new(Mutex::new(FenceController::new(relays))),
        store: store.clone(),
    };

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let wifi = match start_wifi(modem, sys_loop, nvs_partition, &creds)
        .context("wifi startup failed")?
    {
        WifiStartup::Station(wifi) => wifi,
        WifiStartup::AccessPoint(wifi, ip) => {
            if let Err(err) = spawn_captive_dns(ip) {
                warn!("captive DNS unavailable: {err:#}");
            }
            wifi
        }
    };

    let mdns = match start_mdns() {
        Ok(mdns) => Some(mdns),
        Err(err) => {
            warn!("mDNS unavailable, continuing without discovery: {err:#}");
            None
        }
    };

    let http_server = create_http_server(state.clone())?;
    let ws_server = create_ws_server(state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _mdns = mdns;
    let _http_server = http_server;
    let _ws_server = ws_server;

    loop {
        thread::sleep(Duration::from_millis(LOOP_TICK_MS));
        reset_button.service();
        if RESET_BUTTON.poll(board::millis()) == HoldStatus::ResetRequested {
            factory_reset(&store);
        }
    }
}

fn factory_reset(store: &FileStore) -> ! {
    warn!("reset button held, restoring factory settings");
    if let Err(err) = store.clear_all() {
        warn!("factory reset incomplete: {err}");
    }
    thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
    unsafe { esp_idf_svc::sys::esp_restart() };
    #[allow(unreachable_code)]
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

fn mount_storage() -> anyhow::Result<()> {
    let conf = esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    esp!(unsafe { esp_vfs_spiffs_register(&conf) }).context("failed to mount SPIFFS")?;
    info!("storage mounted at {STORAGE_ROOT}");
    Ok(())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: HTTP_PORT,
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    let index = INDEX_HTML.replace("{{WS_PORT}}", &WS_PORT.to_string());
    for path in std::iter::once("/").chain(PORTAL_PROBES) {
        let index = index.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?.write_all(index.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/settings", Method::Get, move |req| {
        req.into_ok_response()?.write_all(SETTINGS_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/css")])?
            .write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let creds = state.store.load_credentials();
            let status = lock(&state.controller).status(&creds);
            write_json(req, &status)
        })?;
    }

    {
        let store = state.store.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = match SettingsForm::parse_urlencoded(&body) {
                Ok(form) => form,
                Err(err) => {
                    warn!("rejecting settings form: {err}");
                    return write_text(req, 400, "Invalid settings form");
                }
            };

            match save_settings(&store, &form) {
                Ok(_) => {
                    write_text(req, 200, "Settings Saved! Rebooting...")?;
                    schedule_restart();
                    Ok(())
                }
                Err(err) => {
                    warn!("settings not saved: {err}");
                    write_text(req, 500, "Failed to save settings")
                }
            }
        })?;
    }

    {
        let store = state.store.clone();
        server.fn_handler::<anyhow::Error, _>("/clear", Method::Get, move |req| {
            if let Err(err) = store.clear_all() {
                warn!("clear incomplete: {err}");
            }
            write_text(req, 200, "Credentials Cleared! Rebooting...")?;
            schedule_restart();
            Ok(())
        })?;
    }

    Ok(server)
}

fn create_ws_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: WS_PORT,
        ctrl_port: WS_CTRL_PORT,
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    // Detached senders block until this server's task runs the send. The
    // handler below runs on that task, so it only enqueues and never takes
    // the controller lock.
    let (events, inbox) = mpsc::channel::<SessionEvent<WsSink>>();
    spawn_ws_dispatch(state.controller, inbox)?;

    server.ws_handler("/", move |ws: &mut EspHttpWsConnection| -> Result<(), EspError> {
        let id = ws.session();
        let event = if ws.is_new() {
            SessionEvent::Opened(id, WsSink(ws.create_detached_sender()?))
        } else if ws.is_closed() {
            SessionEvent::Closed(id)
        } else {
            // The first receive with an empty buffer only reports the frame length.
            let (frame_type, len) = ws.recv(&mut [])?;
            if len > MAX_WS_FRAME {
                warn!("closing websocket session {id}: {len} byte frame");
                ws.send(FrameType::Close, &[])?;
                return Ok(());
            }
            let mut buf = [0_u8; MAX_WS_FRAME];
            if len > 0 {
                ws.recv(&mut buf[..len])?;
            }

            if !matches!(frame_type, FrameType::Text(_)) {
                return Ok(());
            }
            let Ok(text) = core::str::from_utf8(&buf[..len]) else {
                return Ok(());
            };
            SessionEvent::Text(id, text.to_string())
        };

        if events.send(event).is_err() {
            warn!("websocket dispatch thread is gone, dropping event for session {id}");
        }
        Ok(())
    })?;

    info!("websocket server listening on port {WS_PORT}");
    Ok(server)
}

fn spawn_ws_dispatch(
    controller: Arc<Mutex<Controller>>,
    inbox: Receiver<SessionEvent<WsSink>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("ws-dispatch".into())
        .stack_size(8 * 1024)
        .spawn(move || run_session_events(&controller, inbox))?;
    Ok(())
}

fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    creds: &NetworkCredentials,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    // `None` means the station joined; `Some(ip)` is the access point address.
    let access_point = {
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
        if creds.mode() == WifiMode::Host {
            Some(start_access_point(&mut wifi, creds)?)
        } else {
            match connect_station(&mut wifi, creds) {
                Ok(()) => None,
                Err(err) => {
                    warn!(
                        "joining `{}` failed ({err:#}); opening fallback access point",
                        creds.ssid()
                    );
                    let _ = wifi.disconnect();
                    let _ = wifi.stop();
                    Some(start_access_point(
                        &mut wifi,
                        &NetworkCredentials::default(),
                    )?)
                }
            }
        }
    };

    Ok(match access_point {
        Some(ip) => WifiStartup::AccessPoint(esp_wifi, ip),
        None => WifiStartup::Station(esp_wifi),
    })
}

fn connect_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    creds: &NetworkCredentials,
) -> anyhow::Result<()> {
    let auth_method = if creds.password().is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: creds
            .ssid()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: creds
            .password()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", creds.ssid());

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                let ip = wifi.wifi().sta_netif().get_ip_info()?.ip;
                info!("wifi connected on attempt {attempt}, address {ip}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    Err(anyhow!(
        "all {WIFI_CONNECT_ATTEMPTS} attempts failed; last error: {:?}",
        last_err
    ))
}

fn start_access_point(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    creds: &NetworkCredentials,
) -> anyhow::Result<Ipv4Addr> {
    let creds = if creds.password().is_empty() || creds.password().len() >= MIN_WPA2_PASSWORD_LEN
    {
        creds.clone()
    } else {
        warn!("stored password too short for WPA2; using default access point credentials");
        NetworkCredentials::default()
    };
    let auth_method = if creds.password().is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: creds
            .ssid()
            .try_into()
            .map_err(|_| anyhow!("access point SSID too long"))?,
        password: creds
            .password()
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;

    let ip = wifi.wifi().ap_netif().get_ip_info()?.ip;
    info!("access point `{}` up at {ip}", creds.ssid());
    Ok(ip)
}

fn start_mdns() -> anyhow::Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(MDNS_HOSTNAME)?;
    mdns.set_instance_name(MDNS_INSTANCE_NAME)?;
    mdns.add_service(None, "_http", "_tcp", HTTP_PORT, &[])?;
    mdns.add_service(None, "_websocket", "_tcp", WS_PORT, &[])?;
    info!("mDNS advertising {MDNS_HOSTNAME}.local");
    Ok(mdns)
}

fn spawn_captive_dns(ip: Ipv4Addr) -> anyhow::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DNS_PORT))
        .with_context(|| format!("failed to bind udp port {DNS_PORT}"))?;

    thread::Builder::new()
        .name("captive-dns".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            let mut request = [0_u8; 512];
            let mut reply = [0_u8; 512];
            info!("captive DNS resolving every name to {ip}");
            loop {
                let (len, peer) = match socket.recv_from(&mut request) {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("captive DNS receive failed: {err}");
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                };
                let Some(reply_len) =
                    captive_dns::build_captive_response(&request[..len], ip, &mut reply)
                else {
                    continue;
                };
                if let Err(err) = socket.send_to(&reply[..reply_len], peer) {
                    warn!("captive DNS reply to {peer} failed: {err}");
                }
            }
        })?;
    Ok(())
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread, restarting now: {err}");
        thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_text(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(message.as_bytes())?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
