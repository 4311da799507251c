use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, TryRecvError},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use irblaster_common::{
    event_channel,
    hal::{
        Clock, ConsoleIo, HalError, HalResult, IrTransceiver, StatusLed, SystemControl,
        Watchdog, WifiRadio,
    },
    storage::{DirFs, FileRegion},
    watchdog::{Countdown, Expiry, PingPong},
    web::{self, HttpRequest, HttpResponse},
    AccessPointCandidate, Board, CaptureEvent, Device, EventSender, FirmwareSettings, OtaError,
    OtaEvent, Platform, WatchdogKind, WifiMode,
};

use crate::{
    assets,
    ota::{self, OtaUpload, OTA_CHUNK_SIZE},
};

const HOST_HTTP_PORT: u16 = 8080;
const HOST_DNS_PORT: u16 = 5353;
const HOST_FS_CAPACITY: u64 = 1_441_792;
const MAX_FIRMWARE_BYTES: usize = 4 * 1024 * 1024;
const RESTART_EXIT_CODE: i32 = 3;
const WATCHDOG_EXIT_CODE: i32 = 4;
const COUNTDOWN_POLL_MS: u64 = 250;

struct HostPlatform;

impl Platform for HostPlatform {
    type Clock = HostClock;
    type Radio = SimulatedRadio;
    type Storage = FileRegion;
    type Fs = DirFs;
    type Ir = DisabledIr;
    type Watchdog = TimerWatchdog;
    type Led = LogLed;
    type System = ProcessControl;
    type Console = StdinConsole;
}

#[derive(Clone)]
struct WebState {
    fs: DirFs,
    events: EventSender,
    station: Arc<AtomicBool>,
    ota_password: Arc<String>,
    firmware_path: Arc<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("IRBLASTER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.irblaster"));
    let fs_root = data_dir.join("fs");
    std::fs::create_dir_all(&fs_root)
        .with_context(|| format!("failed to create {}", fs_root.display()))?;

    let settings = load_settings(&data_dir)?;
    let fs = DirFs::new(fs_root, HOST_FS_CAPACITY);
    let seeded = assets::seed(&fs).context("failed to seed web assets")?;
    if seeded > 0 {
        info!("seeded {seeded} web assets into {}", fs.root().display());
    }

    let scan = std::env::var("IRBLASTER_SCAN")
        .map(|raw| parse_scan_list(&raw))
        .unwrap_or_default();

    let console = cfg!(feature = "debug-console").then(StdinConsole::spawn);

    let board = Board::<HostPlatform> {
        clock: HostClock::default(),
        radio: SimulatedRadio::new(scan),
        storage: FileRegion::new(data_dir.join("config.bin")),
        fs: fs.clone(),
        ir: DisabledIr,
        watchdog: TimerWatchdog::new(settings.watchdog_kind),
        led: LogLed::default(),
        system: ProcessControl,
        console,
    };

    let (events, queue) = event_channel();
    let station = Arc::new(AtomicBool::new(false));

    {
        let station = station.clone();
        let settings = settings.clone();
        thread::Builder::new()
            .name("device-loop".into())
            .spawn(move || match Device::boot(board, queue, settings) {
                Ok(device) => {
                    station.store(
                        device.state().connectivity.mode == WifiMode::Station,
                        Ordering::Release,
                    );
                    device.run()
                }
                Err(err) => {
                    error!("boot failed: {err}");
                    process::exit(1)
                }
            })
            .context("failed to spawn device loop")?;
    }

    let web_state = WebState {
        fs,
        events,
        station,
        ota_password: Arc::new(settings.ota_password.clone()),
        firmware_path: Arc::new(data_dir.join("firmware.bin")),
    };

    let app = Router::new()
        .route("/update", post(handle_update))
        .layer(DefaultBodyLimit::max(MAX_FIRMWARE_BYTES))
        .fallback(handle_get)
        .with_state(web_state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web server at {addr}"))?;

    info!("web server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_settings(data_dir: &Path) -> anyhow::Result<FirmwareSettings> {
    let path = data_dir.join("settings.json");
    let mut settings = match std::fs::read(&path) {
        Ok(raw) => FirmwareSettings::from_json(&raw)
            .with_context(|| format!("invalid settings in {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => FirmwareSettings {
            http_port: HOST_HTTP_PORT,
            dns_port: HOST_DNS_PORT,
            ..FirmwareSettings::default()
        },
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    if let Some(port) = env_port("IRBLASTER_HTTP_PORT") {
        settings.http_port = port;
    }
    if let Some(port) = env_port("IRBLASTER_DNS_PORT") {
        settings.dns_port = port;
    }

    Ok(settings)
}

fn env_port(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

/// `ssid:rssi,ssid:rssi`. Entries that do not parse are skipped.
fn parse_scan_list(raw: &str) -> Vec<AccessPointCandidate> {
    raw.split(',')
        .filter_map(|entry| {
            let (ssid, rssi) = entry.trim().rsplit_once(':')?;
            let rssi = rssi.trim().parse::<i32>().ok()?;
            Some((ssid.to_string(), rssi))
        })
        .enumerate()
        .map(|(index, (ssid, rssi))| AccessPointCandidate {
            ssid,
            bssid: [0x02, 0, 0, 0, 0, index as u8],
            rssi,
        })
        .collect()
}

async fn handle_get(State(state): State<WebState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "GET only").into_response();
    }

    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |value| value.as_str());
    let routed = web::route(&HttpRequest::from_uri(target), &state.fs);
    for command in routed.commands {
        state.events.web(command);
    }
    into_response(routed.response)
}

async fn handle_update(
    State(state): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if !state.station.load(Ordering::Acquire) {
        return into_response(HttpResponse::Conflict(
            "Connect station WiFi before applying OTA updates".to_string(),
        ));
    }

    state.events.ota(OtaEvent::Started);
    match receive_image(&state, &params, &body) {
        Ok(digest) => {
            info!("firmware image accepted ({} bytes, sha256 {digest})", body.len());
            state.events.ota(OtaEvent::Finished);
            (StatusCode::OK, "Update OK, rebooting").into_response()
        }
        Err(err) => {
            state.events.ota(OtaEvent::Failed(err.clone()));
            let status = match err {
                OtaError::Auth => StatusCode::UNAUTHORIZED,
                _ => StatusCode::BAD_REQUEST,
            };
            (status, err.to_string()).into_response()
        }
    }
}

fn receive_image(
    state: &WebState,
    params: &HashMap<String, String>,
    body: &[u8],
) -> Result<String, OtaError> {
    ota::authorize(&state.ota_password, params.get("password").map(String::as_str))?;

    let mut upload = OtaUpload::begin(body.len(), params.get("sha256").map(String::as_str))?;
    for chunk in body.chunks(OTA_CHUNK_SIZE) {
        state.events.ota(upload.record(chunk));
    }
    let digest = upload.finish()?;

    std::fs::write(state.firmware_path.as_ref(), body).map_err(|err| {
        warn!("failed to store firmware image: {err}");
        OtaError::End
    })?;
    Ok(digest)
}

fn into_response(response: HttpResponse) -> Response {
    match response {
        HttpResponse::Redirect(location) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        HttpResponse::Asset {
            content_type,
            cache_control,
            body,
        } => {
            let mut response =
                (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response();
            if let Some(cache_control) = cache_control {
                response.headers_mut().insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static(cache_control),
                );
            }
            response
        }
        HttpResponse::NotFound(body) => (StatusCode::NOT_FOUND, body).into_response(),
        HttpResponse::Conflict(body) => (StatusCode::CONFLICT, body).into_response(),
    }
}

#[derive(Default)]
struct HostClock {
    synced: bool,
}

impl Clock for HostClock {
    fn uptime_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn wall_clock(&self) -> Option<DateTime<Utc>> {
        self.synced.then(Utc::now)
    }

    fn sync_network_time(&mut self, server: &str) -> HalResult<()> {
        info!("host clock stands in for NTP server {server}");
        self.synced = true;
        Ok(())
    }
}

/// Radio that "sees" the networks listed in `IRBLASTER_SCAN` and associates
/// instantly with any of them.
struct SimulatedRadio {
    scan: Vec<AccessPointCandidate>,
    joined: Option<AccessPointCandidate>,
    connected: bool,
}

impl SimulatedRadio {
    fn new(scan: Vec<AccessPointCandidate>) -> Self {
        Self {
            scan,
            joined: None,
            connected: false,
        }
    }
}

impl WifiRadio for SimulatedRadio {
    fn set_hostname(&mut self, hostname: &str) -> HalResult<()> {
        debug!("hostname set to {hostname}");
        Ok(())
    }

    fn scan(&mut self) -> HalResult<Vec<AccessPointCandidate>> {
        Ok(self.scan.clone())
    }

    fn begin_station(
        &mut self,
        ssid: &str,
        _password: Option<&str>,
        bssid: [u8; 6],
    ) -> HalResult<()> {
        self.joined = self
            .scan
            .iter()
            .find(|candidate| candidate.ssid == ssid && candidate.bssid == bssid)
            .cloned();
        self.connected = self.joined.is_some();
        Ok(())
    }

    fn is_station_connected(&self) -> bool {
        self.connected
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        self.connected.then_some(Ipv4Addr::LOCALHOST)
    }

    fn rssi(&self) -> Option<i32> {
        self.joined.as_ref().map(|candidate| candidate.rssi)
    }

    fn start_access_point(&mut self, ssid: &str) -> HalResult<Ipv4Addr> {
        info!("simulated open access point `{ssid}`");
        Ok(Ipv4Addr::LOCALHOST)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

struct DisabledIr;

impl IrTransceiver for DisabledIr {
    fn poll_capture(&mut self) -> Option<CaptureEvent> {
        None
    }

    fn pause_receive(&mut self) {}

    fn resume_receive(&mut self) {}

    fn send_raw(&mut self, durations_us: &[u16], _carrier_khz: u32) -> HalResult<()> {
        warn!("IR disabled, dropping frame with {} timings", durations_us.len());
        Ok(())
    }
}

enum WatchdogState {
    Countdown(Countdown),
    PingPong(PingPong),
}

/// Timer thread standing in for the hardware watchdog. Expiry ends the
/// process immediately.
struct TimerWatchdog {
    kind: WatchdogKind,
    state: Option<WatchdogState>,
}

impl TimerWatchdog {
    fn new(kind: WatchdogKind) -> Self {
        Self { kind, state: None }
    }
}

impl Watchdog for TimerWatchdog {
    fn arm(&mut self, timeout_s: u32) -> HalResult<()> {
        let spawned = match self.kind {
            WatchdogKind::Countdown => {
                let countdown = Countdown::new(timeout_s);
                countdown.arm(monotonic_ms());
                let timer = countdown.clone();
                self.state = Some(WatchdogState::Countdown(countdown));
                thread::Builder::new().name("watchdog".into()).spawn(move || loop {
                    thread::sleep(Duration::from_millis(COUNTDOWN_POLL_MS));
                    if timer.is_expired(monotonic_ms()) {
                        error!("watchdog expired, restarting");
                        process::exit(WATCHDOG_EXIT_CODE);
                    }
                })
            }
            WatchdogKind::PingPong => {
                let ping_pong = PingPong::new();
                let timer = ping_pong.clone();
                self.state = Some(WatchdogState::PingPong(ping_pong));
                let interval = Duration::from_secs(u64::from(timeout_s));
                thread::Builder::new().name("watchdog".into()).spawn(move || loop {
                    thread::sleep(interval);
                    match timer.on_expiry() {
                        Expiry::Ping => warn!("PING"),
                        Expiry::Restart => {
                            error!("watchdog missed two intervals, restarting");
                            process::exit(WATCHDOG_EXIT_CODE);
                        }
                    }
                })
            }
        };

        spawned
            .map(|_| ())
            .map_err(|err| HalError::Watchdog(format!("failed to spawn timer thread: {err}")))
    }

    fn refresh(&mut self) {
        match &self.state {
            Some(WatchdogState::Countdown(countdown)) => countdown.refresh(monotonic_ms()),
            Some(WatchdogState::PingPong(ping_pong)) => {
                if ping_pong.refresh() {
                    info!("PONG");
                }
            }
            None => {}
        }
    }
}

#[derive(Default)]
struct LogLed {
    on: bool,
}

impl StatusLed for LogLed {
    fn set(&mut self, on: bool) {
        if self.on != on {
            debug!("status led {}", if on { "on" } else { "off" });
            self.on = on;
        }
    }
}

struct ProcessControl;

impl SystemControl for ProcessControl {
    fn restart(&mut self) -> ! {
        info!("restarting (exit code {RESTART_EXIT_CODE})");
        let _ = std::io::stdout().flush();
        process::exit(RESTART_EXIT_CODE)
    }
}

/// Debug console on stdin. Bytes are read on a helper thread and drained
/// without blocking.
struct StdinConsole {
    rx: Receiver<u8>,
    open: bool,
}

impl StdinConsole {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("console-stdin".into())
            .spawn(move || {
                for byte in std::io::stdin().lock().bytes() {
                    let Ok(byte) = byte else {
                        break;
                    };
                    if tx.send(byte).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = spawned {
            warn!("console unavailable: {err}");
        }

        Self { rx, open: true }
    }
}

impl ConsoleIo for StdinConsole {
    fn read_byte(&mut self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(byte) => {
                if !self.open {
                    info!("console session reopened");
                    self.open = true;
                }
                Some(byte)
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }

    fn close_session(&mut self) {
        self.open = false;
        while self.rx.try_recv().is_ok() {}
        info!("console session closed");
    }
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
