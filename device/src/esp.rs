use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, Utc};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::NON_BLOCK,
    gpio::{AnyIOPin, AnyInputPin, AnyOutputPin, Output, PinDriver},
    uart::{config::Config as UartConfig, UartDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sntp::{EspSntp, SntpConf},
    wifi::EspWifi,
};
use log::{info, warn};

use irblaster_common::{
    device_config,
    event_channel,
    hal::{
        Clock, ConfigStorage, ConsoleIo, Filesystem, FsInfo, HalError, HalResult, StatusLed,
        SystemControl, Watchdog, WifiRadio,
    },
    storage::DirFs,
    web::{self, HttpRequest, HttpResponse},
    AccessPointCandidate, Board, Device, EventSender, FirmwareSettings, OtaError, OtaEvent,
    Platform, WifiMode,
};

use crate::{
    assets,
    ir::RmtIr,
    ota::{self, OtaUpload, OTA_CHUNK_SIZE},
};

const NVS_NAMESPACE: &str = "irblaster";
const NVS_CONFIG_KEY: &str = "config";
const SPIFFS_BASE_PATH: &core::ffi::CStr = c"/spiffs";
const SPIFFS_ROOT: &str = "/spiffs";
const SPIFFS_MAX_FILES: usize = 5;
const STATUS_LED_PIN: i32 = 2;
const CONSOLE_BAUD: u32 = 115_200;
const TIME_VALID_FROM_YEAR: i32 = 2023;

struct EspPlatform;

impl Platform for EspPlatform {
    type Clock = EspClock;
    type Radio = EspRadio;
    type Storage = NvsRegion;
    type Fs = SpiffsFs;
    type Ir = RmtIr;
    type Watchdog = TaskWatchdog;
    type Led = GpioLed;
    type System = EspSystem;
    type Console = UartConsole;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;

    let mut settings = FirmwareSettings::default();
    if let Some(password) = option_env!("OTA_PASSWORD") {
        settings.ota_password = password.to_string();
    }
    settings.sanitize();

    mount_spiffs().context("failed to mount SPIFFS")?;
    let fs = SpiffsFs::new();
    match assets::seed(&fs) {
        Ok(0) => {}
        Ok(seeded) => info!("seeded {seeded} web assets"),
        Err(err) => warn!("failed to seed web assets: {err}"),
    }

    let mut storage = NvsRegion {
        partition: nvs_partition.clone(),
    };
    seed_wifi_defaults(&mut storage);

    let ir = match unsafe {
        RmtIr::new(
            peripherals.rmt.channel0,
            AnyOutputPin::new(settings.ir.tx_pin),
            peripherals.rmt.channel4,
            AnyInputPin::new(settings.ir.rx_pin),
            &settings.ir,
        )
    } {
        Ok(ir) => ir,
        Err(err) => {
            warn!("failed to initialize IR, running disabled: {err:#}");
            RmtIr::disabled(&settings.ir)
        }
    };

    let console = if cfg!(feature = "debug-console") {
        match UartConsole::new(
            peripherals.uart0,
            peripherals.pins.gpio1,
            peripherals.pins.gpio3,
        ) {
            Ok(console) => Some(console),
            Err(err) => {
                warn!("debug console unavailable: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))
        .context("failed to create wifi driver")?;

    let board = Board::<EspPlatform> {
        clock: EspClock::default(),
        radio: EspRadio { wifi },
        storage,
        fs: fs.clone(),
        ir,
        watchdog: TaskWatchdog,
        led: GpioLed::new(STATUS_LED_PIN),
        system: EspSystem,
        console,
    };

    let (events, queue) = event_channel();
    let http_port = settings.http_port;
    let ota_password = settings.ota_password.clone();

    let device = Device::boot(board, queue, settings).context("boot failed")?;
    let station = Arc::new(AtomicBool::new(
        device.state().connectivity.mode == WifiMode::Station,
    ));

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    // Kept alive for the program lifetime; `run` never returns.
    let _server = create_http_server(http_port, fs, events, station, ota_password)?;

    device.run()
}

fn seed_wifi_defaults(storage: &mut NvsRegion) {
    let (Some(ssid), pass) = (option_env!("WIFI_SSID"), option_env!("WIFI_PASS")) else {
        return;
    };

    let config = device_config::load_or_default(storage);
    if config.ssid().is_some() {
        return;
    }

    let seeded = config.with_credentials(ssid, pass.unwrap_or_default());
    match device_config::save(storage, &seeded) {
        Ok(()) => info!("seeded build-time wifi credentials for `{ssid}`"),
        Err(err) => warn!("failed to seed wifi credentials: {err}"),
    }
}

fn create_http_server(
    port: u16,
    fs: SpiffsFs,
    events: EventSender,
    station: Arc<AtomicBool>,
    ota_password: String,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let events = events.clone();
        server.fn_handler::<anyhow::Error, _>("/update", Method::Post, move |mut req| {
            if !station.load(Ordering::Acquire) {
                return write_response(
                    req,
                    HttpResponse::Conflict(
                        "Connect station WiFi before applying OTA updates".to_string(),
                    ),
                );
            }

            let query = req
                .uri()
                .split_once('?')
                .map(|(_, query)| query.to_string())
                .unwrap_or_default();

            events.ota(OtaEvent::Started);
            match flash_upload(&mut req, &events, &query, &ota_password) {
                Ok(digest) => {
                    info!("firmware image accepted (sha256 {digest})");
                    events.ota(OtaEvent::Finished);
                    req.into_ok_response()?.write_all(b"Update OK, rebooting")?;
                }
                Err(err) => {
                    events.ota(OtaEvent::Failed(err.clone()));
                    let status = match err {
                        OtaError::Auth => 401,
                        _ => 400,
                    };
                    req.into_response(status, None, &[("Content-Type", "text/plain")])?
                        .write_all(err.to_string().as_bytes())?;
                }
            }
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        let routed = web::route(&HttpRequest::from_uri(req.uri()), &fs);
        for command in routed.commands {
            events.web(command);
        }
        write_response(req, routed.response)
    })?;

    info!("web server listening on port {port}");
    Ok(server)
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: HttpResponse,
) -> anyhow::Result<()> {
    let status = response.status();
    match response {
        HttpResponse::Redirect(location) => {
            req.into_response(status, None, &[("Location", location)])?;
        }
        HttpResponse::Asset {
            content_type,
            cache_control,
            body,
        } => {
            let mut headers = vec![("Content-Type", content_type)];
            if let Some(cache_control) = cache_control {
                headers.push(("Cache-Control", cache_control));
            }
            req.into_response(status, None, &headers)?
                .write_all(&body)?;
        }
        HttpResponse::NotFound(body) | HttpResponse::Conflict(body) => {
            req.into_response(status, None, &[("Content-Type", "text/plain")])?
                .write_all(body.as_bytes())?;
        }
    }
    Ok(())
}

fn flash_upload(
    req: &mut Request<&mut EspHttpConnection<'_>>,
    events: &EventSender,
    query: &str,
    ota_password: &str,
) -> Result<String, OtaError> {
    ota::authorize(ota_password, web::query_param(query, "password").as_deref())?;

    let total = req.content_len().unwrap_or(0) as usize;
    let mut upload = OtaUpload::begin(total, web::query_param(query, "sha256").as_deref())?;

    let mut esp_ota = EspOta::new().map_err(|err| {
        warn!("failed to acquire OTA: {err:?}");
        OtaError::Begin
    })?;
    let mut update = esp_ota.initiate_update().map_err(|err| {
        warn!("failed to initiate OTA update: {err:?}");
        OtaError::Begin
    })?;

    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];
    while upload.written() < total {
        let read = match req.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!("OTA body read failed: {err:?}");
                let _ = update.abort();
                return Err(OtaError::Receive);
            }
        };

        if let Err(err) = update.write(&chunk[..read]) {
            warn!("failed writing OTA data: {err:?}");
            let _ = update.abort();
            return Err(OtaError::Receive);
        }
        events.ota(upload.record(&chunk[..read]));
    }

    match upload.finish() {
        Ok(digest) => {
            update.complete().map_err(|err| {
                warn!("failed finalizing OTA image: {err:?}");
                OtaError::End
            })?;
            Ok(digest)
        }
        Err(err) => {
            let _ = update.abort();
            Err(err)
        }
    }
}

#[derive(Default)]
struct EspClock {
    sntp: Option<EspSntp<'static>>,
}

impl Clock for EspClock {
    fn uptime_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn wall_clock(&self) -> Option<DateTime<Utc>> {
        self.sntp.as_ref()?;
        let now = Utc::now();
        (now.year() >= TIME_VALID_FROM_YEAR).then_some(now)
    }

    fn sync_network_time(&mut self, server: &str) -> HalResult<()> {
        let mut conf = SntpConf::default();
        conf.servers[0] = server;
        let sntp =
            EspSntp::new(&conf).map_err(|err| HalError::Wifi(format!("failed to start SNTP: {err}")))?;
        info!("SNTP started against {server}");
        self.sntp = Some(sntp);
        Ok(())
    }
}

struct EspRadio {
    wifi: EspWifi<'static>,
}

impl EspRadio {
    fn ensure_station_started(&mut self) -> HalResult<()> {
        if self.wifi.is_started().map_err(wifi_error)? {
            return Ok(());
        }
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(wifi_error)?;
        self.wifi.start().map_err(wifi_error)
    }
}

impl WifiRadio for EspRadio {
    fn set_hostname(&mut self, hostname: &str) -> HalResult<()> {
        self.wifi
            .sta_netif_mut()
            .set_hostname(hostname)
            .map_err(wifi_error)
    }

    fn scan(&mut self) -> HalResult<Vec<AccessPointCandidate>> {
        self.ensure_station_started()?;
        let found = self.wifi.scan().map_err(wifi_error)?;
        Ok(found
            .into_iter()
            .map(|ap| AccessPointCandidate {
                ssid: ap.ssid.as_str().to_string(),
                bssid: ap.bssid,
                rssi: i32::from(ap.signal_strength),
            })
            .collect())
    }

    fn begin_station(
        &mut self,
        ssid: &str,
        password: Option<&str>,
        bssid: [u8; 6],
    ) -> HalResult<()> {
        let password = password.unwrap_or_default();
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| HalError::Wifi("wifi ssid too long".to_string()))?,
                password: password
                    .try_into()
                    .map_err(|_| HalError::Wifi("wifi password too long".to_string()))?,
                bssid: Some(bssid),
                auth_method,
                ..Default::default()
            }))
            .map_err(wifi_error)?;
        self.ensure_station_started()?;
        self.wifi.connect().map_err(wifi_error)
    }

    fn is_station_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn rssi(&self) -> Option<i32> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(i32::from(ap_info.rssi))
    }

    fn start_access_point(&mut self, ssid: &str) -> HalResult<Ipv4Addr> {
        let _ = self.wifi.stop();
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| HalError::Wifi("access point SSID too long".to_string()))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))
            .map_err(wifi_error)?;
        self.wifi.start().map_err(wifi_error)?;

        let ip = self
            .wifi
            .ap_netif()
            .get_ip_info()
            .map_err(wifi_error)?
            .ip;
        info!("open access point `{ssid}` up at {ip}");
        Ok(ip)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }
}

fn wifi_error(err: esp_idf_svc::sys::EspError) -> HalError {
    HalError::Wifi(err.to_string())
}

/// The config record as one NVS blob. Every access opens the namespace anew.
struct NvsRegion {
    partition: EspDefaultNvsPartition,
}

impl NvsRegion {
    fn open(&self) -> HalResult<EspNvs<NvsDefault>> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| HalError::Storage(format!("open nvs: {err}")))
    }
}

impl ConfigStorage for NvsRegion {
    fn read_region(&mut self, buf: &mut [u8]) -> HalResult<()> {
        let nvs = self.open()?;
        let mut raw = vec![0_u8; buf.len()];
        buf.fill(0xFF);
        match nvs.get_blob(NVS_CONFIG_KEY, &mut raw) {
            Ok(Some(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => Err(HalError::Storage(format!("read blob: {err}"))),
        }
    }

    fn write_region(&mut self, data: &[u8]) -> HalResult<()> {
        self.open()?
            .set_blob(NVS_CONFIG_KEY, data)
            .map_err(|err| HalError::Storage(format!("write blob: {err}")))
    }
}

/// SPIFFS through the VFS layer. Capacity comes from the partition itself.
#[derive(Clone)]
struct SpiffsFs {
    inner: DirFs,
}

impl SpiffsFs {
    fn new() -> Self {
        Self {
            inner: DirFs::new(SPIFFS_ROOT, 0),
        }
    }
}

impl Filesystem for SpiffsFs {
    fn read(&self, path: &str) -> HalResult<Vec<u8>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, data: &[u8]) -> HalResult<()> {
        self.inner.write(path, data)
    }

    fn append(&self, path: &str, data: &[u8]) -> HalResult<()> {
        self.inner.append(path, data)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn remove(&self, path: &str) -> HalResult<()> {
        self.inner.remove(path)
    }

    fn rename(&self, from: &str, to: &str) -> HalResult<()> {
        self.inner.rename(from, to)
    }

    fn info(&self) -> HalResult<FsInfo> {
        let mut total = 0_usize;
        let mut used = 0_usize;
        let rc = unsafe {
            esp_idf_svc::sys::esp_spiffs_info(core::ptr::null(), &mut total, &mut used)
        };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(HalError::Storage(format!("esp_spiffs_info failed with code {rc}")));
        }
        Ok(FsInfo {
            total_bytes: total as u64,
            used_bytes: used as u64,
        })
    }
}

fn mount_spiffs() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: SPIFFS_BASE_PATH.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

struct TaskWatchdog;

impl Watchdog for TaskWatchdog {
    fn arm(&mut self, timeout_s: u32) -> HalResult<()> {
        init_watchdog(timeout_s)?;
        add_current_task_to_watchdog()
    }

    fn refresh(&mut self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

fn init_watchdog(timeout_sec: u32) -> HalResult<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        // Already initialized by the IDF startup code; apply our timeout.
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        return Err(HalError::Watchdog(format!(
            "esp_task_wdt_reconfigure failed with code {rc}"
        )));
    }
    Err(HalError::Watchdog(format!(
        "esp_task_wdt_init failed with code {rc}"
    )))
}

fn add_current_task_to_watchdog() -> HalResult<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(HalError::Watchdog(format!(
        "esp_task_wdt_add failed with code {rc}"
    )))
}

struct GpioLed {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl GpioLed {
    fn new(pin: i32) -> Self {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
        match driver {
            Ok(mut driver) => {
                let _ = driver.set_low();
                Self { pin: Some(driver) }
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{pin}: {err}");
                Self { pin: None }
            }
        }
    }
}

impl StatusLed for GpioLed {
    fn set(&mut self, on: bool) {
        let Some(pin) = self.pin.as_mut() else {
            return;
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        }
    }
}

struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) -> ! {
        esp_idf_svc::hal::reset::restart()
    }
}

/// Debug console on UART0, polled without blocking.
struct UartConsole {
    uart: UartDriver<'static>,
    open: bool,
}

impl UartConsole {
    fn new(
        uart: esp_idf_hal::uart::UART0,
        tx: esp_idf_hal::gpio::Gpio1,
        rx: esp_idf_hal::gpio::Gpio3,
    ) -> anyhow::Result<Self> {
        let config = UartConfig::default().baudrate(Hertz(CONSOLE_BAUD));
        let uart = UartDriver::new(
            uart,
            tx,
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &config,
        )
        .context("failed to init console UART")?;
        Ok(Self { uart, open: true })
    }
}

impl ConsoleIo for UartConsole {
    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0_u8; 1];
        match self.uart.read(&mut byte, NON_BLOCK) {
            Ok(1) => {
                self.open = true;
                Some(byte[0])
            }
            _ => None,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        if !self.open {
            return;
        }
        if let Err(err) = self.uart.write(bytes) {
            warn!("console write failed: {err}");
        }
    }

    fn close_session(&mut self) {
        self.open = false;
        let _ = self.uart.clear_rx();
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
