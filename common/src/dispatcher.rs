//! Cooperative main loop.
//!
//! [`Device`] owns the board, the application state and every collaborator.
//! One [`Device::tick`] runs to completion without blocking; the caller then
//! services the IR bridge and the watchdog.

use std::net::Ipv4Addr;

use chrono_tz::Tz;
use log::{info, warn};

use crate::{
    config::FirmwareSettings,
    console::{Console, ConsoleCommand, HELP},
    device_config::{self, DeviceConfig},
    dns::CaptiveDns,
    events::{DeviceEvent, EventSource, OtaEvent},
    hal::{
        Board, Clock, ConsoleIo, Filesystem, HalResult, IrTransceiver, Platform, SystemControl,
        Watchdog, WifiRadio,
    },
    ir_bridge::{format_durations, IrBridge, ReplayOutcome},
    network::{self, WifiMode},
    policy::{ConnectivityState, RebootPolicy, RebootReason},
    template::{self, SETUP_TEMPLATE},
    timestamp,
    web::WebCommand,
};

const LOOP_YIELD_MS: u64 = 2;
const OTA_PROGRESS_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart(RebootReason),
}

/// Everything the loop mutates besides the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppState {
    pub config: DeviceConfig,
    pub connectivity: ConnectivityState,
    pub ip: Ipv4Addr,
}

pub struct Device<P: Platform, E: EventSource> {
    board: Board<P>,
    events: E,
    settings: FirmwareSettings,
    timezone: Tz,
    state: AppState,
    policy: RebootPolicy,
    bridge: IrBridge,
    dns: Option<CaptiveDns>,
    console: Console,
    last_ota_progress_ms: Option<u64>,
}

impl<P: Platform, E: EventSource> Device<P, E> {
    /// Loads the config, brings the network up and arms the watchdog.
    ///
    /// Blocks for the whole association window; everything after this call
    /// must stay non-blocking.
    pub fn boot(mut board: Board<P>, events: E, settings: FirmwareSettings) -> HalResult<Self> {
        let config = device_config::load_or_default(&mut board.storage);
        let decision = network::bring_up(&config, &settings, &mut board)?;
        info!(
            "Wi-Fi mode {} at {}",
            decision.mode.as_str(),
            decision.ip
        );

        let dns = match decision.mode {
            WifiMode::AccessPoint => match CaptiveDns::bind(settings.dns_port, decision.ip) {
                Ok(dns) => Some(dns),
                Err(err) => {
                    warn!("captive DNS unavailable on port {}: {err}", settings.dns_port);
                    None
                }
            },
            WifiMode::Station => None,
        };

        board.watchdog.arm(settings.watchdog_timeout_s)?;
        info!("watchdog armed ({}s)", settings.watchdog_timeout_s);

        let mut device = Self {
            bridge: IrBridge::new(settings.ir.carrier_khz, settings.ir.capture_buffer),
            policy: RebootPolicy::new(settings.ap_idle_reboot_ms),
            timezone: settings.timezone(),
            state: AppState {
                config,
                connectivity: ConnectivityState::new(decision.mode),
                ip: decision.ip,
            },
            board,
            events,
            settings,
            dns,
            console: Console::new(),
            last_ota_progress_ms: None,
        };
        device.rebuild_template();
        device.board.ir.resume_receive();

        Ok(device)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn settings(&self) -> &FirmwareSettings {
        &self.settings
    }

    pub fn board(&self) -> &Board<P> {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board<P> {
        &mut self.board
    }

    pub fn dns_port(&self) -> Option<u16> {
        self.dns.as_ref().and_then(|dns| dns.local_port().ok())
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.service_console();

        if let Some(reason) = self.state.connectivity.reboot_requested() {
            return self.shutdown(reason);
        }

        self.service_events();
        match self.state.connectivity.mode {
            WifiMode::AccessPoint => {
                if let Some(dns) = &self.dns {
                    dns.process_next_request();
                }
            }
            WifiMode::Station => {
                if !self.state.connectivity.station_lost && !self.board.radio.is_station_connected()
                {
                    warn!("station disconnected");
                    self.state.connectivity.station_lost = true;
                }
            }
        }

        self.policy
            .evaluate(&mut self.state.connectivity, self.board.clock.uptime_ms());

        if self.state.connectivity.template_stale {
            self.rebuild_template();
            self.state.connectivity.template_stale = false;
        }

        TickOutcome::Continue
    }

    pub fn service_ir(&mut self) {
        let Some(capture) = self.board.ir.poll_capture() else {
            return;
        };
        let stamp = self.timestamp();
        if let Err(err) = self.bridge.record(&self.board.fs, capture, &stamp) {
            warn!("failed to persist capture: {err}");
        }
    }

    pub fn refresh_watchdog(&mut self) {
        self.board.watchdog.refresh();
    }

    pub fn run(mut self) -> ! {
        loop {
            if let TickOutcome::Restart(_) = self.tick() {
                self.board.system.restart();
            }
            self.service_ir();
            self.refresh_watchdog();
            self.board.clock.delay_ms(LOOP_YIELD_MS);
        }
    }

    pub fn timestamp(&self) -> String {
        timestamp::timestamp(
            self.state.connectivity.mode,
            self.board.clock.wall_clock(),
            self.timezone,
            self.board.clock.uptime_ms(),
        )
    }

    fn shutdown(&mut self, reason: RebootReason) -> TickOutcome {
        self.service_events();
        info!("Reboot triggered: {reason}");
        log::logger().flush();
        self.board.clock.delay_ms(self.settings.shutdown_delay_ms);
        TickOutcome::Restart(reason)
    }

    fn service_events(&mut self) {
        for event in self.events.pending_events() {
            match event {
                DeviceEvent::Web(command) => self.handle_web(command),
                DeviceEvent::Ota(event) => self.handle_ota(event),
            }
        }
    }

    fn handle_web(&mut self, command: WebCommand) {
        match command {
            WebCommand::Activity => self.state.connectivity.ap_activity = true,
            WebCommand::Reboot => self
                .state
                .connectivity
                .request_reboot(RebootReason::UserRequest),
            WebCommand::Save {
                hostname,
                ssid,
                ssid_pwd,
            } => self.store_config(DeviceConfig::new(&hostname, &ssid, &ssid_pwd)),
            WebCommand::Load => self.reload_config(),
            WebCommand::Wipe { reboot } => {
                self.wipe_config();
                if reboot {
                    self.state
                        .connectivity
                        .request_reboot(RebootReason::ConfigWiped);
                }
            }
        }
    }

    fn handle_ota(&mut self, event: OtaEvent) {
        match event {
            OtaEvent::Started => {
                self.last_ota_progress_ms = None;
                info!("OTA Start");
            }
            OtaEvent::Progress { written, total } => {
                let now = self.board.clock.uptime_ms();
                let due = self
                    .last_ota_progress_ms
                    .map_or(true, |last| now.saturating_sub(last) >= OTA_PROGRESS_INTERVAL_MS);
                if due {
                    self.last_ota_progress_ms = Some(now);
                    let percent = if total == 0 {
                        0
                    } else {
                        written.saturating_mul(100) / total
                    };
                    info!("OTA Progress: {percent}% ({written}/{total})");
                }
            }
            OtaEvent::Finished => {
                info!("OTA End");
                self.state
                    .connectivity
                    .request_reboot(RebootReason::OtaComplete);
            }
            OtaEvent::Failed(err) => warn!("OTA Error: {err}"),
        }
    }

    fn store_config(&mut self, config: DeviceConfig) {
        if let Err(err) = device_config::save(&mut self.board.storage, &config) {
            warn!("failed to persist config: {err}");
        }
        self.state.config = config;
        self.state.connectivity.template_stale = true;
    }

    fn reload_config(&mut self) {
        match device_config::load(&mut self.board.storage) {
            Ok(config) => self.state.config = config,
            Err(err) => warn!("failed to reload config, keeping current: {err}"),
        }
        self.state.connectivity.template_stale = true;
    }

    fn wipe_config(&mut self) {
        if let Err(err) = device_config::wipe(&mut self.board.storage) {
            warn!("failed to wipe config storage: {err}");
        }
        self.state.config = DeviceConfig::default();
        self.state.connectivity.template_stale = true;
    }

    fn rebuild_template(&mut self) {
        let stamp = self.timestamp();
        match template::rebuild(&self.board.fs, SETUP_TEMPLATE, &self.state.config, &stamp) {
            Ok(_) => {}
            Err(err) => warn!("failed to rebuild setup page: {err}"),
        }
    }

    fn service_console(&mut self) {
        let Some(io) = self.board.console.as_mut() else {
            return;
        };
        for command in self.console.poll(io) {
            self.execute(command);
        }
    }

    fn say(&mut self, text: &str) {
        if let Some(io) = self.board.console.as_mut() {
            io.write_str(text);
        }
    }

    fn execute(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::TransmitLast => {
                match self.bridge.replay(&self.board.fs, &mut self.board.ir) {
                    ReplayOutcome::Sent(durations) => {
                        self.say(&format!("IRsend: {}\n", format_durations(&durations)));
                    }
                    ReplayOutcome::NothingToTransmit => self.say("Nothing to transmit\n"),
                    ReplayOutcome::Failed(err) => self.say(&format!("IRsend failed: {err}\n")),
                }
            }
            ConsoleCommand::ShowHistory => match self.bridge.history(&self.board.fs) {
                Some(history) if !history.is_empty() => {
                    self.say(&format!("\nSignal History\n\n{history}\n"));
                }
                _ => self.say("No signal history available\n"),
            },
            ConsoleCommand::ShowTimestamp => {
                let stamp = self.timestamp();
                self.say(&format!("Current timestamp: [{stamp}]\n"));
            }
            ConsoleCommand::DisconnectWifi => {
                self.say("\nDisconnecting Wi-Fi. . .\n");
                self.board.radio.disconnect();
            }
            ConsoleCommand::FilesystemInfo => match self.board.fs.info() {
                Ok(info) => {
                    let size_kb = info.total_bytes / 1_000;
                    let free_kb = size_kb.saturating_sub(info.used_bytes / 1_000);
                    self.say(&format!(
                        "\n    Filesystem size: [{size_kb}] KB\n         Free space: [{free_kb}] KB\n\n"
                    ));
                }
                Err(err) => self.say(&format!("Filesystem info unavailable: {err}\n")),
            },
            ConsoleCommand::SetCredentials { ssid, password } => {
                let config = self.state.config.with_credentials(&ssid, &password);
                match device_config::save(&mut self.board.storage, &config) {
                    Ok(()) => self.say("SSID and Password saved - reload config or reboot\n\n"),
                    Err(err) => self.say(&format!("Saving credentials failed: {err}\n")),
                }
                self.state.config = config;
            }
            ConsoleCommand::ReloadConfig => self.reload_config(),
            ConsoleCommand::WipeConfig => self.wipe_config(),
            ConsoleCommand::CloseSession => {
                self.say("\r\nClosing session...\r\n");
                if let Some(io) = self.board.console.as_mut() {
                    io.close_session();
                }
            }
            ConsoleCommand::Reboot => {
                self.say("\r\nsubmitting reboot request...\r\n");
                self.state
                    .connectivity
                    .request_reboot(RebootReason::UserRequest);
            }
            ConsoleCommand::Help => self.say(HELP),
        }
    }
}
