use std::net::Ipv4Addr;

use log::{info, warn};

use crate::{
    config::FirmwareSettings,
    device_config::DeviceConfig,
    hal::{Board, Clock, HalResult, Platform, StatusLed, WifiRadio},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    AccessPoint,
    Station,
}

impl WifiMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessPoint => "AP",
            Self::Station => "STA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointCandidate {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub rssi: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDecision {
    pub mode: WifiMode,
    pub chosen: Option<AccessPointCandidate>,
    pub ip: Ipv4Addr,
}

/// Strongest candidate advertising exactly `ssid`. Ties keep the first one
/// seen in scan order.
pub fn select_best_candidate<'a>(
    ssid: &str,
    candidates: &'a [AccessPointCandidate],
) -> Option<&'a AccessPointCandidate> {
    let mut best: Option<&AccessPointCandidate> = None;

    for candidate in candidates {
        if candidate.ssid != ssid {
            continue;
        }

        if best.map_or(true, |current| candidate.rssi > current.rssi) {
            best = Some(candidate);
        }
    }

    best
}

pub fn format_bssid(bssid: &[u8; 6]) -> String {
    bssid
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Boot-time Wi-Fi bring-up: station mode against the best matching access
/// point, soft AP otherwise.
///
/// This blocks for up to `connect_attempts * connect_poll_ms` and must only run
/// before the watchdog is armed.
pub fn bring_up<P: Platform>(
    config: &DeviceConfig,
    settings: &FirmwareSettings,
    board: &mut Board<P>,
) -> HalResult<NetworkDecision> {
    let hostname = config.hostname();
    if let Err(err) = board.radio.set_hostname(hostname) {
        warn!("failed to set hostname `{hostname}`: {err}");
    }

    if let Some(ssid) = config.ssid() {
        if let Some(decision) = try_station(ssid, config, settings, board) {
            return Ok(decision);
        }
    } else {
        info!("no SSID configured; skipping station mode");
    }

    board.radio.disconnect();
    let ip = board.radio.start_access_point(hostname)?;
    info!("SoftAP [{hostname}] started on {ip}");

    Ok(NetworkDecision {
        mode: WifiMode::AccessPoint,
        chosen: None,
        ip,
    })
}

fn try_station<P: Platform>(
    ssid: &str,
    config: &DeviceConfig,
    settings: &FirmwareSettings,
    board: &mut Board<P>,
) -> Option<NetworkDecision> {
    info!("Scanning Wi-Fi networks. . .");
    let candidates = board.radio.scan().unwrap_or_else(|err| {
        warn!("wifi scan failed: {err}");
        Vec::new()
    });

    for candidate in &candidates {
        info!("   ssid: {} - rssi: {}", candidate.ssid, candidate.rssi);
    }

    let Some(best) = select_best_candidate(ssid, &candidates).cloned() else {
        warn!("configured SSID `{ssid}` not visible; falling back to AP mode");
        return None;
    };

    info!(
        "Connecting to {} / {} dB via {}",
        ssid,
        best.rssi,
        format_bssid(&best.bssid)
    );

    if let Err(err) = board
        .radio
        .begin_station(ssid, config.ssid_password(), best.bssid)
    {
        warn!("failed to start station association: {err}");
        return None;
    }

    let mut led_on = false;
    for _ in 0..settings.connect_attempts {
        if board.radio.is_station_connected() {
            break;
        }
        led_on = !led_on;
        board.led.set(led_on);
        board.clock.delay_ms(settings.connect_poll_ms);
    }
    board.led.set(false);

    if !board.radio.is_station_connected() {
        warn!(
            "association with `{ssid}` timed out after {} attempts",
            settings.connect_attempts
        );
        return None;
    }

    if let Err(err) = board.clock.sync_network_time(&settings.ntp_server) {
        warn!("network time sync unavailable, using uptime timestamps: {err}");
    }

    let ip = board.radio.station_ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
    info!("    Hostname: {}", config.hostname());
    info!("Connected to: {ssid}");
    info!("  IP address: {ip}");
    if let Some(rssi) = board.radio.rssi() {
        info!("        RSSI: {rssi} dB");
    }

    Some(NetworkDecision {
        mode: WifiMode::Station,
        chosen: Some(best),
        ip,
    })
}
