use std::fmt;

use log::info;

use crate::network::WifiMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    LostConnectivity,
    OtaComplete,
    ApIdle,
    UserRequest,
    ConfigWiped,
}

impl fmt::Display for RebootReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LostConnectivity => "station connectivity lost",
            Self::OtaComplete => "OTA update complete",
            Self::ApIdle => "access point idle",
            Self::UserRequest => "user request",
            Self::ConfigWiped => "config wiped",
        };
        f.write_str(text)
    }
}

/// Transient connectivity flags owned by the dispatcher.
///
/// Writers: bring-up sets `mode`; the loop sets `station_lost`; web events set
/// `ap_activity`, `template_stale` and the reboot request. Nothing else writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityState {
    pub mode: WifiMode,
    pub station_lost: bool,
    pub ap_activity: bool,
    pub template_stale: bool,
    reboot: Option<RebootReason>,
}

impl ConnectivityState {
    pub fn new(mode: WifiMode) -> Self {
        Self {
            mode,
            station_lost: false,
            ap_activity: false,
            template_stale: false,
            reboot: None,
        }
    }

    /// Keeps the first reason if a reboot is already pending.
    pub fn request_reboot(&mut self, reason: RebootReason) {
        if self.reboot.is_none() {
            info!("reboot requested: {reason}");
            self.reboot = Some(reason);
        }
    }

    pub fn reboot_requested(&self) -> Option<RebootReason> {
        self.reboot
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RebootPolicy {
    ap_idle_reboot_ms: u64,
}

impl RebootPolicy {
    pub fn new(ap_idle_reboot_ms: u64) -> Self {
        Self { ap_idle_reboot_ms }
    }

    pub fn decide(&self, state: &ConnectivityState, uptime_ms: u64) -> Option<RebootReason> {
        match state.mode {
            WifiMode::Station if state.station_lost => Some(RebootReason::LostConnectivity),
            WifiMode::AccessPoint
                if !state.ap_activity && uptime_ms >= self.ap_idle_reboot_ms =>
            {
                Some(RebootReason::ApIdle)
            }
            _ => None,
        }
    }

    pub fn evaluate(&self, state: &mut ConnectivityState, uptime_ms: u64) {
        if let Some(reason) = self.decide(state, uptime_ms) {
            state.request_reboot(reason);
        }
    }
}
