//! Hardware abstraction seams.
//!
//! Each backend (ESP-IDF, host simulator) provides one [`Platform`] whose
//! associated types implement these traits. The dispatcher only ever talks to
//! a [`Board`], so the cooperative loop is identical on every target.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{ir_bridge::CaptureEvent, network::AccessPointCandidate};

#[derive(Debug, Error)]
pub enum HalError {
    #[error("config storage: {0}")]
    Storage(String),
    #[error("filesystem `{path}`: {source}")]
    Fs {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("wifi: {0}")]
    Wifi(String),
    #[error("ir: {0}")]
    Ir(String),
    #[error("watchdog: {0}")]
    Watchdog(String),
}

impl HalError {
    pub fn fs(path: &str, source: std::io::Error) -> Self {
        Self::Fs {
            path: path.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fs { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type HalResult<T> = Result<T, HalError>;

pub trait Clock {
    /// Milliseconds since boot.
    fn uptime_ms(&self) -> u64;

    fn delay_ms(&mut self, ms: u64);

    /// Wall-clock time, `None` until network time has been synchronized.
    fn wall_clock(&self) -> Option<DateTime<Utc>>;

    /// Starts network time synchronization. Completion is observed through
    /// [`Clock::wall_clock`].
    fn sync_network_time(&mut self, server: &str) -> HalResult<()>;
}

pub trait WifiRadio {
    fn set_hostname(&mut self, hostname: &str) -> HalResult<()>;

    /// Blocking scan. Only called during boot.
    fn scan(&mut self) -> HalResult<Vec<AccessPointCandidate>>;

    /// Starts association with one specific access point. Does not wait.
    fn begin_station(
        &mut self,
        ssid: &str,
        password: Option<&str>,
        bssid: [u8; 6],
    ) -> HalResult<()>;

    fn is_station_connected(&self) -> bool;

    fn station_ip(&self) -> Option<Ipv4Addr>;

    fn rssi(&self) -> Option<i32>;

    /// Brings up an open soft AP and returns the device's own address on it.
    fn start_access_point(&mut self, ssid: &str) -> HalResult<Ipv4Addr>;

    fn disconnect(&mut self);
}

/// Fixed-size non-volatile region holding the device config record.
///
/// Every call is a full open/write/commit/close cycle.
pub trait ConfigStorage {
    fn read_region(&mut self, buf: &mut [u8]) -> HalResult<()>;

    fn write_region(&mut self, data: &[u8]) -> HalResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl FsInfo {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Flat flash filesystem addressed by absolute paths such as `/signals.txt`.
pub trait Filesystem {
    fn read(&self, path: &str) -> HalResult<Vec<u8>>;

    fn write(&self, path: &str, data: &[u8]) -> HalResult<()>;

    fn append(&self, path: &str, data: &[u8]) -> HalResult<()>;

    fn exists(&self, path: &str) -> bool;

    fn remove(&self, path: &str) -> HalResult<()>;

    fn rename(&self, from: &str, to: &str) -> HalResult<()>;

    fn info(&self) -> HalResult<FsInfo>;
}

/// The external IR decode/encode capability.
pub trait IrTransceiver {
    /// Returns a completed capture if one is waiting. Never blocks.
    fn poll_capture(&mut self) -> Option<CaptureEvent>;

    fn pause_receive(&mut self);

    fn resume_receive(&mut self);

    fn send_raw(&mut self, durations_us: &[u16], carrier_khz: u32) -> HalResult<()>;
}

pub trait Watchdog {
    fn arm(&mut self, timeout_s: u32) -> HalResult<()>;

    fn refresh(&mut self);
}

pub trait StatusLed {
    fn set(&mut self, on: bool);
}

pub trait SystemControl {
    fn restart(&mut self) -> !;
}

/// Serial/telnet style text channel for the debug console.
pub trait ConsoleIo {
    fn read_byte(&mut self) -> Option<u8>;

    /// Writes raw bytes, so echoed input reaches the terminal unchanged.
    fn write_bytes(&mut self, bytes: &[u8]);

    fn write_str(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }

    fn close_session(&mut self);
}

pub trait Platform {
    type Clock: Clock;
    type Radio: WifiRadio;
    type Storage: ConfigStorage;
    type Fs: Filesystem;
    type Ir: IrTransceiver;
    type Watchdog: Watchdog;
    type Led: StatusLed;
    type System: SystemControl;
    type Console: ConsoleIo;
}

pub struct Board<P: Platform> {
    pub clock: P::Clock,
    pub radio: P::Radio,
    pub storage: P::Storage,
    pub fs: P::Fs,
    pub ir: P::Ir,
    pub watchdog: P::Watchdog,
    pub led: P::Led,
    pub system: P::System,
    /// Present only in builds with the debug console enabled.
    pub console: Option<P::Console>,
}
