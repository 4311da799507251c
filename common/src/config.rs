use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogKind {
    /// Countdown reset on every refresh; expiry restarts immediately.
    Countdown,
    /// Periodic timer that warns on the first missed interval and restarts on
    /// the second.
    PingPong,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IrHardwareConfig {
    pub tx_pin: i32,
    pub rx_pin: i32,
    pub carrier_khz: u32,
    pub capture_buffer: usize,
    pub capture_timeout_ms: u32,
    pub min_pulses: usize,
}

impl Default for IrHardwareConfig {
    fn default() -> Self {
        Self {
            tx_pin: 4,
            rx_pin: 14,
            carrier_khz: 38,
            capture_buffer: 1024,
            capture_timeout_ms: 15,
            min_pulses: 20,
        }
    }
}

impl IrHardwareConfig {
    pub fn sanitize(&mut self) {
        if self.tx_pin < 0 {
            self.tx_pin = 4;
        }

        if self.rx_pin < 0 {
            self.rx_pin = 14;
        }

        self.carrier_khz = self.carrier_khz.clamp(10, 100);
        self.capture_buffer = self.capture_buffer.clamp(64, 4096);
        self.capture_timeout_ms = self.capture_timeout_ms.clamp(5, 130);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareSettings {
    pub watchdog_timeout_s: u32,
    pub watchdog_kind: WatchdogKind,
    pub ap_idle_reboot_ms: u64,
    pub connect_attempts: u32,
    pub connect_poll_ms: u64,
    pub shutdown_delay_ms: u64,
    pub ntp_server: String,
    pub timezone: String,
    pub ota_password: String,
    pub http_port: u16,
    pub dns_port: u16,
    pub ir: IrHardwareConfig,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self {
            watchdog_timeout_s: 15,
            watchdog_kind: WatchdogKind::Countdown,
            ap_idle_reboot_ms: 300_000,
            connect_attempts: 120,
            connect_poll_ms: 300,
            shutdown_delay_ms: 1_000,
            ntp_server: "pool.ntp.org".to_string(),
            timezone: "America/New_York".to_string(),
            ota_password: String::new(),
            http_port: 80,
            dns_port: 53,
            ir: IrHardwareConfig::default(),
        }
    }
}

impl FirmwareSettings {
    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        let mut settings: Self = serde_json::from_slice(raw)?;
        settings.sanitize();
        Ok(settings)
    }

    pub fn sanitize(&mut self) {
        self.watchdog_timeout_s = self.watchdog_timeout_s.clamp(1, 120);
        self.connect_attempts = self.connect_attempts.max(1);
        self.connect_poll_ms = self.connect_poll_ms.clamp(10, 5_000);
        self.shutdown_delay_ms = self.shutdown_delay_ms.min(10_000);

        if self.ntp_server.trim().is_empty() {
            self.ntp_server = "pool.ntp.org".to_string();
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.timezone = "America/New_York".to_string();
        }

        self.ir.sanitize();
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.timezone
            .parse()
            .unwrap_or(chrono_tz::America::New_York)
    }
}
