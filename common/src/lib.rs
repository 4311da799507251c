pub mod config;
pub mod console;
pub mod device_config;
pub mod dispatcher;
pub mod dns;
pub mod events;
pub mod hal;
pub mod ir_bridge;
pub mod network;
pub mod policy;
pub mod storage;
pub mod template;
pub mod timestamp;
pub mod watchdog;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{FirmwareSettings, IrHardwareConfig, WatchdogKind};
pub use device_config::{DeviceConfig, DEFAULT_HOSTNAME};
pub use dispatcher::{AppState, Device, TickOutcome};
pub use events::{event_channel, DeviceEvent, EventQueue, EventSender, EventSource, OtaError, OtaEvent};
pub use hal::{Board, HalError, HalResult, Platform};
pub use ir_bridge::{CaptureEvent, IrBridge, ReplayOutcome};
pub use network::{AccessPointCandidate, NetworkDecision, WifiMode};
pub use policy::{ConnectivityState, RebootPolicy, RebootReason};
pub use web::{HttpRequest, HttpResponse, Routed, WebCommand};
