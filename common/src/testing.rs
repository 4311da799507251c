//! In-memory doubles for every HAL seam, shared by the unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    net::Ipv4Addr,
};

use chrono::{DateTime, TimeZone, Utc};

use crate::{
    device_config::REGION_SIZE,
    hal::{
        Board, Clock, ConfigStorage, ConsoleIo, Filesystem, FsInfo, HalError, HalResult,
        IrTransceiver, Platform, StatusLed, SystemControl, Watchdog, WifiRadio,
    },
    ir_bridge::CaptureEvent,
    network::AccessPointCandidate,
};

pub fn candidate(ssid: &str, rssi: i32, last_octet: u8) -> AccessPointCandidate {
    AccessPointCandidate {
        ssid: ssid.to_string(),
        bssid: [0, 0, 0, 0, 0, last_octet],
        rssi,
    }
}

pub fn capture(durations: &[u16]) -> CaptureEvent {
    CaptureEvent {
        durations: durations.to_vec(),
        repeat: false,
        overflow: false,
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: u64,
    synced_with: Option<String>,
    fail_sync: bool,
}

impl ManualClock {
    pub fn now(&self) -> u64 {
        self.now_ms
    }

    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    pub fn synced_with(&self) -> Option<String> {
        self.synced_with.clone()
    }

    pub fn fail_time_sync(&mut self) {
        self.fail_sync = true;
    }
}

impl Clock for ManualClock {
    fn uptime_ms(&self) -> u64 {
        self.now_ms
    }

    fn delay_ms(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    fn wall_clock(&self) -> Option<DateTime<Utc>> {
        self.synced_with.as_ref()?;
        let base = Utc.with_ymd_and_hms(2024, 7, 4, 16, 30, 0).single()?;
        Some(base + chrono::Duration::milliseconds(self.now_ms as i64))
    }

    fn sync_network_time(&mut self, server: &str) -> HalResult<()> {
        if self.fail_sync {
            return Err(HalError::Wifi("ntp unreachable".to_string()));
        }
        self.synced_with = Some(server.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedRadio {
    hostname: Option<String>,
    scan_results: Vec<AccessPointCandidate>,
    scans: u32,
    joined: Option<(String, Option<String>, [u8; 6])>,
    connect_after: Option<u32>,
    polls: Cell<u32>,
    link_lost: bool,
    access_point: Option<String>,
}

impl ScriptedRadio {
    pub fn set_scan(&mut self, results: Vec<AccessPointCandidate>) {
        self.scan_results = results;
    }

    /// Association succeeds on the poll after `polls` unsuccessful ones.
    pub fn connect_after_polls(&mut self, polls: u32) {
        self.connect_after = Some(polls);
    }

    pub fn drop_link(&mut self) {
        self.link_lost = true;
    }

    pub fn scans(&self) -> u32 {
        self.scans
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn joined(&self) -> Option<(String, Option<String>, [u8; 6])> {
        self.joined.clone()
    }

    pub fn access_point_ssid(&self) -> Option<String> {
        self.access_point.clone()
    }
}

impl WifiRadio for ScriptedRadio {
    fn set_hostname(&mut self, hostname: &str) -> HalResult<()> {
        self.hostname = Some(hostname.to_string());
        Ok(())
    }

    fn scan(&mut self) -> HalResult<Vec<AccessPointCandidate>> {
        self.scans += 1;
        Ok(self.scan_results.clone())
    }

    fn begin_station(
        &mut self,
        ssid: &str,
        password: Option<&str>,
        bssid: [u8; 6],
    ) -> HalResult<()> {
        self.joined = Some((ssid.to_string(), password.map(str::to_string), bssid));
        Ok(())
    }

    fn is_station_connected(&self) -> bool {
        if self.joined.is_none() || self.link_lost {
            return false;
        }
        let Some(after) = self.connect_after else {
            return false;
        };
        let polls = self.polls.get();
        self.polls.set(polls.saturating_add(1));
        polls >= after
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        self.joined.as_ref().map(|_| Ipv4Addr::new(192, 168, 1, 50))
    }

    fn rssi(&self) -> Option<i32> {
        None
    }

    fn start_access_point(&mut self, ssid: &str) -> HalResult<Ipv4Addr> {
        self.access_point = Some(ssid.to_string());
        Ok(Ipv4Addr::new(192, 168, 4, 1))
    }

    fn disconnect(&mut self) {
        self.link_lost = true;
    }
}

#[derive(Debug)]
pub struct MemoryRegion {
    data: Vec<u8>,
    failing: bool,
    writes: u32,
}

impl MemoryRegion {
    /// Freshly erased flash reads back as all ones.
    pub fn erased() -> Self {
        Self {
            data: vec![0xFF; REGION_SIZE],
            failing: false,
            writes: 0,
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::erased()
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn writes(&self) -> u32 {
        self.writes
    }
}

impl ConfigStorage for MemoryRegion {
    fn read_region(&mut self, buf: &mut [u8]) -> HalResult<()> {
        if self.failing {
            return Err(HalError::Storage("read failed".to_string()));
        }
        let len = buf.len().min(self.data.len());
        buf[..len].copy_from_slice(&self.data[..len]);
        Ok(())
    }

    fn write_region(&mut self, data: &[u8]) -> HalResult<()> {
        if self.failing {
            return Err(HalError::Storage("write failed".to_string()));
        }
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFs {
    files: RefCell<BTreeMap<String, Vec<u8>>>,
    removed: RefCell<Vec<String>>,
    appends_fail: bool,
    rename_keeps_target: bool,
}

impl MemoryFs {
    /// Every append fails with an I/O error.
    pub fn failing_appends(mut self) -> Self {
        self.appends_fail = true;
        self
    }

    /// Renaming onto an existing path fails, as on flash filesystems without
    /// replace-on-rename.
    pub fn rename_keeps_target(mut self) -> Self {
        self.rename_keeps_target = true;
        self
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.borrow().clone()
    }

    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        self.files
            .borrow_mut()
            .insert(path.to_string(), data.to_vec());
        self
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).cloned()
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.file(path)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.borrow().keys().cloned().collect()
    }
}

fn not_found(path: &str) -> HalError {
    HalError::fs(path, std::io::Error::from(std::io::ErrorKind::NotFound))
}

impl Filesystem for MemoryFs {
    fn read(&self, path: &str) -> HalResult<Vec<u8>> {
        self.file(path).ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &str, data: &[u8]) -> HalResult<()> {
        self.put(path, data);
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> HalResult<()> {
        if self.appends_fail {
            return Err(HalError::fs(path, std::io::Error::other("append failed")));
        }
        self.files
            .borrow_mut()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn remove(&self, path: &str) -> HalResult<()> {
        self.files
            .borrow_mut()
            .remove(path)
            .ok_or_else(|| not_found(path))?;
        self.removed.borrow_mut().push(path.to_string());
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> HalResult<()> {
        let mut files = self.files.borrow_mut();
        if self.rename_keeps_target && files.contains_key(to) {
            return Err(HalError::fs(
                to,
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        let data = files.remove(from).ok_or_else(|| not_found(from))?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn info(&self) -> HalResult<FsInfo> {
        let used = self.files.borrow().values().map(|v| v.len() as u64).sum();
        Ok(FsInfo {
            total_bytes: 1_441_792,
            used_bytes: used,
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingIr {
    pub(crate) pending: VecDeque<CaptureEvent>,
    pub sent: Vec<(Vec<u16>, u32)>,
    pub paused: bool,
    pub pauses: u32,
    pub resumes: u32,
    pub fail_send: bool,
}

impl RecordingIr {
    pub fn queue(&mut self, event: CaptureEvent) {
        self.pending.push_back(event);
    }
}

impl IrTransceiver for RecordingIr {
    fn poll_capture(&mut self) -> Option<CaptureEvent> {
        self.pending.pop_front()
    }

    fn pause_receive(&mut self) {
        self.paused = true;
        self.pauses += 1;
    }

    fn resume_receive(&mut self) {
        self.paused = false;
        self.resumes += 1;
    }

    fn send_raw(&mut self, durations_us: &[u16], carrier_khz: u32) -> HalResult<()> {
        if self.fail_send {
            return Err(HalError::Ir("transmitter busy".to_string()));
        }
        self.sent.push((durations_us.to_vec(), carrier_khz));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingWatchdog {
    pub armed_with: Option<u32>,
    pub refreshes: u32,
}

impl Watchdog for RecordingWatchdog {
    fn arm(&mut self, timeout_s: u32) -> HalResult<()> {
        self.armed_with = Some(timeout_s);
        Ok(())
    }

    fn refresh(&mut self) {
        self.refreshes += 1;
    }
}

#[derive(Debug, Default)]
pub struct RecordingLed {
    on: bool,
    pub toggles: u32,
}

impl RecordingLed {
    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl StatusLed for RecordingLed {
    fn set(&mut self, on: bool) {
        if on != self.on {
            self.toggles += 1;
        }
        self.on = on;
    }
}

#[derive(Debug, Default)]
pub struct PanickingSystem;

impl SystemControl for PanickingSystem {
    fn restart(&mut self) -> ! {
        panic!("restart requested");
    }
}

#[derive(Debug, Default)]
pub struct ScriptedConsole {
    input: VecDeque<u8>,
    output: Vec<u8>,
    pub closed: bool,
}

impl ScriptedConsole {
    pub fn type_text(&mut self, text: &str) {
        self.input.extend(text.bytes());
    }

    pub fn take_output(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.output)).into_owned()
    }
}

impl ConsoleIo for ScriptedConsole {
    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn close_session(&mut self) {
        self.closed = true;
    }
}

pub struct MockPlatform;

impl Platform for MockPlatform {
    type Clock = ManualClock;
    type Radio = ScriptedRadio;
    type Storage = MemoryRegion;
    type Fs = MemoryFs;
    type Ir = RecordingIr;
    type Watchdog = RecordingWatchdog;
    type Led = RecordingLed;
    type System = PanickingSystem;
    type Console = ScriptedConsole;
}

pub type TestBoard = Board<MockPlatform>;

impl Board<MockPlatform> {
    pub fn new() -> Self {
        Self {
            clock: ManualClock::default(),
            radio: ScriptedRadio::default(),
            storage: MemoryRegion::erased(),
            fs: MemoryFs::default(),
            ir: RecordingIr::default(),
            watchdog: RecordingWatchdog::default(),
            led: RecordingLed::default(),
            system: PanickingSystem,
            console: Some(ScriptedConsole::default()),
        }
    }
}
