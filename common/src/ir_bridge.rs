//! Capture logging and last-signal replay.
//!
//! Captures are never kept in memory: each one is written to the history log
//! and the single-slot snapshot, then dropped.

use log::{debug, info, warn};

use crate::hal::{Filesystem, HalError, HalResult, IrTransceiver};

pub const HISTORY_PATH: &str = "/signals.txt";
pub const SNAPSHOT_PATH: &str = "/last_signal.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEvent {
    /// Alternating mark/space durations in microseconds, starting with a mark.
    pub durations: Vec<u16>,
    pub repeat: bool,
    pub overflow: bool,
}

#[derive(Debug)]
pub enum ReplayOutcome {
    Sent(Vec<u16>),
    NothingToTransmit,
    Failed(HalError),
}

#[derive(Debug, Clone, Copy)]
pub struct IrBridge {
    carrier_khz: u32,
    capture_buffer: usize,
}

impl IrBridge {
    pub fn new(carrier_khz: u32, capture_buffer: usize) -> Self {
        Self {
            carrier_khz,
            capture_buffer,
        }
    }

    /// Persists a capture. Returns false for events that are not recorded.
    ///
    /// A failed history append is logged and does not stop the snapshot from
    /// being overwritten. Only a snapshot failure is returned.
    pub fn record(
        &self,
        fs: &impl Filesystem,
        capture: CaptureEvent,
        timestamp: &str,
    ) -> HalResult<bool> {
        if capture.repeat {
            debug!("IRrecv: ignoring repeat code");
            return Ok(false);
        }
        if capture.overflow {
            warn!("IRrecv: capture overflowed the buffer, dropping it");
            return Ok(false);
        }
        if capture.durations.is_empty() {
            return Ok(false);
        }

        let mut durations = capture.durations;
        durations.truncate(self.capture_buffer);

        let listing = format_durations(&durations);
        info!("IRrecv: {listing}");

        let entry = format!("{timestamp}: {listing}\n");
        if let Err(err) = fs.append(HISTORY_PATH, entry.as_bytes()) {
            warn!("failed to append to {HISTORY_PATH}: {err}");
        }
        fs.write(SNAPSHOT_PATH, &encode_snapshot(&durations))?;
        Ok(true)
    }

    /// Retransmits the snapshot. Reception is resumed even when sending fails.
    pub fn replay(&self, fs: &impl Filesystem, ir: &mut impl IrTransceiver) -> ReplayOutcome {
        let durations = match fs.read(SNAPSHOT_PATH) {
            Ok(raw) => decode_snapshot(&raw),
            Err(err) => {
                if !err.is_not_found() {
                    warn!("failed to read {SNAPSHOT_PATH}: {err}");
                }
                Vec::new()
            }
        };

        if durations.is_empty() {
            info!("Nothing to transmit");
            return ReplayOutcome::NothingToTransmit;
        }

        ir.pause_receive();
        let result = ir.send_raw(&durations, self.carrier_khz);
        ir.resume_receive();

        match result {
            Ok(()) => {
                info!("IRsend: {}", format_durations(&durations));
                ReplayOutcome::Sent(durations)
            }
            Err(err) => {
                warn!("IRsend failed: {err}");
                ReplayOutcome::Failed(err)
            }
        }
    }

    pub fn history(&self, fs: &impl Filesystem) -> Option<String> {
        fs.read(HISTORY_PATH)
            .ok()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    }
}

const REPEAT_MAX_PULSES: usize = 4;
const REPEAT_HEADER_MARK_US: u16 = 8_000;
const REPEAT_SPACE_US: core::ops::RangeInclusive<u16> = 2_000..=2_500;

/// Turns a raw receiver frame into a capture event.
///
/// Short header-plus-gap frames are NEC style repeat codes and are flagged
/// rather than dropped. Anything else shorter than `min_pulses` is noise.
pub fn classify_capture(
    durations: Vec<u16>,
    overflow: bool,
    min_pulses: usize,
) -> Option<CaptureEvent> {
    if durations.is_empty() {
        return None;
    }

    let repeat = !overflow
        && durations.len() <= REPEAT_MAX_PULSES
        && durations[0] >= REPEAT_HEADER_MARK_US
        && durations.get(1).is_some_and(|space| REPEAT_SPACE_US.contains(space));

    if !repeat && !overflow && durations.len() < min_pulses {
        debug!("IRrecv: dropping {} pulse noise burst", durations.len());
        return None;
    }

    Some(CaptureEvent {
        durations,
        repeat,
        overflow,
    })
}

pub fn format_durations(durations: &[u16]) -> String {
    format!("{durations:?}")
}

pub fn encode_snapshot(durations: &[u16]) -> Vec<u8> {
    durations.iter().flat_map(|d| d.to_le_bytes()).collect()
}

/// A trailing odd byte is ignored.
pub fn decode_snapshot(raw: &[u8]) -> Vec<u16> {
    raw.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
