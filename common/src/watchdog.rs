//! Dead-man's switch state shared between the main loop and the timer context.
//!
//! Both variants keep their state in single-word atomics so the expiry side
//! (interrupt handler or timer thread) never takes a lock or allocates.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Armed,
    Pinged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// First missed interval. Log a warning and keep running.
    Ping,
    /// Second consecutive missed interval.
    Restart,
}

/// Two-phase soft watchdog for timers that can only fire periodically.
#[derive(Debug, Clone, Default)]
pub struct PingPong {
    pending: Arc<AtomicBool>,
}

impl PingPong {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the periodic timer once per interval.
    pub fn on_expiry(&self) -> Expiry {
        if self.pending.swap(true, Ordering::AcqRel) {
            Expiry::Restart
        } else {
            Expiry::Ping
        }
    }

    /// Called from the main loop. Returns true when a ping was outstanding.
    pub fn refresh(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn phase(&self) -> Phase {
        if self.pending.load(Ordering::Acquire) {
            Phase::Pinged
        } else {
            Phase::Armed
        }
    }
}

/// Countdown reset to the full timeout on every refresh.
///
/// Times are truncated milliseconds and compared with wrapping arithmetic, so
/// the countdown survives the u32 rollover.
#[derive(Debug, Clone)]
pub struct Countdown {
    timeout_ms: u32,
    last_refresh: Arc<AtomicU32>,
    armed: Arc<AtomicBool>,
}

impl Countdown {
    pub fn new(timeout_s: u32) -> Self {
        Self {
            timeout_ms: timeout_s.saturating_mul(1_000),
            last_refresh: Arc::new(AtomicU32::new(0)),
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn arm(&self, now_ms: u64) {
        self.last_refresh.store(now_ms as u32, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    pub fn refresh(&self, now_ms: u64) {
        self.last_refresh.store(now_ms as u32, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        if !self.is_armed() {
            return false;
        }
        let elapsed = (now_ms as u32).wrapping_sub(self.last_refresh.load(Ordering::Acquire));
        elapsed >= self.timeout_ms
    }
}
