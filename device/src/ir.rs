use anyhow::Context;
use esp_idf_hal::{
    gpio::{InputPin, OutputPin},
    peripheral::Peripheral,
    rmt::{
        config::{CarrierConfig, DutyPercent, ReceiveConfig, TransmitConfig},
        PinState, Pulse, PulseTicks, Receive, RmtChannel, RxRmtDriver, TxRmtDriver,
        VariableLengthSignal,
    },
    units::FromValueType,
};
use log::{info, warn};

use irblaster_common::{
    hal::{HalError, HalResult, IrTransceiver},
    ir_bridge::classify_capture,
    CaptureEvent, IrHardwareConfig,
};

// 80 MHz APB / 80 gives one tick per microsecond, so durations map 1:1.
const IR_TICK_DIVIDER: u8 = 80;
const RX_GLITCH_FILTER_TICKS: u8 = 100;

enum TxBackend {
    Rmt(TxRmtDriver<'static>),
    Disabled,
}

pub struct RmtIr {
    tx: TxBackend,
    rx: Option<RxRmtDriver<'static>>,
    pulses: Vec<(Pulse, Pulse)>,
    carrier_khz: u32,
    min_pulses: usize,
    receiving: bool,
}

impl RmtIr {
    pub fn new<TC, RC, TP, RP>(
        tx_channel: impl Peripheral<P = TC> + 'static,
        tx_pin: impl Peripheral<P = TP> + 'static,
        rx_channel: impl Peripheral<P = RC> + 'static,
        rx_pin: impl Peripheral<P = RP> + 'static,
        ir: &IrHardwareConfig,
    ) -> anyhow::Result<Self>
    where
        TC: RmtChannel,
        RC: RmtChannel,
        TP: OutputPin,
        RP: InputPin,
    {
        let carrier = CarrierConfig::new()
            .frequency(ir.carrier_khz.kHz().into())
            .carrier_level(PinState::High)
            .duty_percent(DutyPercent::new(33)?);

        let tx_config = TransmitConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .carrier(Some(carrier))
            .idle(Some(PinState::Low));
        let tx = TxRmtDriver::new(tx_channel, tx_pin, &tx_config)
            .context("failed to init RMT IR transmitter")?;

        let idle_ticks = ir.capture_timeout_ms.saturating_mul(1000);
        let rx_config = ReceiveConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .idle_threshold(u16::try_from(idle_ticks).unwrap_or(u16::MAX))
            .filter_ticks_thresh(RX_GLITCH_FILTER_TICKS);
        let rx = RxRmtDriver::new(rx_channel, rx_pin, &rx_config, ir.capture_buffer * 4)
            .context("failed to init RMT IR receiver")?;

        info!(
            "IR ready: tx GPIO{} @ {}kHz, rx GPIO{} ({} pulse buffer)",
            ir.tx_pin, ir.carrier_khz, ir.rx_pin, ir.capture_buffer
        );

        Ok(Self {
            tx: TxBackend::Rmt(tx),
            rx: Some(rx),
            pulses: vec![(Pulse::zero(), Pulse::zero()); ir.capture_buffer.div_ceil(2)],
            carrier_khz: ir.carrier_khz,
            min_pulses: ir.min_pulses,
            receiving: false,
        })
    }

    pub fn disabled(ir: &IrHardwareConfig) -> Self {
        Self {
            tx: TxBackend::Disabled,
            rx: None,
            pulses: Vec::new(),
            carrier_khz: ir.carrier_khz,
            min_pulses: ir.min_pulses,
            receiving: false,
        }
    }

    fn collect_durations(&self, pairs: usize) -> Vec<u16> {
        let mut durations = Vec::with_capacity(pairs * 2);
        for (mark, space) in &self.pulses[..pairs.min(self.pulses.len())] {
            for pulse in [mark, space] {
                let ticks = pulse.ticks.ticks();
                if ticks == 0 {
                    return durations;
                }
                durations.push(ticks);
            }
        }
        durations
    }
}

impl IrTransceiver for RmtIr {
    fn poll_capture(&mut self) -> Option<CaptureEvent> {
        if !self.receiving {
            return None;
        }
        let rx = self.rx.as_mut()?;

        let (pairs, overflow) = match rx.receive(&mut self.pulses, 0) {
            Ok(Receive::Read(pairs)) => (pairs, false),
            Ok(Receive::Overflow(pairs)) => (pairs, true),
            Ok(Receive::Timeout) => return None,
            Err(err) => {
                warn!("IR receive failed: {err}");
                return None;
            }
        };

        classify_capture(self.collect_durations(pairs), overflow, self.min_pulses)
    }

    fn pause_receive(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if let Err(err) = rx.stop() {
                warn!("failed to pause IR receiver: {err}");
            }
        }
        self.receiving = false;
    }

    fn resume_receive(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        match rx.start() {
            Ok(()) => self.receiving = true,
            Err(err) => warn!("failed to resume IR receiver: {err}"),
        }
    }

    fn send_raw(&mut self, durations_us: &[u16], carrier_khz: u32) -> HalResult<()> {
        if durations_us.is_empty() {
            return Ok(());
        }

        let TxBackend::Rmt(tx) = &mut self.tx else {
            warn!("IR disabled, dropping frame with {} timings", durations_us.len());
            return Ok(());
        };

        if carrier_khz != self.carrier_khz {
            warn!(
                "transmitter is fixed at {}kHz, ignoring requested {carrier_khz}kHz",
                self.carrier_khz
            );
        }

        let mut pulses = Vec::with_capacity(durations_us.len());
        for (index, duration) in durations_us.iter().enumerate() {
            let level = if index % 2 == 0 {
                PinState::High
            } else {
                PinState::Low
            };
            let ticks = PulseTicks::new(*duration)
                .map_err(|err| HalError::Ir(format!("invalid pulse duration {duration}: {err}")))?;
            pulses.push(Pulse::new(level, ticks));
        }

        let pulse_refs: Vec<&Pulse> = pulses.iter().collect();
        let mut signal = VariableLengthSignal::with_capacity(pulses.len());
        signal
            .push(pulse_refs)
            .map_err(|err| HalError::Ir(format!("failed to build RMT signal: {err}")))?;

        tx.start_blocking(&signal)
            .map_err(|err| HalError::Ir(format!("failed to transmit IR frame over RMT: {err}")))
    }
}
