/*!
Engine: owner of the signal table, the configured pipeline, and the
protocol bindings.

The engine is built at boot (configs added while the registry is open),
sealed, and then driven by `step(now)` at the control rate (~100 Hz).
Interrupt producers never touch the engine directly; they push raw samples
into the input ring the engine drains at the top of each tick. Inbound CAN
traffic enters through `handle_can_frame` (or `poll_can`, which drains the
platform's receive side non-blocking).

Submodules:
- `step`: the ordered tick orchestrator (drain, staleness, stages, fault
  pass, cyclic outputs, protocol cyclic traffic).
- `registry`: runtime remap/scale access with the calibration gate.
*/

pub mod registry;
pub mod step;


pub use registry::ConfigRegistry;
pub use step::StepSummary;

use std::sync::Arc;

use log::warn;

use crate::dtc::DtcManager;
use crate::error::{Error, Result};
use crate::hw_ring::InputRing;
use crate::pal::{CanFrame, Platform};
use crate::protocol::canopen::CanOpenDriver;
use crate::protocol::j1939::J1939Driver;
use crate::protocol::{EventBuf, MessageFlags, ProtocolDriver, ProtocolMessage};
use crate::queue::{BoundedQueue, OverflowPolicy, QueueStats};
use crate::signal::{SIGNAL_COUNT, SignalEvent, SignalStatus, SignalTable};
use crate::stages::bldc::BldcConfig;
use crate::stages::cyclic::{CyclicOutputConfig, OutputEvent};
use crate::stages::fault::{FaultMonitorConfig, WakeAction};
use crate::stages::gpio_pattern::GpioPatternConfig;
use crate::stages::merge::MergeConfig;
use crate::stages::pid::PidConfig;
use crate::stages::verified::VerifiedOutputConfig;

pub const MAX_MERGES: usize = 8;
pub const MAX_PIDS: usize = 8;
pub const MAX_VERIFIED: usize = 8;
pub const MAX_FAULT_MONITORS: usize = 8;
pub const MAX_CYCLIC_OUTPUTS: usize = 16;
pub const MAX_PATTERNS: usize = 8;
pub const MAX_BLDC: usize = 2;
pub const MAX_PROTOCOLS: usize = 2;
/// Output events one tick can produce.
pub const OUTPUT_BUFFER: usize = 32;
/// Frames the transmit queue can hold between flushes.
pub const TX_QUEUE_DEPTH: usize = 32;

/// One CAN frame waiting on the transmit queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub bus: u8,
    pub id: u32,
    pub extended: bool,
    pub data: heapless::Vec<u8, 8>,
}

/// A protocol driver bound to a CAN bus. A tagged union rather than a bare
/// trait object so protocol-specific hooks (DM1 from the DTC manager) stay
/// reachable without downcasts.
pub enum ProtocolBinding {
    J1939 { bus: u8, driver: J1939Driver },
    CanOpen { bus: u8, driver: CanOpenDriver },
}

impl ProtocolBinding {
    pub fn bus(&self) -> u8 {
        match self {
            ProtocolBinding::J1939 { bus, .. } | ProtocolBinding::CanOpen { bus, .. } => *bus,
        }
    }

    pub fn driver_mut(&mut self) -> &mut dyn ProtocolDriver {
        match self {
            ProtocolBinding::J1939 { driver, .. } => driver,
            ProtocolBinding::CanOpen { driver, .. } => driver,
        }
    }
}

pub struct Engine {
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) ring: Arc<InputRing>,
    pub(crate) table: SignalTable,
    pub(crate) registry: ConfigRegistry,

    pub(crate) merges: heapless::Vec<MergeConfig, MAX_MERGES>,
    pub(crate) pids: heapless::Vec<PidConfig, MAX_PIDS>,
    pub(crate) verified: heapless::Vec<VerifiedOutputConfig, MAX_VERIFIED>,
    pub(crate) faults: heapless::Vec<FaultMonitorConfig, MAX_FAULT_MONITORS>,
    pub(crate) cyclics: heapless::Vec<CyclicOutputConfig, MAX_CYCLIC_OUTPUTS>,
    pub(crate) patterns: heapless::Vec<GpioPatternConfig, MAX_PATTERNS>,
    pub(crate) bldcs: heapless::Vec<BldcConfig, MAX_BLDC>,

    pub(crate) protocols: heapless::Vec<ProtocolBinding, MAX_PROTOCOLS>,
    pub(crate) dtc: DtcManager,

    pub(crate) outputs: heapless::Vec<OutputEvent, OUTPUT_BUFFER>,
    /// Outbound frames staged by the tick, drained by `flush_can_tx`. The
    /// oldest traffic is the most valuable (diagnostics must stay ordered),
    /// so overflow drops the newcomer.
    pub(crate) tx_queue: BoundedQueue<TxFrame, TX_QUEUE_DEPTH>,

    /// Bus used for `OutputKind::Can` raw frames.
    pub raw_can_bus: u8,
    /// Carrier frequency for `OutputKind::Pwm` events.
    pub pwm_freq_hz: u32,
}

impl Engine {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            ring: Arc::new(InputRing::new()),
            table: SignalTable::new(),
            registry: ConfigRegistry::new(),
            merges: heapless::Vec::new(),
            pids: heapless::Vec::new(),
            verified: heapless::Vec::new(),
            faults: heapless::Vec::new(),
            cyclics: heapless::Vec::new(),
            patterns: heapless::Vec::new(),
            bldcs: heapless::Vec::new(),
            protocols: heapless::Vec::new(),
            dtc: DtcManager::new(),
            outputs: heapless::Vec::new(),
            tx_queue: BoundedQueue::new(OverflowPolicy::DropNewest),
            raw_can_bus: 0,
            pwm_freq_hz: 1_000,
        }
    }

    /// Producer-side handle for ISRs (or threads standing in for them).
    pub fn ring(&self) -> Arc<InputRing> {
        Arc::clone(&self.ring)
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn table(&self) -> &SignalTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut SignalTable {
        &mut self.table
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ConfigRegistry {
        &mut self.registry
    }

    pub fn dtc(&self) -> &DtcManager {
        &self.dtc
    }

    pub fn dtc_mut(&mut self) -> &mut DtcManager {
        &mut self.dtc
    }

    /// Output events produced by the most recent tick.
    pub fn outputs(&self) -> &[OutputEvent] {
        &self.outputs
    }

    pub fn tx_queue_stats(&self) -> QueueStats {
        self.tx_queue.stats()
    }

    /// Drain the transmit queue onto the platform bus driver. `step` calls
    /// this at the end of each tick; a deployment with a dedicated transmit
    /// task can call it from there instead.
    pub fn flush_can_tx(&mut self) -> usize {
        let mut sent = 0;
        while let Some(frame) = self.tx_queue.pop() {
            match self
                .platform
                .can_send(frame.bus, frame.id, frame.extended, &frame.data)
            {
                Ok(()) => sent += 1,
                Err(e) => warn!("can tx on bus {} failed: {e}", frame.bus),
            }
        }
        sent
    }

    /// Finish boot: locks config mutation until calibration mode.
    pub fn seal(&mut self) {
        self.registry.seal();
    }

    // Config plumbing. All adds honor the registry gate (open during boot
    // and calibration, locked otherwise).

    pub fn add_merge(&mut self, cfg: MergeConfig) -> Result<usize> {
        self.registry.writable()?;
        self.merges.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.merges.len() - 1)
    }

    pub fn add_pid(&mut self, cfg: PidConfig) -> Result<usize> {
        self.registry.writable()?;
        self.pids.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.pids.len() - 1)
    }

    pub fn add_verified_output(&mut self, cfg: VerifiedOutputConfig) -> Result<usize> {
        self.registry.writable()?;
        self.verified.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.verified.len() - 1)
    }

    pub fn add_fault_monitor(&mut self, cfg: FaultMonitorConfig) -> Result<usize> {
        self.registry.writable()?;
        self.faults.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.faults.len() - 1)
    }

    pub fn add_cyclic_output(&mut self, cfg: CyclicOutputConfig) -> Result<usize> {
        self.registry.writable()?;
        self.cyclics.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.cyclics.len() - 1)
    }

    pub fn add_gpio_pattern(&mut self, cfg: GpioPatternConfig) -> Result<usize> {
        self.registry.writable()?;
        self.patterns.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.patterns.len() - 1)
    }

    pub fn add_bldc(&mut self, cfg: BldcConfig) -> Result<usize> {
        self.registry.writable()?;
        self.bldcs.push(cfg).map_err(|_| Error::NoSpace)?;
        Ok(self.bldcs.len() - 1)
    }

    pub fn add_protocol(&mut self, binding: ProtocolBinding) -> Result<()> {
        self.registry.writable()?;
        self.protocols.push(binding).map_err(|_| Error::NoSpace)
    }

    pub fn gpio_pattern_mut(&mut self, index: usize) -> Option<&mut GpioPatternConfig> {
        self.patterns.get_mut(index)
    }

    pub fn pid(&self, index: usize) -> Option<&PidConfig> {
        self.pids.get(index)
    }

    /// Apply decoded events to the signal table, honoring the wake-on-raw
    /// contract: any range-checking fault monitor watching the event's
    /// signal fires its wake action synchronously when the raw value is
    /// outside bounds, before the next tick gets a chance to run.
    pub fn ingest(&mut self, events: &[SignalEvent]) -> usize {
        let mut applied = 0;
        for ev in events {
            let id = ev.signal as usize;
            if id >= SIGNAL_COUNT {
                // Invalid source: dropped silently per the ingest contract.
                continue;
            }
            self.table.apply_event(ev);
            applied += 1;

            for f in self.faults.iter() {
                if f.input != id || !f.raw_excursion(ev.value) {
                    continue;
                }
                match f.wake {
                    WakeAction::None => {}
                    WakeAction::GpioLevel { pin, level } => {
                        if self.platform.gpio_set(pin, level).is_err() {
                            warn!("wake action gpio {pin} failed");
                        }
                    }
                    WakeAction::SignalWrite { signal, value } => {
                        self.table
                            .write(signal, value, SignalStatus::Ok, ev.timestamp_us);
                    }
                }
            }
        }
        applied
    }

    /// Route one inbound frame to the protocol bound to `bus` and ingest
    /// whatever it decodes. Returns the number of events applied.
    pub fn handle_can_frame(&mut self, bus: u8, frame: &CanFrame) -> Result<usize> {
        let now = self.platform.now_us();
        let flags = if frame.extended {
            MessageFlags::EXTENDED_ID
        } else {
            MessageFlags::empty()
        };
        let msg = ProtocolMessage::new(frame.id, &frame.data, now, flags);

        let mut events = EventBuf::new();
        let mut matched = false;
        for binding in self.protocols.iter_mut() {
            if binding.bus() != bus {
                continue;
            }
            matched = true;
            binding.driver_mut().decode(now, &msg, &mut events)?;
        }
        if !matched {
            return Err(Error::NoDevice);
        }
        Ok(self.ingest(&events))
    }

    /// Drain every bound bus non-blocking and decode what arrived.
    pub fn poll_can(&mut self) -> usize {
        let mut buses: heapless::Vec<u8, MAX_PROTOCOLS> = heapless::Vec::new();
        for b in self.protocols.iter() {
            if !buses.contains(&b.bus()) {
                let _ = buses.push(b.bus());
            }
        }
        let mut handled = 0;
        for &bus in buses.iter() {
            loop {
                let received = self.platform.can_recv(bus, 0);
                let Ok(frame) = received else { break };
                handled += self.handle_can_frame(bus, &frame).unwrap_or(0);
            }
        }
        handled
    }

    /// One engine tick. Not re-entrant; the caller owns the cadence.
    pub fn step(&mut self, now_us: u64) -> StepSummary {
        step::run(self, now_us)
    }
}
