/*!
Cyclic output stage: periodic snapshots of a signal as output events.

Each record carries its own deadline. When the tick clock reaches it, the
stage emits an `OutputEvent` with the source signal's current value and
re-arms `period_us` ahead of *now* (not ahead of the old deadline, so a
stalled engine does not burst-emit to catch up). Disabled records do not
advance their deadline; re-enabling emits on the next tick.

The engine dispatches the collected events after the stage pass: GPIO and
PWM events go straight to the platform, CAN events become raw frames, and
J1939/CANopen events feed the matching protocol driver's signal cache.
*/

use crate::signal::SignalTable;

/// Where a cyclic output event is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Raw CAN frame: `target` is the CAN id, value is packed LE32.
    Can,
    /// `target` is the pin; nonzero value drives the pin high.
    Gpio,
    /// `target` is the channel; value is a duty in 0..=10000.
    Pwm,
    /// `target` is a signal id inside the J1939 driver's cache.
    J1939,
    /// `target` is a signal id inside the CANopen driver's cache.
    CanOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputEvent {
    pub kind: OutputKind,
    pub target: u32,
    pub value: i32,
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicOutputConfig {
    pub enabled: bool,
    pub source: usize,
    pub kind: OutputKind,
    pub target: u32,
    pub period_us: u32,
    next_deadline_us: u64,
}

impl CyclicOutputConfig {
    pub fn new(source: usize, kind: OutputKind, target: u32, period_us: u32) -> Self {
        Self {
            enabled: true,
            source,
            kind,
            target,
            period_us,
            // Zero deadline: first tick emits immediately.
            next_deadline_us: 0,
        }
    }
}

/// Emit at most one event for this record; returns it for the engine's
/// output buffer.
pub fn run(cfg: &mut CyclicOutputConfig, table: &SignalTable, now_us: u64) -> Option<OutputEvent> {
    if !cfg.enabled {
        return None;
    }
    if now_us < cfg.next_deadline_us {
        return None;
    }
    let value = table.value(cfg.source)?;
    cfg.next_deadline_us = now_us + u64::from(cfg.period_us);
    Some(OutputEvent {
        kind: cfg.kind,
        target: cfg.target,
        value,
        timestamp_us: now_us,
    })
}
