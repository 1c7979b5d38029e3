/*!
Tick orchestrator: the fixed order of one engine step.

Centralizes the order-of-operations for a single tick:
  * Drain the hardware input ring and ingest (wake-on-raw runs here)
  * Apply staleness supervision
  * Run the transformation stages in their causal order
  * Run the fault-monitor full pass (observes post-stage state)
  * Run cyclic outputs and dispatch their events
  * Collect due protocol traffic (plus DM1) and put it on the wire

The stage order is the ordering contract: within a tick, a later stage
always observes the writes of every earlier stage, and nothing in this
function blocks.
*/

use log::warn;

use crate::engine::{Engine, ProtocolBinding, TxFrame};
use crate::protocol::j1939::{PGN_DM1, PGN_DM2};
use crate::protocol::ProtocolDriver;
use crate::protocol::{MessageBuf, MessageFlags};
use crate::signal::SignalEvent;
use crate::stages::cyclic::{OutputEvent, OutputKind};
use crate::stages::{bldc, cyclic, fault, gpio_pattern, merge, pid, remap, scale, verified};

/// Counters from one tick, for supervision and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSummary {
    pub samples_drained: usize,
    pub events_ingested: usize,
    pub outputs_emitted: usize,
    pub frames_sent: usize,
}

pub fn run(engine: &mut Engine, now_us: u64) -> StepSummary {
    let mut summary = StepSummary::default();

    // 1) Drain raw samples into events and ingest them.
    while let Some(sample) = engine.ring.pop() {
        summary.samples_drained += 1;
        let ev = SignalEvent::ok(
            u32::from(sample.source),
            sample.value as i32,
            sample.timestamp_us,
        );
        summary.events_ingested += engine.ingest(&[ev]);
    }

    // 2) Staleness supervision.
    engine.table.apply_staleness(now_us);

    // 3) Transformation stages, in causal order.
    for cfg in engine.registry.remaps_slice().iter() {
        remap::run(cfg, &mut engine.table);
    }
    // Remap entries may be mutated by calibration between ticks; scales
    // additionally by the limp-home swap, so take them fresh each pass.
    for i in 0..engine.registry.scales().len() {
        let cfg = engine.registry.scales()[i];
        scale::run(&cfg, &mut engine.table);
    }
    for cfg in engine.verified.iter_mut() {
        verified::run(cfg, &mut engine.table, now_us);
    }
    for cfg in engine.pids.iter_mut() {
        pid::run(cfg, &mut engine.table, now_us);
    }
    for cfg in engine.merges.iter() {
        merge::run(cfg, &mut engine.table, now_us);
    }
    for cfg in engine.bldcs.iter() {
        bldc::run(cfg, &mut engine.table, now_us);
    }
    for cfg in engine.patterns.iter_mut() {
        let Some(level) = gpio_pattern::level(cfg, &engine.table, now_us) else {
            continue;
        };
        if cfg.last_level != Some(level) {
            if engine.platform.gpio_set(cfg.pin, level).is_err() {
                warn!("gpio pattern pin {} unavailable", cfg.pin);
            }
            cfg.last_level = Some(level);
        }
    }

    // 4) Fault-monitor full pass over the post-stage state.
    for f in engine.faults.iter_mut() {
        fault::run(f, &mut engine.table, engine.registry.scales_mut(), now_us);
    }

    // 5) Cyclic outputs: snapshot and dispatch.
    engine.outputs.clear();
    for cfg in engine.cyclics.iter_mut() {
        if let Some(ev) = cyclic::run(cfg, &engine.table, now_us) {
            if engine.outputs.push(ev).is_err() {
                warn!("output event buffer full; dropping cyclic event");
            }
        }
    }
    for i in 0..engine.outputs.len() {
        let ev = engine.outputs[i];
        summary.outputs_emitted += 1;
        dispatch(engine, &ev);
    }

    // 6) Protocol cyclic traffic, DM1 included, staged on the tx queue.
    let mut messages = MessageBuf::new();
    for binding in engine.protocols.iter_mut() {
        messages.clear();
        let bus = binding.bus();
        match binding {
            ProtocolBinding::J1939 { driver, .. } => {
                driver.get_cyclic(now_us, &mut messages);
                if let Some(payload) = engine.dtc.build_dm1(now_us) {
                    let dm1 = driver.dm_message(PGN_DM1, &payload, now_us);
                    let _ = messages.push(dm1);
                }
                if driver.take_dm2_request() {
                    let payload = engine.dtc.build_dm2();
                    let _ = messages.push(driver.dm_message(PGN_DM2, &payload, now_us));
                }
            }
            ProtocolBinding::CanOpen { driver, .. } => {
                driver.get_cyclic(now_us, &mut messages);
            }
        }
        for msg in messages.iter() {
            // Multi-packet transport is out of scope; a classical frame
            // carries the first 8 bytes (lamp byte plus first DTC for DM1).
            let len = msg.data.len().min(8);
            let frame = TxFrame {
                bus,
                id: msg.address,
                extended: msg.flags.contains(MessageFlags::EXTENDED_ID),
                data: heapless::Vec::from_slice(&msg.data[..len]).unwrap_or_default(),
            };
            if !engine.tx_queue.push(frame) {
                warn!("tx queue full; dropping frame for bus {bus}");
            }
        }
    }

    // 7) Put the staged frames on the wire.
    summary.frames_sent = engine.flush_can_tx();

    summary
}

/// Route one output event to its sink: GPIO and PWM straight to the
/// platform, raw CAN onto the transmit queue, protocol kinds into the
/// matching driver's signal cache.
fn dispatch(engine: &mut Engine, ev: &OutputEvent) {
    match ev.kind {
        OutputKind::Gpio => {
            let _ = engine.platform.gpio_set(ev.target, ev.value != 0);
        }
        OutputKind::Pwm => {
            let duty = ev.value.clamp(0, 10_000) as u16;
            let _ = engine.platform.pwm_set(ev.target, duty, engine.pwm_freq_hz);
        }
        OutputKind::Can => {
            let frame = TxFrame {
                bus: engine.raw_can_bus,
                id: ev.target,
                extended: false,
                data: heapless::Vec::from_slice(&ev.value.to_le_bytes()).unwrap_or_default(),
            };
            if !engine.tx_queue.push(frame) {
                warn!("tx queue full; dropping raw output frame");
            }
        }
        OutputKind::J1939 => {
            for b in engine.protocols.iter_mut() {
                if let ProtocolBinding::J1939 { driver, .. } = b {
                    driver.update_signal(ev.target, ev.value, ev.timestamp_us);
                    return;
                }
            }
        }
        OutputKind::CanOpen => {
            for b in engine.protocols.iter_mut() {
                if let ProtocolBinding::CanOpen { driver, .. } = b {
                    driver.update_signal(ev.target, ev.value, ev.timestamp_us);
                    return;
                }
            }
        }
    }
}
