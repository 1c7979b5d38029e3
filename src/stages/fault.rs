/*!
Fault monitor stage: supervision, fault levels and limp-home.

Three orthogonal checks, any of which trips the monitor:
- range: input value outside `[range_min, range_max]`
- staleness: input's producing timestamp older than `stale_timeout_us`
- status: input carries `Error` or `Inconsistent`

A tripped monitor writes its `fault_level` (0..=3) into the fault output
signal; a healthy pass writes 0. With a limp action configured, tripping
also rewrites the referenced scale config (gain and clamps) to reduced
values, stashing the originals in the monitor. The originals come back only
after `restore_delay_ms` of continuous healthy readings.

The range check additionally participates in the ingest path ("wake on raw
value"): `raw_excursion` is evaluated against freshly ingested events so a
dangerous ADC excursion triggers the wake action before the next tick. Wake
actions are data, not function pointers; the engine interprets them.
*/

use log::{debug, warn};

use crate::signal::{SignalStatus, SignalTable};
use crate::stages::scale::ScaleConfig;

/// What to do, synchronously, when a raw out-of-range sample arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeAction {
    #[default]
    None,
    /// Slam a GPIO pin to a level (e.g. disable an output driver).
    GpioLevel { pin: u32, level: bool },
    /// Latch a value into a signal (e.g. a kill flag other stages gate on).
    SignalWrite { signal: usize, value: i32 },
}

/// Degraded parameters applied to a scale config while the fault is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimpAction {
    /// Index into the engine's scale config table.
    pub scale_index: usize,
    pub scale_factor: i32,
    pub clamp_min: Option<i32>,
    pub clamp_max: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavedScale {
    scale_factor: i32,
    clamp_min: Option<i32>,
    clamp_max: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultMonitorConfig {
    pub enabled: bool,
    pub input: usize,
    pub fault_output: usize,
    /// Severity written into the fault output when tripped, 0..=3.
    pub fault_level: u8,

    pub check_range: bool,
    pub range_min: i32,
    pub range_max: i32,

    pub check_staleness: bool,
    pub stale_timeout_us: u32,

    pub check_status: bool,

    pub wake: WakeAction,
    pub limp: Option<LimpAction>,
    pub restore_delay_ms: u32,

    // Runtime state.
    pub limp_active: bool,
    saved: Option<SavedScale>,
    healthy_since_us: Option<u64>,
}

impl FaultMonitorConfig {
    pub fn new(input: usize, fault_output: usize, fault_level: u8) -> Self {
        Self {
            enabled: true,
            input,
            fault_output,
            fault_level: fault_level.min(3),
            check_range: false,
            range_min: i32::MIN,
            range_max: i32::MAX,
            check_staleness: false,
            stale_timeout_us: 0,
            check_status: false,
            wake: WakeAction::None,
            limp: None,
            restore_delay_ms: 0,
            limp_active: false,
            saved: None,
            healthy_since_us: None,
        }
    }

    pub fn with_range(mut self, min: i32, max: i32) -> Self {
        self.check_range = true;
        self.range_min = min;
        self.range_max = max;
        self
    }

    pub fn with_status_check(mut self) -> Self {
        self.check_status = true;
        self
    }

    pub fn with_staleness(mut self, timeout_us: u32) -> Self {
        self.check_staleness = true;
        self.stale_timeout_us = timeout_us;
        self
    }

    /// Raw-value range check used by the ingest path.
    pub fn raw_excursion(&self, value: i32) -> bool {
        self.enabled && self.check_range && (value < self.range_min || value > self.range_max)
    }
}

pub fn run(
    cfg: &mut FaultMonitorConfig,
    table: &mut SignalTable,
    scales: &mut [ScaleConfig],
    now_us: u64,
) {
    if !cfg.enabled {
        return;
    }
    let Some(input) = table.get(cfg.input).copied() else {
        return;
    };

    let mut tripped = false;
    if cfg.check_range && (input.value < cfg.range_min || input.value > cfg.range_max) {
        tripped = true;
    }
    if cfg.check_staleness
        && now_us.saturating_sub(input.timestamp_us) > u64::from(cfg.stale_timeout_us)
    {
        tripped = true;
    }
    if cfg.check_status
        && matches!(input.status, SignalStatus::Error | SignalStatus::Inconsistent)
    {
        tripped = true;
    }

    if tripped {
        cfg.healthy_since_us = None;
        table.write(
            cfg.fault_output,
            i32::from(cfg.fault_level),
            SignalStatus::Ok,
            now_us,
        );
        if let Some(limp) = cfg.limp {
            apply_limp(cfg, limp, scales);
        }
        return;
    }

    table.write(cfg.fault_output, 0, SignalStatus::Ok, now_us);

    if cfg.limp_active {
        // Healthy again: restore the original scale parameters only after a
        // sustained recovery window.
        let since = *cfg.healthy_since_us.get_or_insert(now_us);
        if now_us.saturating_sub(since) >= u64::from(cfg.restore_delay_ms) * 1000 {
            restore_limp(cfg, scales);
        }
    }
}

fn apply_limp(cfg: &mut FaultMonitorConfig, limp: LimpAction, scales: &mut [ScaleConfig]) {
    let Some(scale) = scales.get_mut(limp.scale_index) else {
        return;
    };
    if cfg.saved.is_none() {
        cfg.saved = Some(SavedScale {
            scale_factor: scale.scale_factor,
            clamp_min: scale.clamp_min,
            clamp_max: scale.clamp_max,
        });
    }
    if !cfg.limp_active {
        warn!(
            "fault monitor on signal {} entering limp-home via scale {}",
            cfg.input, limp.scale_index
        );
    }
    scale.scale_factor = limp.scale_factor;
    scale.clamp_min = limp.clamp_min;
    scale.clamp_max = limp.clamp_max;
    cfg.limp_active = true;
}

fn restore_limp(cfg: &mut FaultMonitorConfig, scales: &mut [ScaleConfig]) {
    let (Some(limp), Some(saved)) = (cfg.limp, cfg.saved) else {
        return;
    };
    if let Some(scale) = scales.get_mut(limp.scale_index) {
        scale.scale_factor = saved.scale_factor;
        scale.clamp_min = saved.clamp_min;
        scale.clamp_max = saved.clamp_max;
        debug!(
            "fault monitor on signal {} restored scale {}",
            cfg.input, limp.scale_index
        );
    }
    cfg.saved = None;
    cfg.limp_active = false;
    cfg.healthy_since_us = None;
}
