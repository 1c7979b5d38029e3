/*!
GPIO pattern generator: phase-accumulator waveforms on a pin.

Modes, all driven by `phase = (now - t0) mod period_us`:
- Static: constantly high.
- Blink: high while `phase < on_time_us` (a 50% square by default).
- Pwm: same comparison, but `on_time_us` is derived from a duty call in
  hundredths of a percent.
- Custom: a bit string of up to 32 steps; step index advances once per
  period and the output is that bit.

A bound control signal gates the whole pattern: while its value is zero the
output is forced low. `inverted` XORs the final level. The stage only
*computes* the level; the engine compares it with the previously driven
level and touches the platform GPIO on change.
*/

use crate::signal::SignalTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMode {
    Static,
    Blink,
    Pwm,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioPatternConfig {
    pub enabled: bool,
    pub pin: u32,
    pub mode: PatternMode,
    pub period_us: u32,
    pub on_time_us: u32,
    /// Custom mode: up to 32 steps, bit 0 first.
    pub pattern_bits: u32,
    pub pattern_len: u8,
    /// While the bound signal reads zero the output is forced low.
    pub control_signal: Option<usize>,
    pub inverted: bool,
    /// Phase origin, captured when the pattern is (re)started.
    pub t0_us: u64,

    /// Level last driven onto the pin, so the engine can detect edges.
    pub last_level: Option<bool>,
}

impl GpioPatternConfig {
    pub fn blink(pin: u32, period_us: u32) -> Self {
        Self {
            enabled: true,
            pin,
            mode: PatternMode::Blink,
            period_us,
            on_time_us: period_us / 2,
            pattern_bits: 0,
            pattern_len: 0,
            control_signal: None,
            inverted: false,
            t0_us: 0,
            last_level: None,
        }
    }

    pub fn fixed(pin: u32) -> Self {
        Self {
            mode: PatternMode::Static,
            ..Self::blink(pin, 1)
        }
    }

    pub fn custom(pin: u32, step_us: u32, bits: u32, len: u8) -> Self {
        Self {
            mode: PatternMode::Custom,
            period_us: step_us,
            pattern_bits: bits,
            pattern_len: len.min(32),
            ..Self::blink(pin, step_us)
        }
    }

    /// PWM helper: set the on-time from a duty in 0..=10000.
    pub fn set_duty(&mut self, duty_0_10000: u16) {
        let duty = u32::from(duty_0_10000.min(10_000));
        self.on_time_us = (u64::from(self.period_us) * u64::from(duty) / 10_000) as u32;
    }
}

/// Compute the level the pin should carry at `now_us`. `None` when the
/// record is disabled or misconfigured (period 0, empty custom pattern).
pub fn level(cfg: &GpioPatternConfig, table: &SignalTable, now_us: u64) -> Option<bool> {
    if !cfg.enabled {
        return None;
    }

    let gated_off = match cfg.control_signal {
        Some(id) => table.value(id)? == 0,
        None => false,
    };

    let raw = if gated_off {
        false
    } else {
        match cfg.mode {
            PatternMode::Static => true,
            PatternMode::Blink | PatternMode::Pwm => {
                if cfg.period_us == 0 {
                    return None;
                }
                let phase = now_us.saturating_sub(cfg.t0_us) % u64::from(cfg.period_us);
                phase < u64::from(cfg.on_time_us)
            }
            PatternMode::Custom => {
                if cfg.period_us == 0 || cfg.pattern_len == 0 {
                    return None;
                }
                let step = (now_us.saturating_sub(cfg.t0_us) / u64::from(cfg.period_us))
                    % u64::from(cfg.pattern_len);
                cfg.pattern_bits >> step & 1 == 1
            }
        }
    };
    Some(raw ^ cfg.inverted)
}
