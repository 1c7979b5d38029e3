/*!
Discrete-time PID stage.

Fixed-point: gains are milli-units (1000 is 1.0), signals are i32, and the
integral accumulator is kept in milli-output-units (i64) so slow loops with
small gains still integrate. Contracts:

- `error = setpoint - measurement`.
- Inside the deadband neither the integral nor the output signal moves.
- `dt` comes from the wall clock unless `sample_time_us` pins it.
- Anti-windup: the accumulator is clamped to `[integral_min, integral_max]`
  (expressed in output units) after every update.
- `reset_on_setpoint_change` zeroes the accumulator when the setpoint moved
  since the previous tick, before this tick's contribution.
- The first tick only captures initial state; no output is produced.
*/

use crate::signal::{SignalStatus, SignalTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidConfig {
    pub enabled: bool,
    pub setpoint: usize,
    pub measurement: usize,
    pub output: usize,

    /// Milli-gains: 1000 == 1.0.
    pub kp: i32,
    pub ki: i32,
    pub kd: i32,

    pub output_min: i32,
    pub output_max: i32,
    /// Accumulator clamp, in output units.
    pub integral_min: i32,
    pub integral_max: i32,
    /// `|error| <= deadband` freezes integral and output. Zero error is
    /// always inside the band, so a settled loop holds its last output.
    pub deadband: i32,
    /// 0 derives dt from the clock; otherwise a fixed period.
    pub sample_time_us: u32,
    pub reset_on_setpoint_change: bool,

    // Controller state.
    integral_milli: i64,
    prev_error: i32,
    prev_setpoint: i32,
    last_time_us: u64,
    primed: bool,
}

impl PidConfig {
    pub fn new(setpoint: usize, measurement: usize, output: usize) -> Self {
        Self {
            enabled: true,
            setpoint,
            measurement,
            output,
            kp: 1000,
            ki: 0,
            kd: 0,
            output_min: i32::MIN,
            output_max: i32::MAX,
            integral_min: i32::MIN,
            integral_max: i32::MAX,
            deadband: 0,
            sample_time_us: 0,
            reset_on_setpoint_change: false,
            integral_milli: 0,
            prev_error: 0,
            prev_setpoint: 0,
            last_time_us: 0,
            primed: false,
        }
    }

    /// Accumulator in output units, for supervision and tests.
    pub fn integral(&self) -> i32 {
        (self.integral_milli / 1000) as i32
    }

    pub fn reset(&mut self) {
        self.integral_milli = 0;
        self.prev_error = 0;
        self.prev_setpoint = 0;
        self.last_time_us = 0;
        self.primed = false;
    }

    fn clamp_integral(&mut self) {
        let min = i64::from(self.integral_min).saturating_mul(1000);
        let max = i64::from(self.integral_max).saturating_mul(1000);
        self.integral_milli = self.integral_milli.clamp(min, max);
    }
}

pub fn run(cfg: &mut PidConfig, table: &mut SignalTable, now_us: u64) {
    if !cfg.enabled {
        return;
    }
    let (Some(setpoint), Some(measurement)) =
        (table.value(cfg.setpoint), table.value(cfg.measurement))
    else {
        return;
    };

    if !cfg.primed {
        // First tick: capture state only.
        cfg.prev_error = setpoint.saturating_sub(measurement);
        cfg.prev_setpoint = setpoint;
        cfg.last_time_us = now_us;
        cfg.primed = true;
        return;
    }

    let dt_us = if cfg.sample_time_us != 0 {
        u64::from(cfg.sample_time_us)
    } else {
        now_us.saturating_sub(cfg.last_time_us)
    };
    cfg.last_time_us = now_us;
    // Sub-millisecond ticks still integrate over at least 1 ms rather than
    // dividing by zero.
    let dt_ms = (dt_us / 1000).max(1) as i64;

    if cfg.reset_on_setpoint_change && setpoint != cfg.prev_setpoint {
        cfg.integral_milli = 0;
    }
    cfg.prev_setpoint = setpoint;

    let error = setpoint.saturating_sub(measurement);
    if error.saturating_abs() <= cfg.deadband {
        cfg.prev_error = error;
        return;
    }

    // integral += ki * error * dt, kept in milli-units.
    cfg.integral_milli = cfg
        .integral_milli
        .saturating_add(i64::from(cfg.ki) * i64::from(error) * dt_ms / 1000);
    cfg.clamp_integral();

    let p = i64::from(cfg.kp) * i64::from(error) / 1000;
    let i = cfg.integral_milli / 1000;
    let d = i64::from(cfg.kd) * i64::from(error - cfg.prev_error) / dt_ms;
    cfg.prev_error = error;

    let out = (p + i + d)
        .clamp(i64::from(cfg.output_min), i64::from(cfg.output_max)) as i32;
    table.write(cfg.output, out, SignalStatus::Ok, now_us);
}
