/*!
Verified-output stage: supervises a command signal against feedback.

Two modes:
- Continuous: every tick compares `|command - feedback|` against the
  tolerance. A mismatch writes the *feedback* value with status `Error` to
  the output; agreement writes the command value with `Ok`.
- One-shot: a command change arms a timer. Once `verify_timeout_us` has
  elapsed the comparison runs exactly once (actuators need time to move
  before feedback is meaningful). Until that evaluation the output reports
  the command with status `Ok`.
*/

use crate::signal::{SignalStatus, SignalTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedOutputConfig {
    pub enabled: bool,
    pub command: usize,
    pub feedback: usize,
    pub output: usize,
    pub tolerance: i32,
    /// One-shot mode: delay between command change and the single check.
    pub verify_timeout_us: u32,
    pub continuous_verify: bool,

    // One-shot state.
    armed_at_us: Option<u64>,
    last_command: i32,
    primed: bool,
}

impl VerifiedOutputConfig {
    pub fn new(command: usize, feedback: usize, output: usize, tolerance: i32) -> Self {
        Self {
            enabled: true,
            command,
            feedback,
            output,
            tolerance,
            verify_timeout_us: 0,
            continuous_verify: true,
            armed_at_us: None,
            last_command: 0,
            primed: false,
        }
    }

    pub fn one_shot(command: usize, feedback: usize, output: usize, tolerance: i32, verify_timeout_us: u32) -> Self {
        Self {
            continuous_verify: false,
            verify_timeout_us,
            ..Self::new(command, feedback, output, tolerance)
        }
    }
}

pub fn run(cfg: &mut VerifiedOutputConfig, table: &mut SignalTable, now_us: u64) {
    if !cfg.enabled {
        return;
    }
    let (Some(command), Some(feedback)) = (table.value(cfg.command), table.value(cfg.feedback))
    else {
        return;
    };

    let mismatch = command.saturating_sub(feedback).saturating_abs() > cfg.tolerance;

    if cfg.continuous_verify {
        if mismatch {
            table.write(cfg.output, feedback, SignalStatus::Error, now_us);
        } else {
            table.write(cfg.output, command, SignalStatus::Ok, now_us);
        }
        return;
    }

    // One-shot: arm on command change, evaluate once after the timeout.
    if !cfg.primed {
        cfg.last_command = command;
        cfg.primed = true;
    } else if command != cfg.last_command {
        cfg.last_command = command;
        cfg.armed_at_us = Some(now_us);
    }

    match cfg.armed_at_us {
        Some(armed) if now_us.saturating_sub(armed) >= u64::from(cfg.verify_timeout_us) => {
            cfg.armed_at_us = None;
            if mismatch {
                table.write(cfg.output, feedback, SignalStatus::Error, now_us);
            } else {
                table.write(cfg.output, command, SignalStatus::Ok, now_us);
            }
        }
        _ => {
            // Pending or idle: report the command as healthy.
            table.write(cfg.output, command, SignalStatus::Ok, now_us);
        }
    }
}
