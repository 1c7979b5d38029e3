/*!
Merge/voter stage for redundant inputs.

Collects up to four input signals, sorts a local copy and reduces it with
the configured method. Only the output signal is written; inputs are left
untouched. When a tolerance is configured and the spread `max - min`
exceeds it, the output is written with status `Inconsistent` so downstream
supervision can react, but the reduced value is still produced.

MEDIAN of an even count is the lower middle element.
*/

use crate::signal::{SignalStatus, SignalTable};

pub const MERGE_MAX_INPUTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    Median,
    Average,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    pub enabled: bool,
    pub inputs: heapless::Vec<usize, MERGE_MAX_INPUTS>,
    pub output: usize,
    pub method: MergeMethod,
    /// 0 disables the consistency check.
    pub tolerance: i32,
}

impl MergeConfig {
    pub fn new(inputs: &[usize], output: usize, method: MergeMethod) -> Self {
        let mut v = heapless::Vec::new();
        for &id in inputs.iter().take(MERGE_MAX_INPUTS) {
            let _ = v.push(id);
        }
        Self {
            enabled: true,
            inputs: v,
            output,
            method,
            tolerance: 0,
        }
    }
}

pub fn run(cfg: &MergeConfig, table: &mut SignalTable, now_us: u64) {
    if !cfg.enabled {
        return;
    }

    let mut values: heapless::Vec<i32, MERGE_MAX_INPUTS> = heapless::Vec::new();
    for &id in cfg.inputs.iter() {
        match table.value(id) {
            Some(v) => {
                let _ = values.push(v);
            }
            // Invalid reference: skip the reading, vote over the rest.
            None => {}
        }
    }
    if values.is_empty() {
        return;
    }

    let mut sorted = values.clone();
    sorted.sort_unstable();
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];

    let value = match cfg.method {
        MergeMethod::Median => sorted[(sorted.len() - 1) / 2],
        MergeMethod::Average => {
            let sum: i64 = sorted.iter().map(|&v| i64::from(v)).sum();
            (sum / sorted.len() as i64) as i32
        }
        MergeMethod::Min => min,
        MergeMethod::Max => max,
    };

    let status = if cfg.tolerance > 0 && max.saturating_sub(min) > cfg.tolerance {
        SignalStatus::Inconsistent
    } else {
        SignalStatus::Ok
    };
    table.write(cfg.output, value, status, now_us);
}
