/*!
Scale stage: fixed-point gain, offset and clamping.

`output = clamp(input * scale_factor / 1000 + offset, clamp_min, clamp_max)`

`scale_factor` is a signed milli-multiplier (1000 is x1.0). The multiply and
the offset addition are performed in 64-bit and saturated to `i32` before
the optional clamps, so a large gain cannot wrap. A config whose
`clamp_min` exceeds its `clamp_max` is rejected at add time by `validate`.

The fault monitor's limp-home action rewrites `scale_factor` and the clamps
in place; `run` reads whatever is currently configured.
*/

use crate::error::{Error, Result};
use crate::signal::SignalTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleConfig {
    pub enabled: bool,
    pub input: usize,
    pub output: usize,
    /// Milli-multiplier: 1000 == x1.0, -500 == x-0.5.
    pub scale_factor: i32,
    pub offset: i32,
    pub clamp_min: Option<i32>,
    pub clamp_max: Option<i32>,
}

impl ScaleConfig {
    pub fn new(input: usize, output: usize, scale_factor: i32, offset: i32) -> Self {
        Self {
            enabled: true,
            input,
            output,
            scale_factor,
            offset,
            clamp_min: None,
            clamp_max: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.clamp_min, self.clamp_max) {
            if min > max {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    /// The arithmetic on its own, widened and saturated. Exposed for the
    /// limp-home tests, which reason about outputs without a table.
    pub fn apply(&self, input: i32) -> i32 {
        let wide = i64::from(input) * i64::from(self.scale_factor) / 1000 + i64::from(self.offset);
        let mut value = wide.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        if let Some(min) = self.clamp_min {
            value = value.max(min);
        }
        if let Some(max) = self.clamp_max {
            value = value.min(max);
        }
        value
    }
}

pub fn run(cfg: &ScaleConfig, table: &mut SignalTable) {
    if !cfg.enabled {
        return;
    }
    let Some(input) = table.get(cfg.input).copied() else {
        return;
    };
    let value = cfg.apply(input.value);
    table.write(cfg.output, value, input.status, input.timestamp_us);
}
