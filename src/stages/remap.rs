/*!
Remap stage: sign inversion and symmetric deadzone.

`output = invert ? -input : input`, except that an input whose magnitude is
within the deadzone maps to exactly 0. Values outside the deadzone pass
through unchanged (no re-centering). The input signal's status and
timestamp propagate to the output.
*/

use crate::signal::SignalTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapConfig {
    pub enabled: bool,
    pub input: usize,
    pub output: usize,
    pub invert: bool,
    /// `|input| <= deadzone` maps to 0. 0 disables the deadzone.
    pub deadzone: i32,
}

impl RemapConfig {
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            enabled: true,
            input,
            output,
            invert: false,
            deadzone: 0,
        }
    }
}

pub fn run(cfg: &RemapConfig, table: &mut SignalTable) {
    if !cfg.enabled {
        return;
    }
    let Some(input) = table.get(cfg.input).copied() else {
        return;
    };

    let mut value = input.value;
    if cfg.deadzone > 0 && value.saturating_abs() <= cfg.deadzone {
        value = 0;
    }
    if cfg.invert {
        value = value.saturating_neg();
    }
    table.write(cfg.output, value, input.status, input.timestamp_us);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalStatus;

    fn table_with(id: usize, value: i32) -> SignalTable {
        let mut t = SignalTable::new();
        t.produce(id, value, SignalStatus::Ok, 100);
        t
    }

    #[test]
    fn passthrough_outside_deadzone() {
        let mut t = table_with(0, 500);
        let cfg = RemapConfig {
            deadzone: 50,
            ..RemapConfig::new(0, 1)
        };
        run(&cfg, &mut t);
        assert_eq!(t.value(1), Some(500));
    }

    #[test]
    fn deadzone_flattens_small_magnitudes_both_signs() {
        let cfg = RemapConfig {
            deadzone: 50,
            ..RemapConfig::new(0, 1)
        };

        for v in [-50, -1, 0, 1, 50] {
            let mut t = table_with(0, v);
            run(&cfg, &mut t);
            assert_eq!(t.value(1), Some(0), "input {v}");
        }
        // Boundary: one past the deadzone passes through un-recentred.
        let mut t = table_with(0, 51);
        run(&cfg, &mut t);
        assert_eq!(t.value(1), Some(51));
    }

    #[test]
    fn invert_negates_after_deadzone() {
        let mut t = table_with(0, 300);
        let cfg = RemapConfig {
            invert: true,
            ..RemapConfig::new(0, 1)
        };
        run(&cfg, &mut t);
        assert_eq!(t.value(1), Some(-300));
    }

    #[test]
    fn status_propagates_from_input() {
        let mut t = SignalTable::new();
        t.produce(0, 10, SignalStatus::Timeout, 7);
        run(&RemapConfig::new(0, 1), &mut t);
        assert_eq!(t.status(1), Some(SignalStatus::Timeout));
    }

    #[test]
    fn disabled_or_invalid_reference_is_noop() {
        let mut t = table_with(0, 123);
        let mut cfg = RemapConfig::new(0, 1);
        cfg.enabled = false;
        run(&cfg, &mut t);
        assert_eq!(t.value(1), Some(0));

        let cfg = RemapConfig::new(999, 1);
        run(&cfg, &mut t);
        assert_eq!(t.value(1), Some(0));
    }

    #[test]
    fn int_min_inversion_saturates() {
        let mut t = table_with(0, i32::MIN);
        let cfg = RemapConfig {
            invert: true,
            ..RemapConfig::new(0, 1)
        };
        run(&cfg, &mut t);
        assert_eq!(t.value(1), Some(i32::MAX));
    }
}
