/*!
BLDC commutator stage: hall-sensor driven 6-step commutation.

Reads a hall code signal (valid codes 1..=6) and a duty command signal,
and writes three phase signals plus a PWM duty signal. Each hall code maps
to one commutation step energizing two of the three phases:

  code 1: A+ B-      code 4: B+ A-
  code 2: A+ C-      code 5: C+ A-
  code 3: B+ C-      code 6: C+ B-

The energized high phase carries `+duty`, the low phase `-duty`, the idle
phase 0. Hall codes 0 and 7 are electrically impossible (all sensors low /
all high) and indicate a broken sensor: all outputs are forced to 0 with
status `Error`. `invert_direction` walks the table backwards.
*/

use crate::signal::{SignalStatus, SignalTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BldcConfig {
    pub enabled: bool,
    pub hall_input: usize,
    pub duty_input: usize,
    pub phase_a: usize,
    pub phase_b: usize,
    pub phase_c: usize,
    pub pwm_output: usize,
    pub invert_direction: bool,
}

impl BldcConfig {
    pub fn new(
        hall_input: usize,
        duty_input: usize,
        phases: (usize, usize, usize),
        pwm_output: usize,
    ) -> Self {
        Self {
            enabled: true,
            hall_input,
            duty_input,
            phase_a: phases.0,
            phase_b: phases.1,
            phase_c: phases.2,
            pwm_output,
            invert_direction: false,
        }
    }
}

/// (a, b, c) multipliers per hall code 1..=6.
const COMMUTATION: [(i32, i32, i32); 6] = [
    (1, -1, 0),  // 1: A+ B-
    (1, 0, -1),  // 2: A+ C-
    (0, 1, -1),  // 3: B+ C-
    (-1, 1, 0),  // 4: B+ A-
    (-1, 0, 1),  // 5: C+ A-
    (0, -1, 1),  // 6: C+ B-
];

pub fn run(cfg: &BldcConfig, table: &mut SignalTable, now_us: u64) {
    if !cfg.enabled {
        return;
    }
    let (Some(hall), Some(duty)) = (table.value(cfg.hall_input), table.value(cfg.duty_input))
    else {
        return;
    };

    if !(1..=6).contains(&hall) {
        // Broken hall sensor: de-energize everything.
        for id in [cfg.phase_a, cfg.phase_b, cfg.phase_c, cfg.pwm_output] {
            table.write(id, 0, SignalStatus::Error, now_us);
        }
        return;
    }

    let step = if cfg.invert_direction {
        6 - hall as usize
    } else {
        hall as usize - 1
    };
    let (a, b, c) = COMMUTATION[step];
    let duty = duty.clamp(0, 10_000);

    table.write(cfg.phase_a, a * duty, SignalStatus::Ok, now_us);
    table.write(cfg.phase_b, b * duty, SignalStatus::Ok, now_us);
    table.write(cfg.phase_c, c * duty, SignalStatus::Ok, now_us);
    table.write(cfg.pwm_output, duty, SignalStatus::Ok, now_us);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(hall: i32, duty: i32) -> SignalTable {
        let mut t = SignalTable::new();
        t.produce(0, hall, SignalStatus::Ok, 0);
        t.produce(1, duty, SignalStatus::Ok, 0);
        t
    }

    fn cfg() -> BldcConfig {
        BldcConfig::new(0, 1, (10, 11, 12), 13)
    }

    #[test]
    fn step_one_energizes_a_high_b_low() {
        let mut t = table(1, 5_000);
        run(&cfg(), &mut t, 0);
        assert_eq!(t.value(10), Some(5_000));
        assert_eq!(t.value(11), Some(-5_000));
        assert_eq!(t.value(12), Some(0));
        assert_eq!(t.value(13), Some(5_000));
    }

    #[test]
    fn all_six_steps_energize_exactly_two_phases() {
        for hall in 1..=6 {
            let mut t = table(hall, 1_000);
            run(&cfg(), &mut t, 0);
            let phases = [t.value(10).unwrap(), t.value(11).unwrap(), t.value(12).unwrap()];
            let high = phases.iter().filter(|&&v| v == 1_000).count();
            let low = phases.iter().filter(|&&v| v == -1_000).count();
            let idle = phases.iter().filter(|&&v| v == 0).count();
            assert_eq!((high, low, idle), (1, 1, 1), "hall {hall}");
        }
    }

    #[test]
    fn invalid_hall_codes_de_energize_with_error() {
        for hall in [0, 7, -3, 100] {
            let mut t = table(hall, 5_000);
            run(&cfg(), &mut t, 0);
            for id in [10, 11, 12, 13] {
                assert_eq!(t.value(id), Some(0), "hall {hall}");
                assert_eq!(t.status(id), Some(SignalStatus::Error));
            }
        }
    }

    #[test]
    fn inverted_direction_reverses_the_sequence() {
        let mut fwd = table(3, 1_000);
        run(&cfg(), &mut fwd, 0);

        let mut rev_cfg = cfg();
        rev_cfg.invert_direction = true;
        let mut rev = table(4, 1_000);
        run(&rev_cfg, &mut rev, 0);

        // Inverted hall 4 lands on forward hall 3's pattern.
        assert_eq!(rev.value(10), fwd.value(10));
        assert_eq!(rev.value(11), fwd.value(11));
        assert_eq!(rev.value(12), fwd.value(12));
    }

    #[test]
    fn duty_is_clamped_to_pwm_range() {
        let mut t = table(1, 99_999);
        run(&cfg(), &mut t, 0);
        assert_eq!(t.value(13), Some(10_000));
    }
}
