/*!
Signal table: the single shared state the whole pipeline reads and writes.

A signal is a fixed-point `i32` plus a health status, a timestamp of the
last producing update, a per-signal staleness threshold and an `updated`
edge flag. Identifiers are plain indices in `[0, SIGNAL_COUNT)`; everything
that references a signal id treats an out-of-range id as a no-op at run
time (configs are validated at add time where possible).

Two write paths with different timestamp rules:
- `produce` (ingest from hardware or a protocol decode): always stamps
  `timestamp_us`, because arrival itself is the event staleness is measured
  against.
- `write` (pipeline stages): stamps only when the value actually changes,
  so a stage recomputing the same output does not mask a stale input chain.

`updated` is set whenever the stored value changes and is cleared by
consumers that want edge detection (`take_updated`).
*/

/// Compile-time bound on the number of signals.
pub const SIGNAL_COUNT: usize = 32;

/// Health of a signal value. Ordered roughly by severity only in the sense
/// that `Ok` is the sole healthy state; stages decide their own reactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalStatus {
    #[default]
    Ok,
    Error,
    Timeout,
    Inconsistent,
    Degraded,
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub value: i32,
    pub status: SignalStatus,
    /// Time of the most recent update that changed the value or arrived
    /// from a producer.
    pub timestamp_us: u64,
    /// 0 disables staleness supervision for this signal.
    pub stale_threshold_us: u32,
    /// Set on every value change; cleared via `take_updated`.
    pub updated: bool,
}

impl Default for Signal {
    fn default() -> Self {
        Self {
            value: 0,
            status: SignalStatus::Ok,
            timestamp_us: 0,
            stale_threshold_us: 0,
            updated: false,
        }
    }
}

/// A decoded inbound value: one event per signal carried by a protocol
/// frame, or one per raw hardware sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub signal: u32,
    pub value: i32,
    pub status: SignalStatus,
    pub timestamp_us: u64,
}

impl SignalEvent {
    pub fn ok(signal: u32, value: i32, timestamp_us: u64) -> Self {
        Self {
            signal,
            value,
            status: SignalStatus::Ok,
            timestamp_us,
        }
    }
}

/// Fixed-size table of signals, exclusively owned by the engine.
#[derive(Debug, Clone)]
pub struct SignalTable {
    signals: [Signal; SIGNAL_COUNT],
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalTable {
    pub fn new() -> Self {
        Self {
            signals: [Signal::default(); SIGNAL_COUNT],
        }
    }

    pub fn get(&self, id: usize) -> Option<&Signal> {
        self.signals.get(id)
    }

    pub fn value(&self, id: usize) -> Option<i32> {
        self.signals.get(id).map(|s| s.value)
    }

    pub fn status(&self, id: usize) -> Option<SignalStatus> {
        self.signals.get(id).map(|s| s.status)
    }

    /// Producer-path write: always stamps the timestamp; `updated` tracks
    /// value changes. Out-of-range ids are dropped silently (the ingest
    /// contract: a misconfigured source must not take down the tick).
    pub fn produce(&mut self, id: usize, value: i32, status: SignalStatus, timestamp_us: u64) {
        let Some(s) = self.signals.get_mut(id) else {
            return;
        };
        if s.value != value {
            s.value = value;
            s.updated = true;
        }
        s.status = status;
        s.timestamp_us = timestamp_us;
    }

    /// Stage-path write: timestamp advances only on a value change.
    pub fn write(&mut self, id: usize, value: i32, status: SignalStatus, timestamp_us: u64) {
        let Some(s) = self.signals.get_mut(id) else {
            return;
        };
        if s.value != value {
            s.value = value;
            s.updated = true;
            s.timestamp_us = timestamp_us;
        }
        s.status = status;
    }

    /// Apply one decoded event through the producer path.
    pub fn apply_event(&mut self, event: &SignalEvent) {
        self.produce(
            event.signal as usize,
            event.value,
            event.status,
            event.timestamp_us,
        );
    }

    pub fn set_stale_threshold(&mut self, id: usize, threshold_us: u32) {
        if let Some(s) = self.signals.get_mut(id) {
            s.stale_threshold_us = threshold_us;
        }
    }

    /// Read-and-clear the edge flag.
    pub fn take_updated(&mut self, id: usize) -> bool {
        match self.signals.get_mut(id) {
            Some(s) => {
                let was = s.updated;
                s.updated = false;
                was
            }
            None => false,
        }
    }

    /// Mark every signal whose last producing update is older than its
    /// threshold as `Timeout`. Idempotent for a fixed `now`.
    pub fn apply_staleness(&mut self, now_us: u64) {
        for s in self.signals.iter_mut() {
            if s.stale_threshold_us == 0 {
                continue;
            }
            if now_us.saturating_sub(s.timestamp_us) > u64::from(s.stale_threshold_us) {
                s.status = SignalStatus::Timeout;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_stamps_even_without_value_change() {
        // P1: after ingest, value and timestamp mirror the event exactly.
        let mut t = SignalTable::new();
        t.produce(3, 100, SignalStatus::Ok, 1_000);
        t.produce(3, 100, SignalStatus::Ok, 2_000);

        let s = t.get(3).unwrap();
        assert_eq!(s.value, 100);
        assert_eq!(s.timestamp_us, 2_000);
    }

    #[test]
    fn updated_tracks_value_changes_only() {
        let mut t = SignalTable::new();
        t.produce(0, 5, SignalStatus::Ok, 10);
        assert!(t.take_updated(0));

        t.produce(0, 5, SignalStatus::Ok, 20);
        assert!(!t.take_updated(0));

        t.produce(0, 6, SignalStatus::Ok, 30);
        assert!(t.take_updated(0));
    }

    #[test]
    fn stage_write_keeps_timestamp_on_same_value() {
        let mut t = SignalTable::new();
        t.write(1, 42, SignalStatus::Ok, 100);
        t.write(1, 42, SignalStatus::Ok, 500);
        assert_eq!(t.get(1).unwrap().timestamp_us, 100);
    }

    #[test]
    fn out_of_range_id_is_dropped() {
        let mut t = SignalTable::new();
        t.produce(SIGNAL_COUNT, 1, SignalStatus::Ok, 1);
        t.apply_event(&SignalEvent::ok(999, 1, 1));
        // Nothing to assert beyond "did not panic"; the table is unchanged.
        assert_eq!(t.value(0), Some(0));
    }

    #[test]
    fn staleness_trips_only_past_threshold() {
        // P2 both directions.
        let mut t = SignalTable::new();
        t.set_stale_threshold(2, 1_000);
        t.produce(2, 7, SignalStatus::Ok, 10_000);

        t.apply_staleness(10_900);
        assert_eq!(t.status(2), Some(SignalStatus::Ok));

        t.apply_staleness(11_001);
        assert_eq!(t.status(2), Some(SignalStatus::Timeout));
    }

    #[test]
    fn staleness_is_idempotent_for_fixed_now() {
        // P8: the second call with the same clock changes nothing.
        let mut t = SignalTable::new();
        t.set_stale_threshold(4, 100);
        t.produce(4, 1, SignalStatus::Ok, 0);

        t.apply_staleness(5_000);
        let snapshot = *t.get(4).unwrap();
        t.apply_staleness(5_000);
        assert_eq!(*t.get(4).unwrap(), snapshot);
    }

    #[test]
    fn zero_threshold_disables_staleness() {
        let mut t = SignalTable::new();
        t.produce(5, 1, SignalStatus::Ok, 0);
        t.apply_staleness(u64::MAX);
        assert_eq!(t.status(5), Some(SignalStatus::Ok));
    }
}
