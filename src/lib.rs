#![doc = r#"
Lanebus library crate.

A declarative signal-processing engine for embedded control systems:
hardware samples flow through a statically configured pipeline of
transformation and supervision stages, and leave as CAN frames, GPIO
levels, PWM duties and diagnostic traffic.

Modules:
- pal: platform abstraction (clock, GPIO/PWM, CAN, byte-stream buses)
- hw_ring: ISR-side raw sample ring feeding the engine
- queue: bounded MPMC queue with drop policies and stats
- signal: the signal table - values, statuses, staleness
- stages: per-tick transformation stages (remap, scale, merge, PID,
  verified output, fault monitor, cyclic output, GPIO pattern, BLDC)
- engine: the tick orchestrator, config registry and protocol bindings
- protocol: J1939 and CANopen drivers behind one driver trait
- dtc: J1939 trouble-code lifecycle, lamp aggregation, DM1/DM2
- isotp: ISO 15765-2 segmentation/reassembly channel
- uds: ISO 14229 diagnostic server on top of isotp
- hil: socket-twin interceptor so tests drive the same binary

In tests, shared frame builders are available under `crate::test_utils`.
"#]

pub mod dtc;
pub mod engine;
pub mod error;
pub mod hil;
pub mod hw_ring;
pub mod isotp;
pub mod pal;
pub mod protocol;
pub mod queue;
pub mod signal;
pub mod stages;
pub mod uds;

// Re-export commonly used types at the crate root for convenience.
pub use engine::{Engine, ProtocolBinding, StepSummary};
pub use error::{Error, Result};
pub use hw_ring::{HwSample, InputRing};
pub use pal::{CanFrame, Platform};
pub use signal::{SIGNAL_COUNT, Signal, SignalEvent, SignalStatus, SignalTable};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
