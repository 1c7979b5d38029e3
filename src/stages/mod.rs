/*!
Driver stages: the pure per-tick transformations over the signal table.

Each stage is a plain config record (with any runtime state it needs inlined
in the record) plus a `run` function the engine invokes every tick. Stages
never block, never allocate, and never abort the tick: a disabled record or
an out-of-range signal reference is a no-op, and degradation is written into
the output signal's status rather than returned as an error.

Engine-enforced order (see `engine::step`):

  Remap -> Scale -> VerifiedOutput -> Pid -> Merge -> Bldc -> GpioPattern
        -> FaultMonitor (full pass) -> CyclicOutput

Within one tick that order is the causal order: a Merge observes the same
tick's Remap and Scale outputs, the fault pass observes the post-stage
state, and cyclic outputs always snapshot the latest post-fault values.
*/

pub mod bldc;
pub mod cyclic;
pub mod fault;
pub mod gpio_pattern;
pub mod merge;
pub mod pid;
pub mod remap;
pub mod scale;
pub mod verified;

pub use bldc::BldcConfig;
pub use cyclic::{CyclicOutputConfig, OutputEvent, OutputKind};
pub use fault::{FaultMonitorConfig, LimpAction, WakeAction};
pub use gpio_pattern::{GpioPatternConfig, PatternMode};
pub use merge::{MergeConfig, MergeMethod};
pub use pid::PidConfig;
pub use remap::RemapConfig;
pub use scale::ScaleConfig;
pub use verified::VerifiedOutputConfig;
