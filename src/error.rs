/*!
Unified error type for the engine and its protocol layers.

All fallible public APIs return `Result<T, Error>`. Signal-level degradation
(stale inputs, inconsistent redundant readings, range excursions) is NOT an
`Error`: it travels in `SignalStatus` so the pipeline stays live while the
condition is visible downstream. `Error` is reserved for caller mistakes,
exhausted capacity, timeouts and transport failures.
*/

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed frame, out-of-range index, or otherwise bad argument.
    /// No state was changed.
    #[error("invalid argument")]
    InvalidArgument,

    /// A fixed-capacity table, ring or buffer is full.
    #[error("no space")]
    NoSpace,

    /// The referenced entry does not exist.
    #[error("not found")]
    NotFound,

    /// A bounded wait expired. No side effects.
    #[error("timed out")]
    Timeout,

    /// Non-blocking operation found nothing to do.
    #[error("would block")]
    WouldBlock,

    /// The platform transport reported a failure.
    #[error("i/o failure")]
    Io,

    /// Operation not implemented by this platform or driver.
    #[error("not supported")]
    NotSupported,

    /// The addressed bus/port/channel does not exist.
    #[error("no such device")]
    NoDevice,

    /// Config mutation attempted while the registry is locked.
    #[error("access denied")]
    AccessDenied,
}
