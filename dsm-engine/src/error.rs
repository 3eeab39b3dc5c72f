//! The three taxonomic error categories of the paging engine.
//!
//! Only [`Invariant`](EngineError::Invariant) and
//! [`Environmental`](EngineError::Environmental) are allowed to terminate the
//! process. Transient conditions are never represented here: they are caught
//! and retried at the call site that encounters them and are only ever
//! logged, never propagated.

use thiserror::Error;

/// Top-level error type for the engine. Every fallible engine operation
/// returns `Result<T, EngineError>`; whether that is fatal is determined by
/// the caller inspecting the variant.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Memory-management subsystem corruption: double page-table delete,
    /// an internal allocation landing inside the managed region, a
    /// reentrant fault on a different address, a protocol tag out of
    /// sequence. Always fatal.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantError),

    /// Startup-time resource failures: cannot determine physical RAM,
    /// cannot allocate even one cache page, cannot install the signal
    /// handler, transport initialization fails. Fatal at startup.
    #[error("environmental failure: {0}")]
    Environmental(#[from] EnvironmentalError),
}

#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("page table delete({index}) called with no matching entry")]
    DoubleDelete { index: u32 },

    #[error("page table insert({index}) attempted without a preceding delete freeing a slot")]
    InsertWithoutFreedSlot { index: u32 },

    #[error("internal allocation of {size} bytes returned address 0x{addr:x} inside the managed region [0x{base:x}, 0x{end:x})")]
    InternalAllocInRegion {
        size: usize,
        addr: usize,
        base: usize,
        end: usize,
    },

    #[error("fault handler re-entered for address 0x{new:x} while already servicing 0x{current:x}")]
    ReentrantFault { current: usize, new: usize },

    #[error("protocol tag {got} out of sequence, expected one of {expected:?}")]
    ProtocolOutOfSequence { got: u8, expected: &'static [u8] },

    #[error("page table capacity {capacity} exceeded on insert({index})")]
    CapacityExceeded { capacity: usize, index: u32 },
}

#[derive(Debug, Error)]
pub enum EnvironmentalError {
    #[error("could not determine physical RAM for this peer: {0}")]
    RamProbeFailed(String),

    #[error("could not reserve a single cache page ({requested} bytes requested)")]
    CachePageAllocFailed { requested: usize },

    #[error("could not install access-violation signal handler: {0}")]
    SignalHandlerInstallFailed(String),

    #[error("transport initialization failed: {0}")]
    TransportInitFailed(String),

    #[error("configuration key {key} had an invalid value {value:?}: {reason}")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("could not reserve the managed region: {0}")]
    RegionReservationFailed(String),
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
