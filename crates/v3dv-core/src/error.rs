//! # V3DV Error Handling
//!
//! Error types for the command recording stack.
//!
//! Recording entry points never return these directly: a failure is folded
//! into the command buffer's sticky error and surfaced when recording ends.
//! Submission-side helpers return them as usual.

use alloc::collections::TryReserveError;
use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// V3DV Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// V3DV unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Host allocation failed
    OutOfHostMemory,
    /// Buffer object allocation failed
    OutOfDeviceMemory,

    // =========================================================================
    // Contract Errors
    // =========================================================================
    /// API usage contract violated
    Usage(UsageError),
    /// Configuration not supported by this hardware
    Unsupported,
    /// Buffer range outside of its buffer object
    InvalidBuffer,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Wait on a buffer object timed out
    Timeout,
    /// The kernel reported the device as lost
    DeviceLost,
    /// Result not available yet
    NotReady,
}

impl Error {
    /// Whether this error is an allocation failure
    #[inline]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfHostMemory | Self::OutOfDeviceMemory)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Memory
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),

            // Contract
            Self::Usage(e) => write!(f, "usage error: {e}"),
            Self::Unsupported => write!(f, "configuration not supported"),
            Self::InvalidBuffer => write!(f, "buffer range out of bounds"),

            // Device
            Self::Timeout => write!(f, "buffer object wait timed out"),
            Self::DeviceLost => write!(f, "device lost"),
            Self::NotReady => write!(f, "not ready"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Usage-contract violations detected while recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// Command recorded while the buffer is not recording
    NotRecording,
    /// Command requires an active render pass
    NotInRenderPass,
    /// Command is illegal inside a render pass
    InsideRenderPass,
    /// Command requires no open job
    JobInProgress,
    /// Command requires an open job
    NoOpenJob,
    /// Subpass index out of range for the active render pass
    InvalidSubpass,
    /// Draw or dispatch without a bound pipeline
    NoPipelineBound,
    /// A query is already active
    QueryAlreadyActive,
    /// Query ended without being begun
    QueryNotActive,
    /// Query index outside of its pool
    QueryOutOfRange,
    /// Empty event list
    NoEvents,
    /// Viewport or scissor index out of range
    TooManyViewports,
    /// Vertex or descriptor binding out of range
    TooManyBindings,
    /// Push constant range out of bounds
    PushConstantRange,
    /// Command buffer level does not allow this operation
    WrongLevel,
    /// Secondary not recorded for the current execution context
    IncompatibleSecondary,
    /// Workgroup counts out of range
    InvalidWorkgroupCount,
    /// Meta state popped without a matching push
    MetaStateUnbalanced,
    /// Command buffer id not allocated from this pool
    UnknownCommandBuffer,
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotRecording => "command buffer is not recording",
            Self::NotInRenderPass => "command requires an active render pass",
            Self::InsideRenderPass => "command not allowed inside a render pass",
            Self::JobInProgress => "command not allowed while a job is open",
            Self::NoOpenJob => "no job open for recording",
            Self::InvalidSubpass => "invalid subpass index",
            Self::NoPipelineBound => "no pipeline bound",
            Self::QueryAlreadyActive => "a query is already active",
            Self::QueryNotActive => "query was not begun",
            Self::QueryOutOfRange => "query index out of range",
            Self::NoEvents => "empty event list",
            Self::TooManyViewports => "viewport or scissor index out of range",
            Self::TooManyBindings => "binding index out of range",
            Self::PushConstantRange => "push constant range out of bounds",
            Self::WrongLevel => "operation not valid for this command buffer level",
            Self::IncompatibleSecondary => "secondary command buffer not compatible",
            Self::InvalidWorkgroupCount => "invalid workgroup count",
            Self::MetaStateUnbalanced => "meta state pop without push",
            Self::UnknownCommandBuffer => "unknown command buffer",
        };
        f.write_str(msg)
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<UsageError> for Error {
    fn from(e: UsageError) -> Self {
        Error::Usage(e)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfHostMemory
    }
}
