//! The crate's single public error type.
//!
//! Every fallible entry point returns `NaResult<T>`. Provider-call failures
//! are wrapped exactly once, at the point of the call (see
//! [`crate::provider`]), into [`NaError::Protocol`] so a single failure
//! produces one log line and one typed error rather than a cascade of
//! re-wrapped variants as it propagates up through domain/endpoint/context.

use thiserror::Error;

/// Errors returned synchronously from a posting call, or carried in a
/// completion result.
///
/// `Canceled` is special: it is only ever observed as a completion result
/// (see [`crate::progress`]) and is never returned directly from a posting
/// call such as [`crate::msg::send_expected`].
#[derive(Debug, Error)]
pub enum NaError {
    /// Allocation or memory registration failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Bad flags, a buffer too small for the request header, or an
    /// unsupported configuration value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A receive buffer was smaller than the message that arrived (or, for
    /// an unexpected send, smaller than the provider's unexpected-message
    /// ceiling).
    #[error("buffer too small: need at least {expected} bytes, have {actual}")]
    Size { expected: usize, actual: usize },

    /// A fabric-provider call failed, or returned something the engine
    /// didn't expect (including a malformed request header).
    #[error("provider call `{call}` failed ({code})")]
    Protocol { call: &'static str, code: i32 },

    /// `progress`'s budget elapsed without a completion.
    #[error("progress timed out")]
    Timeout,

    /// An operation was canceled. Only ever delivered via a completion
    /// callback result, never returned from a posting call.
    #[error("operation canceled")]
    Canceled,
}

pub type NaResult<T> = Result<T, NaError>;

impl NaError {
    /// Wrap a raw provider status code, logging the failure once at the
    /// point of the call as documented on the type.
    pub(crate) fn protocol(call: &'static str, code: i32) -> Self {
        log::error!("provider call `{call}` failed with code {code}");
        NaError::Protocol { call, code }
    }
}
