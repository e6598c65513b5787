//! Error taxonomy for the fencing engine.
//!
//! Every failure surfaced to callers maps onto a negative errno-like result
//! code (see [`FenceError::code`]) so that results can travel over the fencer
//! protocol and be decoded again on the other side.

use thiserror::Error;

/// Result code used by the fencer for generic failures.
pub const GENERIC_ERROR_CODE: i32 = 201;

/// Errors that can occur while executing agents or talking to the fencer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenceError {
    /// The connection to the fencer is not established.
    #[error("not connected to the fencer")]
    NotConnected,

    /// A required argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Sending to or receiving from the fencer failed.
    #[error("communication with the fencer failed: {0}")]
    Communication(String),

    /// The fencer sent something we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A local timer expired (agent escalation or callback fallback timer).
    #[error("operation timed out")]
    TimedOut,

    /// The agent gave up on its own internal timeout.
    #[error("fence agent reported a timeout")]
    AgentTimedOut,

    /// The agent does not implement the requested action.
    #[error("action not supported by the fence agent")]
    NotSupported,

    /// The agent failed without telling us why.
    #[error("fence agent failed without error output")]
    NoData,

    /// The agent was terminated by a signal we did not send.
    #[error("fence agent terminated by signal {0}")]
    Aborted(i32),

    /// The agent exited non-zero with unclassified error output.
    #[error("fence agent exited with status {exit_code}")]
    AgentFailed { exit_code: i32 },

    /// The agent process could not be started or fed its arguments.
    #[error("could not launch fence agent: {0}")]
    Spawn(String),

    /// Any other failure.
    #[error("{0}")]
    Generic(String),

    /// The same subscription was registered twice.
    #[error("subscription already present")]
    DuplicateSubscription,

    /// A callback or subscription to remove did not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The fencer returned a code outside the known taxonomy.
    #[error("fencer returned error code {0}")]
    Remote(i32),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FenceError>;

impl FenceError {
    /// Negative errno-like code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::NotConnected => -libc::ENOTCONN,
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::Communication(_) => -libc::ECOMM,
            Self::Protocol(_) => -libc::EPROTO,
            Self::TimedOut => -libc::ETIME,
            Self::AgentTimedOut => -libc::ETIMEDOUT,
            Self::NotSupported => -libc::EOPNOTSUPP,
            Self::NoData => -libc::ENODATA,
            Self::Aborted(_) => -libc::ECONNABORTED,
            Self::Spawn(_) => -libc::ECHILD,
            Self::AgentFailed { .. } | Self::Generic(_) => -GENERIC_ERROR_CODE,
            Self::DuplicateSubscription => -libc::ENOTUNIQ,
            Self::NotFound(_) => -libc::ENOENT,
            Self::Remote(code) => *code,
        }
    }

    /// Decode a result code received from the fencer.
    ///
    /// Returns `None` for success (zero or positive codes).
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        let err = match code.wrapping_neg() {
            libc::ENOTCONN => Self::NotConnected,
            libc::EINVAL => Self::InvalidArgument("rejected by the fencer".to_string()),
            libc::ECOMM => Self::Communication("reported by the fencer".to_string()),
            libc::EPROTO | libc::ENOMSG => Self::Protocol("reported by the fencer".to_string()),
            libc::ETIME => Self::TimedOut,
            libc::ETIMEDOUT => Self::AgentTimedOut,
            libc::EOPNOTSUPP => Self::NotSupported,
            libc::ENODATA => Self::NoData,
            libc::ECONNABORTED => Self::Aborted(0),
            libc::ECHILD => Self::Spawn("reported by the fencer".to_string()),
            GENERIC_ERROR_CODE => Self::Generic("generic failure reported by the fencer".to_string()),
            libc::ENOTUNIQ => Self::DuplicateSubscription,
            libc::ENOENT => Self::NotFound("reported by the fencer".to_string()),
            _ => Self::Remote(code),
        };
        Some(err)
    }

    /// Whether this error came from a local or remote timer expiring.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut | Self::AgentTimedOut)
    }
}

/// Turn a wire result code into a `Result`.
pub fn check_code(code: i32) -> Result<()> {
    FenceError::from_code(code).map_or(Ok(()), Err)
}

/// Turn a `Result` into a wire result code.
pub fn result_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

impl From<serde_json::Error> for FenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed message: {e}"))
    }
}

impl From<std::io::Error> for FenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Communication(e.to_string())
    }
}
