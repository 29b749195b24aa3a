//! Error taxonomy for the session core.
//!
//! State-machine failures are explicit result types; the session
//! performs its local cleanup before any of them surfaces, so a caller
//! never observes a half-open session. None of these are fatal to the
//! process.

use thiserror::Error;

/// Low-level platform/driver failure, mapped from the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("operation timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device is no longer present")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("access denied")]
    Access,
    #[error("i/o error")]
    Io,
    #[error("buffer overflow")]
    Overflow,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("platform error: {0}")]
    Other(String),
}

/// Failures of `Session::connect`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No device matches the requested id pair, or the platform refused
    /// to open it (permissions, claimed elsewhere).
    #[error("could not open a device matching the requested vid/pid")]
    NotFound,
    /// A session is already open; disconnect first.
    #[error("a session is already open")]
    Busy,
    /// Configuration select or interface claim was rejected. The
    /// partially opened handle has already been closed.
    #[error("failed to claim the device: {0}")]
    ClaimFailed(PlatformError),
}

/// Failures of the control-transfer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("no session is open")]
    SessionClosed,
    /// The device stalled a read request.
    #[error("device rejected the request")]
    Rejected,
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Failures of the interrupt-stream toggle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("no session is open")]
    SessionClosed,
    #[error("an interrupt stream is already running")]
    AlreadyStreaming,
    #[error("no interrupt stream is running")]
    NotStreaming,
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Infrastructure errors (channel plumbing and the like), distinct
/// from the state-machine taxonomy above.
#[derive(Debug, Error)]
pub enum Error {
    #[error("channel error: {0}")]
    Channel(String),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_failed_display_includes_cause() {
        let err = ConnectError::ClaimFailed(PlatformError::Busy);
        let msg = err.to_string();
        assert!(msg.contains("failed to claim"));
        assert!(msg.contains("busy"));
    }

    #[test]
    fn transfer_error_from_platform() {
        let err: TransferError = PlatformError::Timeout.into();
        assert_eq!(err, TransferError::Platform(PlatformError::Timeout));
    }
}
