use bloop_shm::{ShmError, ShmErrorKind};
use std::fmt;

/// Driver error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request exceeds the device geometry or the transfer cap.
    OutOfRange,
    /// Write issued against a read-only device.
    ReadOnlyViolation,
    /// No helper is currently bound.
    NotAttached,
    /// Attach called while a helper is already bound.
    AlreadyAttached,
    /// Operation on a terminated driver.
    AlreadyTerminated,
    /// Shared-buffer allocation failed.
    OutOfMemory,
    /// Helper mapping could not be established.
    MappingFailed,
    /// Notification channel send failed.
    DispatchFailed,
    /// File I/O or buffer copy failure.
    IoError,
    /// Completion for an unknown or stale handle.
    ProtocolViolation,
    /// Eject refused while the media is locked.
    NotPermitted,
}

/// Errors surfaced by [`LoopDriver`](crate::LoopDriver) and friends.
#[derive(Clone, Debug)]
pub struct DriverError {
    kind: ErrorKind,
    message: Option<String>,
}

impl DriverError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {msg}", self.kind),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<ShmError> for DriverError {
    fn from(err: ShmError) -> Self {
        let kind = match err.kind() {
            ShmErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            ShmErrorKind::MappingFailed => ErrorKind::MappingFailed,
            ShmErrorKind::Io => ErrorKind::IoError,
        };
        DriverError::with_message(kind, err.to_string())
    }
}

impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        DriverError::with_message(ErrorKind::IoError, format!("{err:#}"))
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;
