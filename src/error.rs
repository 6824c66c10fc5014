// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Error kinds shared across the storage and consensus layers.
//!
//! Every fallible operation returns [`Result`]. IO errors keep the
//! originating POSIX code so the dir manager can distinguish a full disk
//! (recoverable) from a failed one.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already present: {0}")]
    AlreadyPresent(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("IO error: {message}")]
    IoError {
        message: String,
        posix_code: Option<i32>,
    },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("runtime error: {0}")]
    RuntimeError(String),
    #[error("incomplete: {0}")]
    Incomplete(String),
}

impl Error {
    pub fn not_found(msg: impl ToString) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn already_present(msg: impl ToString) -> Self {
        Error::AlreadyPresent(msg.to_string())
    }

    pub fn invalid_argument(msg: impl ToString) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    pub fn corruption(msg: impl ToString) -> Self {
        Error::Corruption(msg.to_string())
    }

    pub fn io_error(msg: impl ToString, posix_code: Option<i32>) -> Self {
        Error::IoError {
            message: msg.to_string(),
            posix_code,
        }
    }

    pub fn service_unavailable(msg: impl ToString) -> Self {
        Error::ServiceUnavailable(msg.to_string())
    }

    pub fn illegal_state(msg: impl ToString) -> Self {
        Error::IllegalState(msg.to_string())
    }

    pub fn aborted(msg: impl ToString) -> Self {
        Error::Aborted(msg.to_string())
    }

    pub fn timed_out(msg: impl ToString) -> Self {
        Error::TimedOut(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, Error::AlreadyPresent(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_io_error(&self) -> bool {
        matches!(self, Error::IoError { .. })
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable(_))
    }

    pub fn posix_code(&self) -> Option<i32> {
        match self {
            Error::IoError { posix_code, .. } => *posix_code,
            _ => None,
        }
    }

    /// True when the error indicates disk hardware trouble rather than a
    /// recoverable condition such as ENOSPC.
    pub fn is_disk_failure(&self) -> bool {
        match self.posix_code() {
            Some(code) => matches!(
                code,
                libc::EIO | libc::ENODEV | libc::ENXIO | libc::EROFS
            ),
            None => false,
        }
    }

    /// True for "no space left on device": the dir should be marked full,
    /// not failed.
    pub fn is_disk_full(&self) -> bool {
        self.posix_code() == Some(libc::ENOSPC)
    }

    /// Prefix the message with additional context, keeping the kind.
    pub fn prepend(self, prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref();
        let wrap = |m: String| format!("{prefix}: {m}");
        match self {
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::AlreadyPresent(m) => Error::AlreadyPresent(wrap(m)),
            Error::InvalidArgument(m) => Error::InvalidArgument(wrap(m)),
            Error::Corruption(m) => Error::Corruption(wrap(m)),
            Error::IoError {
                message,
                posix_code,
            } => Error::IoError {
                message: wrap(message),
                posix_code,
            },
            Error::NetworkError(m) => Error::NetworkError(wrap(m)),
            Error::ServiceUnavailable(m) => Error::ServiceUnavailable(wrap(m)),
            Error::IllegalState(m) => Error::IllegalState(wrap(m)),
            Error::Aborted(m) => Error::Aborted(wrap(m)),
            Error::NotSupported(m) => Error::NotSupported(wrap(m)),
            Error::TimedOut(m) => Error::TimedOut(wrap(m)),
            Error::RuntimeError(m) => Error::RuntimeError(wrap(m)),
            Error::Incomplete(m) => Error::Incomplete(wrap(m)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Error::NotFound(e.to_string()),
            ErrorKind::AlreadyExists => Error::AlreadyPresent(e.to_string()),
            _ => Error::IoError {
                message: e.to_string(),
                posix_code: e.raw_os_error(),
            },
        }
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::RuntimeError(format!("protobuf encode: {e}"))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Corruption(format!("protobuf decode: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corruption(format!("JSON decode: {e}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let enospc = Error::io_error("write failed", Some(libc::ENOSPC));
        assert!(enospc.is_disk_full());
        assert!(!enospc.is_disk_failure());

        let eio = Error::io_error("read failed", Some(libc::EIO));
        assert!(eio.is_disk_failure());
        assert!(!eio.is_disk_full());

        let plain = Error::corruption("bad magic");
        assert!(!plain.is_disk_failure());
        assert_eq!(plain.posix_code(), None);
    }

    #[test]
    fn test_prepend_keeps_kind() {
        let e = Error::not_found("instance file").prepend("could not load /data/a");
        assert!(e.is_not_found());
        assert!(e.to_string().contains("could not load /data/a"));
    }

    #[test]
    fn test_from_std_io() {
        let e: Error = std::io::Error::from_raw_os_error(libc::ENOSPC).into();
        assert!(e.is_disk_full());
        let e: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(e.is_not_found());
    }
}
