//! Customized unified error type and the status code taxonomy.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;
use std::sync;

use serde::{Deserialize, Serialize};

/// Status codes shared by local errors and on-wire replies.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Default, Serialize, Deserialize,
)]
pub enum ErrCode {
    #[default]
    Success,
    /// Invalid (or closed) handle.
    NoHdl,
    /// Operation not permitted in current status.
    NoPerm,
    /// Operation already done.
    Already,
    /// Some other attempt is in progress.
    InProgress,
    /// Server busy.
    Busy,
    /// Transaction locally busy on server.
    TxBusy,
    /// Transaction must restart with a newer epoch.
    TxRestart,
    /// Transaction identifier already used on server.
    TxIdRepeated,
    /// Epoch too old to be accepted.
    EpochOld,
    /// Pool map version stale.
    Stale,
    /// Target excluded from pool.
    Excluded,
    /// Target unreachable.
    Unreachable,
    /// Request timed out.
    TimedOut,
    /// Key already exists.
    Exist,
    /// Key does not exist.
    NonExist,
    /// I/O error, e.g., too many redundancy group members lost.
    Io,
    /// Too many sub-requests.
    Overflow,
    /// Allocation failure.
    NoMem,
    /// Invalid argument.
    Inval,
    /// Protocol violation.
    Proto,
    /// Operation canceled.
    Canceled,
    /// Value not initialized yet.
    Uninit,
    /// Anything else.
    Misc,
}

impl ErrCode {
    /// Is this a transient distributed error that a resend may resolve?
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stale
                | Self::Excluded
                | Self::Unreachable
                | Self::TimedOut
                | Self::Busy
                | Self::TxBusy
                | Self::InProgress
        )
    }

    /// Is this a pool-membership related error that calls for a pool map
    /// refresh before resending?
    #[inline]
    pub fn needs_map_refresh(&self) -> bool {
        matches!(
            self,
            Self::Stale | Self::Excluded | Self::Unreachable | Self::TimedOut
        )
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Customized error type for the transaction coordinator.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardTxError {
    code: ErrCode,
    msg: String,
}

impl ShardTxError {
    /// Error with an unspecific code.
    pub fn msg(msg: impl ToString) -> Self {
        ShardTxError {
            code: ErrCode::Misc,
            msg: msg.to_string(),
        }
    }

    /// Error with a specific status code.
    pub fn code(code: ErrCode, msg: impl ToString) -> Self {
        ShardTxError {
            code,
            msg: msg.to_string(),
        }
    }

    /// Returns the status code carried.
    #[inline]
    pub fn errcode(&self) -> ErrCode {
        self.code
    }
}

impl fmt::Display for ShardTxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for ShardTxError {}

impl From<io::Error> for ShardTxError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrCode::Unreachable,
            io::ErrorKind::TimedOut => ErrCode::TimedOut,
            io::ErrorKind::OutOfMemory => ErrCode::NoMem,
            _ => ErrCode::Misc,
        };
        ShardTxError::code(code, e.to_string())
    }
}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ShardTxError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ShardTxError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ShardTxError::msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ShardTxError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ShardTxError {
            fn from(e: $error) -> ShardTxError {
                ShardTxError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::TryFromIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(reed_solomon_erasure::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(sync::PoisonError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ShardTxError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        assert_eq!(e.errcode(), ErrCode::Misc);
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = ShardTxError::from(io_error);
        assert!(e.msg.contains("oh no!"));
        let io_error = io::Error::new(io::ErrorKind::ConnectionRefused, "x");
        assert_eq!(ShardTxError::from(io_error).errcode(), ErrCode::Unreachable);
    }

    #[test]
    fn retryable_codes() {
        assert!(ErrCode::TimedOut.is_retryable());
        assert!(ErrCode::Busy.is_retryable());
        assert!(!ErrCode::TxRestart.is_retryable());
        assert!(!ErrCode::Exist.is_retryable());
        assert!(ErrCode::Excluded.needs_map_refresh());
        assert!(!ErrCode::Busy.needs_map_refresh());
    }
}
