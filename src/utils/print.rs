//! Helper macros for logging (console printing).

use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this client process (e.g. "bench" or a pool/container tag),
/// printed as the prefix of every log line.
pub static ME: OnceLock<String> = OnceLock::new();

/// Shared body of the `pf_*!` macros: logs at the given `log` level with the
/// client identity in parentheses as prefix.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($lvl:ident, $($fmt_args:tt)*) => {
        log::$lvl!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("sub-request {} cached", idx);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(trace, $($fmt_args)*) };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(debug, $($fmt_args)*) };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(info, $($fmt_args)*) };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(warn, $($fmt_args)*) };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(error, $($fmt_args)*) };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return a `ShardTxError`
/// containing the string. An optional leading `ErrCode` followed by `;`
/// sets the status code carried by the error.
///
/// Example:
/// ```no_compile
/// let e = logged_err!("got {} to print", msg);
/// let e = logged_err!(ErrCode::NoPerm; "status {} not open", status);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($code:expr; $($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::ShardTxError::code($code, format!($($fmt_args)*)))
        }
    };

    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::ShardTxError::msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use crate::utils::{ErrCode, ShardTxError};

    #[test]
    fn error_plain_message() {
        assert_eq!(
            logged_err!("leader of group {} unknown", 2),
            Err::<(), ShardTxError>(ShardTxError::msg(
                "leader of group 2 unknown"
            ))
        );
    }

    #[test]
    fn error_with_code() {
        let e: Result<(), ShardTxError> =
            logged_err!(ErrCode::NoPerm; "status {} invalid", 3);
        assert_eq!(e.unwrap_err().errcode(), ErrCode::NoPerm);
    }
}
