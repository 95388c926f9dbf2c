//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

#[macro_use]
mod flags;

mod backoff;
mod bitmap;
mod deadline;
mod error;

pub use backoff::BackoffSeq;
pub use bitmap::Bitmap;
pub use deadline::Deadline;
pub use error::{ErrCode, ShardTxError};
pub use print::{logger_init, ME};
