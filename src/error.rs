//! Wire-stable return codes plus the richer Rust-side error type they are
//! distilled from.
//!
//! Mirrors the split between `src/errno.rs` (raw, bit-exact, C-facing codes)
//! and the enum in `src/fd/mod.rs` (a Rust error with a `Result` alias next to
//! it) in the kernel this runtime is grounded on.

use std::fmt;

/// Bit-exact status codes returned across the DART ABI boundary (spec §6).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok = 0,
    ErrInval = 1,
    ErrNotFound = 2,
    ErrNotInit = 3,
    ErrAgain = 4,
    ErrOther = 5,
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReturnCode::Ok => "OK",
            ReturnCode::ErrInval => "ERR_INVAL",
            ReturnCode::ErrNotFound => "ERR_NOTFOUND",
            ReturnCode::ErrNotInit => "ERR_NOTINIT",
            ReturnCode::ErrAgain => "ERR_AGAIN",
            ReturnCode::ErrOther => "ERR_OTHER",
        };
        f.write_str(s)
    }
}

/// Internal, Rust-facing error type. Collapses to a [`ReturnCode`] at the ABI
/// boundary via [`From`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DartError {
    #[error("invalid argument: {0}")]
    Inval(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("dart is not initialized")]
    NotInit,
    #[error("operation would block, retry")]
    Again,
    #[error("transport or allocation failure: {0}")]
    Other(String),
}

impl From<&DartError> for ReturnCode {
    fn from(e: &DartError) -> Self {
        match e {
            DartError::Inval(_) => ReturnCode::ErrInval,
            DartError::NotFound(_) => ReturnCode::ErrNotFound,
            DartError::NotInit => ReturnCode::ErrNotInit,
            DartError::Again => ReturnCode::ErrAgain,
            DartError::Other(_) => ReturnCode::ErrOther,
        }
    }
}

impl From<DartError> for ReturnCode {
    fn from(e: DartError) -> Self {
        ReturnCode::from(&e)
    }
}

pub type Result<T> = std::result::Result<T, DartError>;

/// Abort the process for invariant violations §7 classifies as
/// unrecoverable. Never unwinds.
#[cold]
pub fn fatal(msg: &str) -> ! {
    log::error!("fatal: {msg}");
    std::process::abort()
}
