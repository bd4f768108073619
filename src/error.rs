use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Flat failure taxonomy shared by every entry point.
///
/// Absence is never an error: missing keys and missing fields travel through
/// results as the `LEN_MISSING` / `DEGREE_MISSING` sentinels instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    BadArgument(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    #[error("parse failure: {0}")]
    Parse(String),
    #[error("serialize failure: {0}")]
    Serialize(String),
    #[error("substrate failure: {0}")]
    Substrate(String),
    #[error("closed handle: {0}")]
    ClosedHandle(&'static str),
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
