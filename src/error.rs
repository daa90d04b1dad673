//! Error types for the reconstruction pipeline.
//!
//! All fatal conditions surface as one of the variants below; the CLI
//! prints the message on a single line and exits non-zero. Failure to
//! converge is deliberately not an error: the solver always returns its
//! last iterate together with the iteration count.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SvrError {
    /// Inconsistent or out-of-range user input (table dimensions,
    /// option values, incompatible image geometry).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A file could not be read or written.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Non-finite entries in data that must be finite (gradient table,
    /// motion parameters).
    #[error("numeric failure: {0}")]
    Numeric(String),

    /// The solve was aborted through the external cancellation flag.
    #[error("cancelled during solve (iteration {iteration})")]
    Cancelled { iteration: usize },
}

pub type SvrResult<T> = Result<T, SvrError>;
