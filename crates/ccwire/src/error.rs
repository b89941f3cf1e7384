//! Record-level decoding failures.

use thiserror::Error;

use crate::pack::PackError;

/// Errors raised while mapping records onto the packed format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The underlying packing failed (truncated input, bad tag, open scope).
    #[error("pack error: {0}")]
    Pack(#[from] PackError),
    /// A record was missing a required field.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// Bytes remained after the top-level record.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;
