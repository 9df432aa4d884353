//! Core error model.

use thiserror::Error;

use crate::aggregate::ExpectedVersion;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures raised by the core primitives themselves.
///
/// Business rule violations are modelled by each aggregate's own error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stream was not at the version the caller expected.
    #[error("version conflict (expected: {expected:?}, actual: {actual})")]
    VersionConflict {
        expected: ExpectedVersion,
        actual: u64,
    },
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
