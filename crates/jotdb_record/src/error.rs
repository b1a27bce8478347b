//! Error types for filter parsing and evaluation.

use thiserror::Error;

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors that can occur while parsing a filter.
///
/// Evaluation itself is total and never fails; every malformed construct
/// is rejected at parse time.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A filter used an unrecognized operator key.
    #[error("invalid operator: {operator}")]
    InvalidOperator {
        /// The operator key as written in the filter.
        operator: String,
    },

    /// A `$regex` pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The pattern as written in the filter.
        pattern: String,
        /// Description of the compile failure.
        message: String,
    },

    /// An operator was given an operand of the wrong shape.
    #[error("bad operand for {operator}: expected {expected}")]
    BadOperand {
        /// The operator key.
        operator: String,
        /// What the operator requires.
        expected: &'static str,
    },
}

impl QueryError {
    /// Creates an invalid operator error.
    pub fn invalid_operator(operator: impl Into<String>) -> Self {
        Self::InvalidOperator {
            operator: operator.into(),
        }
    }

    /// Creates a bad operand error.
    pub fn bad_operand(operator: impl Into<String>, expected: &'static str) -> Self {
        Self::BadOperand {
            operator: operator.into(),
            expected,
        }
    }
}
