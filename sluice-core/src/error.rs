/// Structured error types for query compilation.
///
/// Both variants are raised before any SQL reaches a connection, so callers
/// can treat them as programming errors in the calling business operation.
use thiserror::Error;

/// Error raised while compiling a query
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// UPDATE or DELETE without a WHERE clause and without the explicit override
    #[error(
        "refusing to {operation} `{table}` without a WHERE clause \
         (call allow_unconditional_writes() if this is intended)"
    )]
    Precondition {
        operation: &'static str,
        table: String,
    },

    /// The accumulated query has a shape that cannot be rendered
    #[error("cannot compile {context}: {reason}")]
    Compilation { context: String, reason: String },
}

/// Result type alias for query compilation
pub type Result<T> = std::result::Result<T, QueryError>;

impl QueryError {
    /// Create a precondition error for an unguarded write
    pub fn precondition(operation: &'static str, table: impl Into<String>) -> Self {
        Self::Precondition {
            operation,
            table: table.into(),
        }
    }

    /// Create a compilation error
    pub fn compilation(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Compilation {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueryError::precondition("delete", "orders");
        assert!(err.to_string().contains("refusing to delete `orders`"));
        assert!(err.is_precondition());

        let err = QueryError::compilation("WHERE `age`", "unsupported operator `=~`");
        assert_eq!(
            err.to_string(),
            "cannot compile WHERE `age`: unsupported operator `=~`"
        );
        assert!(!err.is_precondition());
    }
}
