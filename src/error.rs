use thiserror::Error;

/// Main error type for compgraph
#[derive(Error, Debug)]
pub enum CompgraphError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A component registration collides with the reserved relation name
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// A relation filter instance carries neither an id nor a relType
    #[error("Missing filter key: {0}")]
    MissingFilterKey(String),

    /// Malformed component or filter arguments, rejected before any storage call
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Convenient Result type using CompgraphError
pub type Result<T> = std::result::Result<T, CompgraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CompgraphError::SchemaConflict("rel is reserved".to_string());
        assert!(err.to_string().contains("Schema conflict"));
        assert!(err.to_string().contains("rel is reserved"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let sqlite_err = rusqlite::Error::InvalidQuery;
        let err: CompgraphError = sqlite_err.into();
        assert!(matches!(err, CompgraphError::Database(_)));
    }

    #[test]
    fn test_validation_error_display() {
        let err = CompgraphError::Validation("unknown component: ghost".to_string());
        assert!(err.to_string().contains("unknown component"));
    }
}
