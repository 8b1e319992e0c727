//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Malformed identifiers or arguments, rejected before touching the database.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A schema migration step failed and was rolled back. Steps before it stay applied.
    #[error("migration step {step} failed: {source}")]
    Migration {
        step: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem failure while opening the database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<haul_core::Error> for MetadataError {
    fn from(e: haul_core::Error) -> Self {
        match e {
            haul_core::Error::InvalidConfig(msg) => Self::Config(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_names_step() {
        let err = MetadataError::Migration {
            step: 3,
            source: sqlx::Error::Protocol("boom".to_string()),
        };
        assert!(err.to_string().starts_with("migration step 3 failed"));
    }

    #[test]
    fn test_core_errors_map_to_validation() {
        let err: MetadataError = haul_core::Subject::User(0).validate().unwrap_err().into();
        assert!(matches!(err, MetadataError::Validation(_)));
    }
}
