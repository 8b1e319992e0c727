//! Error type for the admission pipeline.

use crate::cache::CacheError;
use haul_core::Subject;

/// Errors raised while admitting and running a request.
#[derive(Debug, thiserror::Error)]
pub enum HaulError {
    #[error("metadata error: {0}")]
    Metadata(#[from] haul_metadata::MetadataError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("core error: {0}")]
    Core(#[from] haul_core::Error),

    /// The access gate refused the request.
    #[error("access denied for {0}")]
    Denied(Subject),
}

impl HaulError {
    /// Short machine-readable code, used in replies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata_error",
            Self::Cache(CacheError::Upstream(_)) => "fetch_failed",
            Self::Cache(CacheError::Cancelled) => "cancelled",
            Self::Cache(CacheError::Aborted(_)) => "aborted",
            Self::Core(_) => "invalid_request",
            Self::Denied(_) => "denied",
        }
    }
}

/// Result type for the admission pipeline.
pub type HaulResult<T> = std::result::Result<T, HaulError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(HaulError::Denied(Subject::User(42)).code(), "denied");
        assert_eq!(
            HaulError::Cache(CacheError::Upstream("boom".into())).code(),
            "fetch_failed"
        );
        assert_eq!(
            HaulError::Denied(Subject::Group(-100)).to_string(),
            "access denied for group:-100"
        );
    }
}
