//! URL filter repository.

use crate::error::MetadataResult;
use crate::models::{FilterRow, FilterSpec};
use async_trait::async_trait;

/// Repository for URL filter rules.
#[async_trait]
pub trait FilterRepo: Send + Sync {
    /// Insert a filter and return its id.
    async fn insert_filter(&self, filter: &FilterSpec) -> MetadataResult<i64>;

    /// Replace a filter's fields.
    async fn update_filter(&self, filter_id: i64, filter: &FilterSpec) -> MetadataResult<()>;

    async fn delete_filter(&self, filter_id: i64) -> MetadataResult<()>;

    /// List filters in id order (resolution order).
    async fn list_filters(&self) -> MetadataResult<Vec<FilterRow>>;

    async fn filter_count(&self) -> MetadataResult<u64>;

    /// Seed filters into an empty table.
    ///
    /// Does nothing if any filter exists. Uses `configured` when non-empty,
    /// otherwise a default set of common video platforms. Returns the number inserted.
    async fn seed_filters(&self, configured: &[FilterSpec]) -> MetadataResult<usize>;
}
