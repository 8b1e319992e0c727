//! Persisted log repository.

use crate::error::MetadataResult;
use crate::models::{LogFilter, LogRow};
use async_trait::async_trait;

/// Repository for persisted log events.
#[async_trait]
pub trait LogRepo: Send + Sync {
    async fn insert_log(&self, level: &str, message: &str, fields_json: &str)
    -> MetadataResult<i64>;

    /// List logs newest first. Returns the page and the total matching count.
    async fn list_logs(&self, filter: &LogFilter) -> MetadataResult<(Vec<LogRow>, u64)>;

    /// Logs with an id greater than `after_id`, oldest first.
    async fn list_logs_since(&self, after_id: i64) -> MetadataResult<Vec<LogRow>>;
}
