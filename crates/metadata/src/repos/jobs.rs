//! Job ledger repository.

use crate::error::MetadataResult;
use crate::models::{JobFilter, JobRow, JobStats, NewJob};
use async_trait::async_trait;
use haul_core::JobOutcome;
use time::OffsetDateTime;

/// Repository for the job ledger.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a pending job and return its id.
    async fn insert_job(&self, job: &NewJob) -> MetadataResult<i64>;

    /// Record a job's terminal outcome.
    ///
    /// A second terminal update on the same job overwrites the first (last
    /// write wins) and is logged as a warning.
    async fn update_job_terminal(&self, job_id: i64, outcome: &JobOutcome) -> MetadataResult<()>;

    /// Get a job by id.
    async fn get_job(&self, job_id: i64) -> MetadataResult<Option<JobRow>>;

    /// List jobs newest first. Returns the page and the total matching count.
    async fn list_jobs(&self, filter: &JobFilter) -> MetadataResult<(Vec<JobRow>, u64)>;

    /// Aggregate statistics; the daily histogram covers the 30 days before `now`.
    async fn job_stats(&self, now: OffsetDateTime) -> MetadataResult<JobStats>;
}
