//! Job ledger: one row per admitted request, from pending to its outcome.

use crate::metrics::JOBS_FINISHED;
use haul_core::JobOutcome;
use haul_metadata::models::{JobFilter, JobRow, JobStats, NewJob};
use haul_metadata::repos::JobRepo;
use haul_metadata::{MetadataResult, MetadataStore};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn MetadataStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Record an admitted job as pending and return its id.
    pub async fn insert(&self, job: &NewJob) -> MetadataResult<i64> {
        let id = self.store.insert_job(job).await?;
        tracing::debug!(job_id = id, url = %job.url, "Job recorded");
        Ok(id)
    }

    /// Record a job's terminal outcome.
    pub async fn update_terminal(&self, job_id: i64, outcome: &JobOutcome) -> MetadataResult<()> {
        self.store.update_job_terminal(job_id, outcome).await?;
        JOBS_FINISHED
            .with_label_values(&[outcome.status().as_str()])
            .inc();
        Ok(())
    }

    pub async fn get(&self, job_id: i64) -> MetadataResult<Option<JobRow>> {
        self.store.get_job(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> MetadataResult<(Vec<JobRow>, u64)> {
        self.store.list_jobs(filter).await
    }

    /// Aggregate statistics as of now.
    pub async fn stats(&self) -> MetadataResult<JobStats> {
        self.store.job_stats(OffsetDateTime::now_utc()).await
    }
}
