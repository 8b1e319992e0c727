//! Database models mapping to the haul schema.

use crate::error::{MetadataError, MetadataResult};
use haul_core::filter::split_hosts;
use haul_core::{AccessStatus, Filter, JobStatus, Subject, SubjectKind};
use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Access subjects
// =============================================================================

/// Access record for a user or group.
#[derive(Debug, Clone, FromRow)]
pub struct AccessSubjectRow {
    pub kind: String,
    pub id: i64,
    pub label: String,
    pub status: String,
    pub added_at: OffsetDateTime,
}

impl AccessSubjectRow {
    pub fn subject(&self) -> MetadataResult<Subject> {
        let kind: SubjectKind = self.kind.parse()?;
        Ok(Subject::new(kind, self.id))
    }

    pub fn status(&self) -> MetadataResult<AccessStatus> {
        Ok(self.status.parse()?)
    }

    pub fn is_approved(&self) -> bool {
        self.status == AccessStatus::Approved.as_str()
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Job ledger record.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub url: String,
    pub requester_id: i64,
    pub requester_label: String,
    pub origin_id: i64,
    pub status: String,
    pub result_name: String,
    pub error_text: String,
    pub created_at: OffsetDateTime,
}

impl JobRow {
    pub fn status(&self) -> MetadataResult<JobStatus> {
        Ok(self.status.parse()?)
    }
}

/// A job about to be admitted. It is always recorded as pending.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub url: String,
    pub requester_id: i64,
    pub requester_label: String,
    pub origin_id: i64,
    pub created_at: OffsetDateTime,
}

impl NewJob {
    pub fn validate(&self) -> MetadataResult<()> {
        if self.url.trim().is_empty() {
            return Err(MetadataError::Validation("job url must not be empty".to_string()));
        }
        if self.requester_id == 0 {
            return Err(MetadataError::Validation(
                "job requester_id must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Job listing criteria.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub requester_id: Option<i64>,
    /// Page size; 0 selects [`JobFilter::DEFAULT_LIMIT`].
    pub limit: u32,
    pub offset: u32,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit
        }
    }
}

/// Jobs created on one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DailyCount {
    pub day: String,
    pub count: i64,
}

/// Jobs per source domain.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DomainCount {
    pub domain: String,
    pub count: i64,
}

/// Aggregate ledger statistics.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Distinct requesters that ever submitted a job.
    pub active_requesters: u64,
    /// Trailing 30-day histogram, newest day first.
    pub daily: Vec<DailyCount>,
    /// Top 10 domains by job count.
    pub top_domains: Vec<DomainCount>,
}

// =============================================================================
// Filters
// =============================================================================

/// URL filter record. Hosts are stored newline-joined.
#[derive(Debug, Clone, FromRow)]
pub struct FilterRow {
    pub id: i64,
    pub hosts: String,
    pub exclude_query_params: bool,
    pub path_pattern: String,
    pub credentials_ref: String,
    pub created_at: OffsetDateTime,
}

impl From<FilterRow> for Filter {
    fn from(row: FilterRow) -> Self {
        let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };
        Filter {
            id: row.id,
            hosts: split_hosts(&row.hosts),
            exclude_query_params: row.exclude_query_params,
            path_pattern: non_empty(row.path_pattern),
            credentials_ref: non_empty(row.credentials_ref),
        }
    }
}

/// Filter fields supplied on insert and update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub hosts: Vec<String>,
    pub exclude_query_params: bool,
    pub path_pattern: Option<String>,
    pub credentials_ref: Option<String>,
}

impl FilterSpec {
    pub fn validate(&self) -> MetadataResult<()> {
        if self.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(MetadataError::Validation(
                "filter must list at least one host".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&haul_core::config::FilterConfig> for FilterSpec {
    fn from(config: &haul_core::config::FilterConfig) -> Self {
        Self {
            hosts: config.hosts.clone(),
            exclude_query_params: config.exclude_query_params,
            path_pattern: config.path_pattern.clone(),
            credentials_ref: config.credentials_ref.clone(),
        }
    }
}

// =============================================================================
// Logs
// =============================================================================

/// Persisted log event.
#[derive(Debug, Clone, FromRow)]
pub struct LogRow {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub fields_json: String,
    pub created_at: OffsetDateTime,
}

/// Log listing criteria.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<String>,
    /// Substring matched against message and fields.
    pub search: Option<String>,
    /// Page size; 0 selects [`LogFilter::DEFAULT_LIMIT`].
    pub limit: u32,
    pub offset: u32,
}

impl LogFilter {
    pub const DEFAULT_LIMIT: u32 = 100;

    pub fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit
        }
    }
}
