//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::migrations::{MIGRATIONS, Migrator};
use crate::repos::{AccessRepo, FilterRepo, JobRepo, LogRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: AccessRepo + JobRepo + FilterRepo + LogRepo + Send + Sync {
    /// Bring the schema up to date. Returns the number of steps applied.
    async fn migrate(&self) -> MetadataResult<usize>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Current schema version.
    async fn schema_version(&self) -> MetadataResult<i64>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and migrate it.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: Option<u64>) -> MetadataResult<Self> {
        let store = Self::open(path, busy_timeout_secs).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Open the database without running migrations.
    pub async fn open(path: impl AsRef<Path>, busy_timeout_secs: Option<u64>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs.unwrap_or(5)));

        let pool = SqlitePoolOptions::new()
            // Single writer connection; concurrent callers queue on the pool.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        tracing::debug!(path = %path.display(), "Opened metadata database");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<usize> {
        Migrator::new(MIGRATIONS).run(&self.pool).await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn schema_version(&self) -> MetadataResult<i64> {
        Migrator::new(MIGRATIONS).current_version(&self.pool).await
    }
}

/// Filters seeded into an empty database when none are configured.
fn default_filters() -> Vec<crate::models::FilterSpec> {
    let spec = |hosts: &[&str], exclude_query_params: bool| crate::models::FilterSpec {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        exclude_query_params,
        path_pattern: None,
        credentials_ref: None,
    };
    vec![
        spec(&["tiktok.com", "www.tiktok.com", "vm.tiktok.com", "vt.tiktok.com"], true),
        spec(&["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"], false),
        spec(&["instagram.com", "www.instagram.com"], true),
        spec(&["twitter.com", "www.twitter.com", "x.com", "www.x.com"], true),
        spec(&["reddit.com", "www.reddit.com", "old.reddit.com"], true),
        spec(&["facebook.com", "www.facebook.com", "fb.watch", "m.facebook.com"], true),
    ]
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use haul_core::filter::join_hosts;
    use haul_core::{AccessStatus, JobOutcome, JobStatus, Subject, SubjectKind};
    use time::OffsetDateTime;

    fn access_table(kind: SubjectKind) -> &'static str {
        match kind {
            SubjectKind::User => "access_users",
            SubjectKind::Group => "access_groups",
        }
    }

    fn subject_select(kind: SubjectKind) -> String {
        format!(
            "SELECT '{}' AS kind, id, label, status, added_at FROM {}",
            kind.as_str(),
            access_table(kind)
        )
    }

    #[async_trait]
    impl AccessRepo for SqliteStore {
        async fn register_subject(
            &self,
            subject: Subject,
            label: &str,
        ) -> MetadataResult<AccessSubjectRow> {
            subject.validate()?;
            let table = access_table(subject.kind());

            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!(
                "INSERT INTO {table} (id, label, status, added_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET label = excluded.label"
            ))
            .bind(subject.id())
            .bind(label)
            .bind(AccessStatus::Pending.as_str())
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query_as::<_, AccessSubjectRow>(&format!(
                "{} WHERE id = ?",
                subject_select(subject.kind())
            ))
            .bind(subject.id())
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok(row)
        }

        async fn set_subject_status(
            &self,
            subject: Subject,
            status: AccessStatus,
        ) -> MetadataResult<()> {
            subject.validate()?;
            let table = access_table(subject.kind());
            let result = sqlx::query(&format!("UPDATE {table} SET status = ? WHERE id = ?"))
                .bind(status.as_str())
                .bind(subject.id())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("{subject} not found")));
            }
            Ok(())
        }

        async fn grant_subject(&self, subject: Subject, label: &str) -> MetadataResult<()> {
            subject.validate()?;
            let table = access_table(subject.kind());
            sqlx::query(&format!(
                "INSERT INTO {table} (id, label, status, added_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                     label = CASE WHEN excluded.label = '' THEN {table}.label ELSE excluded.label END"
            ))
            .bind(subject.id())
            .bind(label)
            .bind(AccessStatus::Approved.as_str())
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn remove_subject(&self, subject: Subject) -> MetadataResult<()> {
            subject.validate()?;
            let table = access_table(subject.kind());
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
                .bind(subject.id())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("{subject} not found")));
            }
            Ok(())
        }

        async fn get_subject(&self, subject: Subject) -> MetadataResult<Option<AccessSubjectRow>> {
            let row = sqlx::query_as::<_, AccessSubjectRow>(&format!(
                "{} WHERE id = ?",
                subject_select(subject.kind())
            ))
            .bind(subject.id())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn is_subject_allowed(&self, subject: Subject) -> MetadataResult<bool> {
            let table = access_table(subject.kind());
            let allowed: bool = sqlx::query_scalar(&format!(
                "SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ? AND status = ?)"
            ))
            .bind(subject.id())
            .bind(AccessStatus::Approved.as_str())
            .fetch_one(&self.pool)
            .await?;
            Ok(allowed)
        }

        async fn list_subjects(
            &self,
            kind: SubjectKind,
            status: Option<AccessStatus>,
        ) -> MetadataResult<Vec<AccessSubjectRow>> {
            let rows = sqlx::query_as::<_, AccessSubjectRow>(&format!(
                "{} WHERE (?1 IS NULL OR status = ?1) ORDER BY added_at DESC, id DESC",
                subject_select(kind)
            ))
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl JobRepo for SqliteStore {
        async fn insert_job(&self, job: &NewJob) -> MetadataResult<i64> {
            job.validate()?;
            let result = sqlx::query(
                "INSERT INTO jobs (url, requester_id, requester_label, origin_id, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&job.url)
            .bind(job.requester_id)
            .bind(&job.requester_label)
            .bind(job.origin_id)
            .bind(JobStatus::Pending.as_str())
            .bind(job.created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }

        async fn update_job_terminal(
            &self,
            job_id: i64,
            outcome: &JobOutcome,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let current: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(current) = current else {
                return Err(MetadataError::NotFound(format!("job {job_id} not found")));
            };
            if current.parse::<JobStatus>().is_ok_and(|s| s.is_terminal()) {
                tracing::warn!(
                    job_id,
                    previous = %current,
                    next = %outcome.status(),
                    "Job already terminal, overwriting outcome"
                );
            }

            sqlx::query("UPDATE jobs SET status = ?, result_name = ?, error_text = ? WHERE id = ?")
                .bind(outcome.status().as_str())
                .bind(outcome.result_name())
                .bind(outcome.error_text())
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_job(&self, job_id: i64) -> MetadataResult<Option<JobRow>> {
            let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_jobs(&self, filter: &JobFilter) -> MetadataResult<(Vec<JobRow>, u64)> {
            let status = filter.status.map(|s| s.as_str());

            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM jobs
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR requester_id = ?2)",
            )
            .bind(status)
            .bind(filter.requester_id)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query_as::<_, JobRow>(
                "SELECT * FROM jobs
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR requester_id = ?2)
                 ORDER BY id DESC LIMIT ?3 OFFSET ?4",
            )
            .bind(status)
            .bind(filter.requester_id)
            .bind(filter.effective_limit() as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await?;

            Ok((rows, total as u64))
        }

        async fn job_stats(&self, now: OffsetDateTime) -> MetadataResult<JobStats> {
            let (total, succeeded, failed): (i64, i64, i64) = sqlx::query_as(
                "SELECT COUNT(*),
                        COUNT(CASE WHEN status = ?1 THEN 1 END),
                        COUNT(CASE WHEN status = ?2 THEN 1 END)
                 FROM jobs",
            )
            .bind(JobStatus::Success.as_str())
            .bind(JobStatus::Failed.as_str())
            .fetch_one(&self.pool)
            .await?;

            let active_requesters: i64 =
                sqlx::query_scalar("SELECT COUNT(DISTINCT requester_id) FROM jobs")
                    .fetch_one(&self.pool)
                    .await?;

            let cutoff = now - time::Duration::days(30);
            let daily = sqlx::query_as::<_, DailyCount>(
                "SELECT date(created_at) AS day, COUNT(*) AS count FROM jobs
                 WHERE julianday(created_at) >= julianday(?)
                 GROUP BY day ORDER BY day DESC",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

            // Host is the text between the scheme and the first '/'.
            let top_domains = sqlx::query_as::<_, DomainCount>(
                "SELECT CASE
                     WHEN instr(replace(replace(url, 'https://', ''), 'http://', ''), '/') > 0
                     THEN substr(replace(replace(url, 'https://', ''), 'http://', ''), 1,
                                 instr(replace(replace(url, 'https://', ''), 'http://', ''), '/') - 1)
                     ELSE replace(replace(url, 'https://', ''), 'http://', '')
                 END AS domain,
                 COUNT(*) AS count
                 FROM jobs GROUP BY domain ORDER BY count DESC, domain ASC LIMIT 10",
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(JobStats {
                total: total as u64,
                succeeded: succeeded as u64,
                failed: failed as u64,
                active_requesters: active_requesters as u64,
                daily,
                top_domains,
            })
        }
    }

    #[async_trait]
    impl FilterRepo for SqliteStore {
        async fn insert_filter(&self, filter: &FilterSpec) -> MetadataResult<i64> {
            filter.validate()?;
            let result = sqlx::query(
                "INSERT INTO filters (hosts, exclude_query_params, path_pattern, credentials_ref, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(join_hosts(&filter.hosts))
            .bind(filter.exclude_query_params)
            .bind(filter.path_pattern.as_deref().unwrap_or(""))
            .bind(filter.credentials_ref.as_deref().unwrap_or(""))
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }

        async fn update_filter(&self, filter_id: i64, filter: &FilterSpec) -> MetadataResult<()> {
            filter.validate()?;
            let result = sqlx::query(
                "UPDATE filters SET hosts = ?, exclude_query_params = ?, path_pattern = ?, credentials_ref = ?
                 WHERE id = ?",
            )
            .bind(join_hosts(&filter.hosts))
            .bind(filter.exclude_query_params)
            .bind(filter.path_pattern.as_deref().unwrap_or(""))
            .bind(filter.credentials_ref.as_deref().unwrap_or(""))
            .bind(filter_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("filter {filter_id} not found")));
            }
            Ok(())
        }

        async fn delete_filter(&self, filter_id: i64) -> MetadataResult<()> {
            let result = sqlx::query("DELETE FROM filters WHERE id = ?")
                .bind(filter_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("filter {filter_id} not found")));
            }
            Ok(())
        }

        async fn list_filters(&self) -> MetadataResult<Vec<FilterRow>> {
            let rows = sqlx::query_as::<_, FilterRow>("SELECT * FROM filters ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn filter_count(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM filters")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn seed_filters(&self, configured: &[FilterSpec]) -> MetadataResult<usize> {
            let defaults;
            let filters = if configured.is_empty() {
                defaults = default_filters();
                &defaults[..]
            } else {
                configured
            };
            for filter in filters {
                filter.validate()?;
            }

            let mut tx = self.pool.begin().await?;
            let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM filters")
                .fetch_one(&mut *tx)
                .await?;
            if existing > 0 {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            for filter in filters {
                sqlx::query(
                    "INSERT INTO filters (hosts, exclude_query_params, path_pattern, credentials_ref, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(join_hosts(&filter.hosts))
                .bind(filter.exclude_query_params)
                .bind(filter.path_pattern.as_deref().unwrap_or(""))
                .bind(filter.credentials_ref.as_deref().unwrap_or(""))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;

            tracing::info!(count = filters.len(), "Seeded URL filters");
            Ok(filters.len())
        }
    }

    #[async_trait]
    impl LogRepo for SqliteStore {
        async fn insert_log(
            &self,
            level: &str,
            message: &str,
            fields_json: &str,
        ) -> MetadataResult<i64> {
            let result = sqlx::query(
                "INSERT INTO logs (level, message, fields_json, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(level)
            .bind(message)
            .bind(fields_json)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }

        async fn list_logs(&self, filter: &LogFilter) -> MetadataResult<(Vec<LogRow>, u64)> {
            let level = filter.level.as_deref().map(str::to_ascii_uppercase);
            let search = filter
                .search
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| format!("%{s}%"));

            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM logs
                 WHERE (?1 IS NULL OR level = ?1)
                   AND (?2 IS NULL OR message LIKE ?2 OR fields_json LIKE ?2)",
            )
            .bind(&level)
            .bind(&search)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query_as::<_, LogRow>(
                "SELECT * FROM logs
                 WHERE (?1 IS NULL OR level = ?1)
                   AND (?2 IS NULL OR message LIKE ?2 OR fields_json LIKE ?2)
                 ORDER BY id DESC LIMIT ?3 OFFSET ?4",
            )
            .bind(&level)
            .bind(&search)
            .bind(filter.effective_limit() as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await?;

            Ok((rows, total as u64))
        }

        async fn list_logs_since(&self, after_id: i64) -> MetadataResult<Vec<LogRow>> {
            let rows = sqlx::query_as::<_, LogRow>("SELECT * FROM logs WHERE id > ? ORDER BY id")
                .bind(after_id)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }
    }
}
