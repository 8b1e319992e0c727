//! Forward-only schema migrations.
//!
//! Steps are applied in order, each in its own transaction, and recorded in
//! `schema_migrations` so every step runs exactly once per database. The list
//! is append-only: a step that has shipped is never edited, new schema changes
//! go into a new step at the end.

use crate::error::{MetadataError, MetadataResult};
use sqlx::{Pool, Sqlite};

/// One versioned schema change. Its version is its 1-based position in the list.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Applies a list of migration steps to a database.
#[derive(Debug, Clone, Copy)]
pub struct Migrator<'a> {
    steps: &'a [MigrationStep],
}

impl<'a> Migrator<'a> {
    pub fn new(steps: &'a [MigrationStep]) -> Self {
        Self { steps }
    }

    /// Number of steps this migrator knows about.
    pub fn target_version(&self) -> i64 {
        self.steps.len() as i64
    }

    /// Current schema version (0 for a fresh database).
    pub async fn current_version(&self, pool: &Pool<Sqlite>) -> MetadataResult<i64> {
        ensure_version_table(pool).await?;
        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(pool)
                .await?;
        Ok(version)
    }

    /// Apply every step after the current version. Safe to call on every startup.
    ///
    /// Returns the number of steps applied. A failing step is rolled back and
    /// reported as [`MetadataError::Migration`]; earlier steps stay committed,
    /// so the next run resumes at the failed step.
    pub async fn run(&self, pool: &Pool<Sqlite>) -> MetadataResult<usize> {
        let current = self.current_version(pool).await?;
        if current > self.target_version() {
            return Err(MetadataError::Internal(format!(
                "database schema version {current} is newer than this build supports ({})",
                self.target_version()
            )));
        }

        let mut applied = 0;
        for (index, step) in self.steps.iter().enumerate().skip(current as usize) {
            let version = index + 1;
            apply_step(pool, version, step)
                .await
                .map_err(|source| MetadataError::Migration {
                    step: version,
                    source,
                })?;
            tracing::info!(version, name = step.name, "Applied schema migration");
            applied += 1;
        }

        if applied == 0 {
            tracing::debug!(version = current, "Schema is up to date");
        }
        Ok(applied)
    }
}

async fn ensure_version_table(pool: &Pool<Sqlite>) -> MetadataResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn apply_step(
    pool: &Pool<Sqlite>,
    version: usize,
    step: &MigrationStep,
) -> Result<(), sqlx::Error> {
    // Dropping the transaction on any error rolls the step back.
    let mut tx = pool.begin().await?;
    sqlx::Executor::execute(&mut *tx, step.sql).await?;
    sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
        .bind(version as i64)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Schema history of the haul database.
pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        name: "initial schema",
        sql: r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    requester_id INTEGER NOT NULL,
    requester_label TEXT NOT NULL DEFAULT '',
    origin_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    result_name TEXT NOT NULL DEFAULT '',
    error_text TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_requester ON jobs(requester_id);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    fields_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);

CREATE TABLE IF NOT EXISTS access_groups (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS access_users (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL DEFAULT '',
    added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
"#,
    },
    MigrationStep {
        name: "url filters",
        sql: r#"
CREATE TABLE IF NOT EXISTS filters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hosts TEXT NOT NULL,
    exclude_query_params INTEGER NOT NULL DEFAULT 0,
    path_pattern TEXT NOT NULL DEFAULT '',
    credentials_ref TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
"#,
    },
    MigrationStep {
        // Users added before the approval flow existed keep their access.
        name: "user approval status",
        sql: "ALTER TABLE access_users ADD COLUMN status TEXT NOT NULL DEFAULT 'approved';",
    },
    MigrationStep {
        name: "access status indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_access_users_status ON access_users(status, added_at);
CREATE INDEX IF NOT EXISTS idx_access_groups_status ON access_groups(status, added_at);
"#,
    },
];
