//! Access subject repository.

use crate::error::MetadataResult;
use crate::models::AccessSubjectRow;
use async_trait::async_trait;
use haul_core::{AccessStatus, Subject, SubjectKind};

/// Repository for user and group access records.
///
/// Every subject has at most one row. Status only changes through
/// `approve`, `reject`, `grant` and `remove`; registering never touches it.
#[async_trait]
pub trait AccessRepo: Send + Sync {
    /// Record contact from a subject.
    ///
    /// Unseen subjects are inserted as pending. Known subjects only get their
    /// label refreshed. Returns the row as stored afterwards.
    async fn register_subject(&self, subject: Subject, label: &str)
    -> MetadataResult<AccessSubjectRow>;

    /// Set an existing subject's status. Fails with `NotFound` for unknown subjects.
    async fn set_subject_status(&self, subject: Subject, status: AccessStatus)
    -> MetadataResult<()>;

    /// Insert or overwrite a subject as approved (operator allow-list).
    async fn grant_subject(&self, subject: Subject, label: &str) -> MetadataResult<()>;

    /// Delete a subject's row. Later contact re-enters as pending.
    async fn remove_subject(&self, subject: Subject) -> MetadataResult<()>;

    /// Get a subject's row.
    async fn get_subject(&self, subject: Subject) -> MetadataResult<Option<AccessSubjectRow>>;

    /// True iff the subject exists and is approved.
    async fn is_subject_allowed(&self, subject: Subject) -> MetadataResult<bool>;

    /// List subjects of a kind, newest first, optionally restricted to a status.
    async fn list_subjects(
        &self,
        kind: SubjectKind,
        status: Option<AccessStatus>,
    ) -> MetadataResult<Vec<AccessSubjectRow>>;
}
