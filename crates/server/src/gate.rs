//! Admission control over persisted access records.

use crate::metrics::ADMISSIONS_DENIED;
use haul_core::{AccessStatus, Subject, SubjectKind};
use haul_metadata::models::AccessSubjectRow;
use haul_metadata::repos::AccessRepo;
use haul_metadata::{MetadataResult, MetadataStore};
use std::sync::Arc;

/// Access gate for users and groups.
///
/// Subjects move between pending, approved and rejected. Contact only ever
/// registers a subject (pending on first sight, label refresh afterwards);
/// status changes come from operators.
#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn MetadataStore>,
}

impl AccessGate {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Record contact from `subject`, returning its current row.
    pub async fn register(&self, subject: Subject, label: &str) -> MetadataResult<AccessSubjectRow> {
        self.store.register_subject(subject, label).await
    }

    pub async fn approve(&self, subject: Subject) -> MetadataResult<()> {
        self.store
            .set_subject_status(subject, AccessStatus::Approved)
            .await?;
        tracing::info!(subject = %subject, "Subject approved");
        Ok(())
    }

    pub async fn reject(&self, subject: Subject) -> MetadataResult<()> {
        self.store
            .set_subject_status(subject, AccessStatus::Rejected)
            .await?;
        tracing::info!(subject = %subject, "Subject rejected");
        Ok(())
    }

    /// Approve `subject` directly, creating its row if needed.
    pub async fn grant(&self, subject: Subject, label: &str) -> MetadataResult<()> {
        self.store.grant_subject(subject, label).await?;
        tracing::info!(subject = %subject, "Subject granted access");
        Ok(())
    }

    /// Delete `subject`'s row. Its next contact starts over as pending.
    pub async fn remove(&self, subject: Subject) -> MetadataResult<()> {
        self.store.remove_subject(subject).await?;
        tracing::info!(subject = %subject, "Subject removed");
        Ok(())
    }

    pub async fn is_allowed(&self, subject: Subject) -> MetadataResult<bool> {
        self.store.is_subject_allowed(subject).await
    }

    pub async fn get(&self, subject: Subject) -> MetadataResult<Option<AccessSubjectRow>> {
        self.store.get_subject(subject).await
    }

    pub async fn list(
        &self,
        kind: SubjectKind,
        status: Option<AccessStatus>,
    ) -> MetadataResult<Vec<AccessSubjectRow>> {
        self.store.list_subjects(kind, status).await
    }

    /// Register `subject` and decide whether its request may proceed.
    ///
    /// Only approved subjects are admitted. A store failure denies.
    pub async fn admit(&self, subject: Subject, label: &str) -> bool {
        match self.store.register_subject(subject, label).await {
            Ok(row) if row.is_approved() => true,
            Ok(row) => {
                ADMISSIONS_DENIED.inc();
                tracing::debug!(subject = %subject, status = %row.status, "Admission denied");
                false
            }
            Err(e) => {
                ADMISSIONS_DENIED.inc();
                tracing::warn!(subject = %subject, error = %e, "Access check failed, denying request");
                false
            }
        }
    }
}
