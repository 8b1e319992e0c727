//! The request admission pipeline.
//!
//! A request flows through: URL filter match, access gate, ledger insert,
//! deduplicated fetch, ledger terminal update, delivery.

use crate::cache::{CacheError, DedupCache};
use crate::delivery::Delivery;
use crate::error::HaulError;
use crate::fetcher::{FetchResult, Fetcher};
use crate::gate::AccessGate;
use crate::ledger::JobLedger;
use haul_core::{FilterSet, JobOutcome, Subject};
use haul_metadata::models::NewJob;
use haul_metadata::repos::FilterRepo;
use haul_metadata::{MetadataResult, MetadataStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// The person sending a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: i64,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    /// One-to-one conversation with the requester.
    #[default]
    Private,
    Group,
}

/// Where a request was sent from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub id: i64,
    #[serde(default)]
    pub kind: OriginKind,
    #[serde(default)]
    pub title: String,
}

impl Origin {
    pub fn private(id: i64) -> Self {
        Self {
            id,
            kind: OriginKind::Private,
            title: String::new(),
        }
    }

    pub fn group(id: i64, title: impl Into<String>) -> Self {
        Self {
            id,
            kind: OriginKind::Group,
            title: title.into(),
        }
    }
}

/// An inbound message that may carry a URL to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub message_id: i64,
    pub text: String,
    pub requester: Requester,
    pub origin: Origin,
}

impl Request {
    /// The subject whose approval admits this request.
    ///
    /// Group origins are admitted at group granularity.
    pub fn subject(&self) -> Subject {
        match self.origin.kind {
            OriginKind::Private => Subject::User(self.requester.id),
            OriginKind::Group => Subject::Group(self.origin.id),
        }
    }

    fn subject_label(&self) -> &str {
        match self.origin.kind {
            OriginKind::Private => &self.requester.label,
            OriginKind::Group => &self.origin.title,
        }
    }
}

/// What happened to a request.
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// No filter matched the message; nothing was recorded.
    Ignored,
    Denied(Subject),
    Delivered {
        job_id: Option<i64>,
        result: FetchResult,
    },
    Failed {
        job_id: Option<i64>,
        error: HaulError,
    },
}

/// Runs requests through the admission pipeline.
pub struct Admission {
    filters: FilterSet,
    gate: AccessGate,
    ledger: JobLedger,
    cache: DedupCache<FetchResult>,
    fetcher: Arc<dyn Fetcher>,
    delivery: Arc<dyn Delivery>,
}

impl Admission {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        filters: FilterSet,
        cache: DedupCache<FetchResult>,
        fetcher: Arc<dyn Fetcher>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            filters,
            gate: AccessGate::new(store.clone()),
            ledger: JobLedger::new(store),
            cache,
            fetcher,
            delivery,
        }
    }

    /// Compile the filters stored in the database.
    pub async fn load_filters(store: &dyn MetadataStore) -> Result<FilterSet, HaulError> {
        let rows = store.list_filters().await?;
        let filters = FilterSet::new(rows.into_iter().map(Into::into).collect())?;
        Ok(filters)
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &DedupCache<FetchResult> {
        &self.cache
    }

    /// Run one request to completion.
    ///
    /// Ledger write failures are logged and do not stop the request.
    pub async fn handle(&self, request: &Request, cancel: &CancellationToken) -> AdmissionOutcome {
        let Some(matched) = self.filters.match_text(&request.text) else {
            return AdmissionOutcome::Ignored;
        };

        let subject = request.subject();
        if !self.gate.admit(subject, request.subject_label()).await {
            return AdmissionOutcome::Denied(subject);
        }

        let url = matched.fingerprint;
        tracing::info!(
            url = %url,
            requester_id = request.requester.id,
            origin_id = request.origin.id,
            "Request admitted"
        );

        let job = NewJob {
            url: url.clone(),
            requester_id: request.requester.id,
            requester_label: request.requester.label.clone(),
            origin_id: request.origin.id,
            created_at: OffsetDateTime::now_utc(),
        };
        let job_id = match self.ledger.insert(&job).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to record job");
                None
            }
        };

        let fetcher = self.fetcher.clone();
        let credentials = matched.filter.credentials_ref.clone();
        let fetch_url = url.clone();
        let fetched = self
            .cache
            .get_or_run(&url, cancel, move |token| async move {
                fetcher
                    .fetch(&fetch_url, credentials.as_deref(), token)
                    .await
            })
            .await;

        match fetched {
            Ok(result) => {
                self.record(
                    job_id,
                    JobOutcome::Success {
                        result_name: result.file_name(),
                    },
                )
                .await;
                if let Err(e) = self.delivery.deliver_result(request, &result).await {
                    tracing::error!(url = %url, error = %e, "Failed to deliver result");
                }
                AdmissionOutcome::Delivered { job_id, result }
            }
            Err(error) => {
                self.record(
                    job_id,
                    JobOutcome::Failed {
                        error: error.to_string(),
                    },
                )
                .await;
                if error != CacheError::Cancelled
                    && let Err(e) = self
                        .delivery
                        .deliver_failure(request, &error.to_string())
                        .await
                {
                    tracing::error!(url = %url, error = %e, "Failed to deliver failure notice");
                }
                AdmissionOutcome::Failed {
                    job_id,
                    error: error.into(),
                }
            }
        }
    }

    async fn record(&self, job_id: Option<i64>, outcome: JobOutcome) {
        let Some(job_id) = job_id else {
            return;
        };
        if let Err(e) = self.ledger.update_terminal(job_id, &outcome).await {
            tracing::warn!(job_id, error = %e, "Failed to record job outcome");
        }
    }

    /// A group's membership changed (e.g. the bot joined it). Registers the
    /// group as pending if it has never been seen.
    pub async fn on_membership_change(&self, group_id: i64, title: &str) -> MetadataResult<()> {
        let row = self.gate.register(Subject::Group(group_id), title).await?;
        if !row.is_approved() {
            tracing::info!(group_id, status = %row.status, "Group awaiting approval");
        }
        Ok(())
    }
}
