//! Shared application state and background tasks.

use crate::admission::Admission;
use crate::cache::DedupCache;
use crate::delivery::Delivery;
use crate::error::HaulResult;
use crate::fetcher::{FetchResult, Fetcher, RemoveArtifact};
use crate::logs::LogBroadcaster;
use crate::sessions::SessionRegistry;
use haul_core::config::AppConfig;
use haul_metadata::MetadataStore;
use haul_metadata::models::FilterSpec;
use haul_metadata::repos::FilterRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval between session registry sweeps.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub admission: Arc<Admission>,
    /// Live log subscribers.
    pub logs: Arc<LogBroadcaster>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    /// Validate the configuration, seed filters into an empty store and wire
    /// the admission pipeline.
    pub async fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        fetcher: Arc<dyn Fetcher>,
        delivery: Arc<dyn Delivery>,
        logs: Arc<LogBroadcaster>,
    ) -> HaulResult<Self> {
        config.validate()?;

        let seeds: Vec<FilterSpec> = config.filters.iter().map(FilterSpec::from).collect();
        metadata.seed_filters(&seeds).await?;
        let filters = Admission::load_filters(metadata.as_ref()).await?;
        tracing::info!(filters = filters.len(), "Loaded URL filters");

        let ttl = config.cache.ttl()?;
        let cache: DedupCache<FetchResult> = if config.cache.remove_artifacts {
            DedupCache::with_eviction_hook(ttl, Arc::new(RemoveArtifact))
        } else {
            DedupCache::new(ttl)
        };

        let admission = Admission::new(metadata.clone(), filters, cache, fetcher, delivery);
        let sessions = SessionRegistry::new(config.sessions.ttl(), config.sessions.max_sessions);

        Ok(Self {
            config: Arc::new(config),
            metadata,
            admission: Arc::new(admission),
            logs,
            sessions: Arc::new(sessions),
        })
    }

    /// Start the cache sweeper and the session sweeper. Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn_background_tasks(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let cache = self.admission.cache().clone();
        let cache_sweeper = cache.start_sweeper(self.config.cache.sweep_interval());
        let cache_stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                cache.stop();
            })
        };

        let sessions = self.sessions.clone();
        let session_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = sessions.sweep();
                        if expired > 0 {
                            tracing::debug!(expired, "Session sweep removed expired sessions");
                        }
                    }
                }
            }
        });

        vec![cache_sweeper, cache_stopper, session_sweeper]
    }
}
