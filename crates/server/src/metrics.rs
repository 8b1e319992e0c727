//! Prometheus metrics for haul.
//!
//! Counters cover the dedup cache, admission decisions and job outcomes.
//! Call [`register_metrics`] once at startup; [`encode_metrics`] renders the
//! text exposition format.

use prometheus::{self, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Dedup cache metrics
pub static CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "haul_cache_hits_total",
        "Requests served from a ready cache entry",
    )
    .expect("metric creation failed")
});

pub static CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "haul_cache_misses_total",
        "Requests that started a new execution",
    )
    .expect("metric creation failed")
});

pub static CACHE_JOINS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "haul_cache_joins_total",
        "Requests that waited on an in-progress execution",
    )
    .expect("metric creation failed")
});

pub static CACHE_EVICTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "haul_cache_evictions_total",
        "Expired cache entries removed by the sweeper",
    )
    .expect("metric creation failed")
});

pub static CACHE_CLEANUP_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "haul_cache_cleanup_failures_total",
        "Eviction side-effect cleanups that failed",
    )
    .expect("metric creation failed")
});

pub static CACHE_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("haul_cache_entries", "Entries currently held by the cache")
        .expect("metric creation failed")
});

// Admission and job metrics
pub static ADMISSIONS_DENIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "haul_admissions_denied_total",
        "Requests rejected by the access gate",
    )
    .expect("metric creation failed")
});

pub static JOBS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("haul_jobs_finished_total", "Jobs by terminal status"),
        &["status"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(CACHE_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_MISSES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_JOINS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_EVICTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_CLEANUP_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_ENTRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ADMISSIONS_DENIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_FINISHED.clone()))
            .expect("metric registration failed");
    });
}

/// Render all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
