//! Job admission service for haul.
//!
//! This crate provides the runtime side of haul:
//! - Deduplicating result cache with TTL reuse and background eviction
//! - Access gate and job ledger over the metadata store
//! - The admission pipeline with its fetcher and delivery seams
//! - Log fan-out and persistence, operator sessions, metrics

pub mod admission;
pub mod cache;
pub mod delivery;
pub mod error;
pub mod fetcher;
pub mod gate;
pub mod ledger;
pub mod logs;
pub mod metrics;
pub mod sessions;
pub mod state;

pub use admission::{Admission, AdmissionOutcome, Origin, OriginKind, Request, Requester};
pub use cache::{CacheError, DedupCache, EvictionHook};
pub use error::{HaulError, HaulResult};
pub use gate::AccessGate;
pub use ledger::JobLedger;
pub use state::AppState;
