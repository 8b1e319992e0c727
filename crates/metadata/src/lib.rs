//! Metadata store for haul.
//!
//! This crate owns everything haul persists:
//! - Access records for users and groups
//! - The job ledger and its statistics
//! - URL filter rules
//! - Persisted log events
//! - The versioned schema migrator

pub mod error;
pub mod migrations;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use migrations::{MIGRATIONS, MigrationStep, Migrator};
pub use store::{MetadataStore, SqliteStore};

use haul_core::config::MetadataConfig;
use std::sync::Arc;

/// Open and migrate the store described by `config`.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store = SqliteStore::new(config.database_path(), config.busy_timeout_secs).await?;
    Ok(Arc::new(store) as Arc<dyn MetadataStore>)
}
