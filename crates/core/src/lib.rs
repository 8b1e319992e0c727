//! Core domain types shared by the haul crates.
//!
//! This crate defines the data model used by the metadata store and the server:
//! - Access subjects (users and groups) and their approval status
//! - Job lifecycle states and terminal outcomes
//! - URL filters and request fingerprints
//! - Application configuration

pub mod config;
pub mod error;
pub mod filter;
pub mod job;
pub mod subject;

pub use error::{Error, Result};
pub use filter::{Filter, FilterMatch, FilterSet};
pub use job::{JobOutcome, JobStatus};
pub use subject::{AccessStatus, Subject, SubjectKind};
