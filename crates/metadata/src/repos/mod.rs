//! Repository traits for metadata operations.

pub mod access;
pub mod filters;
pub mod jobs;
pub mod logs;

pub use access::AccessRepo;
pub use filters::FilterRepo;
pub use jobs::JobRepo;
pub use logs::LogRepo;
