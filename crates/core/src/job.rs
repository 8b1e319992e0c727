//! Job lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger status of a submitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, work not finished yet.
    Pending,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidStatus(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Terminal result recorded for a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Success { result_name: String },
    Failed { error: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Success { .. } => JobStatus::Success,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Result name column value (empty for failures).
    pub fn result_name(&self) -> &str {
        match self {
            Self::Success { result_name } => result_name,
            Self::Failed { .. } => "",
        }
    }

    /// Error text column value (empty for successes).
    pub fn error_text(&self) -> &str {
        match self {
            Self::Success { .. } => "",
            Self::Failed { error } => error,
        }
    }
}
