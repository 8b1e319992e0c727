//! Access subjects and their approval lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of subject an access record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            other => Err(crate::Error::InvalidSubject(format!(
                "unknown subject kind '{other}'"
            ))),
        }
    }
}

/// A requester identity subject to admission control.
///
/// Users and groups share one approval lifecycle, so everything that reasons
/// about access is written once against this variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Subject {
    User(i64),
    Group(i64),
}

impl Subject {
    /// Build a subject from its kind and numeric id.
    pub fn new(kind: SubjectKind, id: i64) -> Self {
        match kind {
            SubjectKind::User => Self::User(id),
            SubjectKind::Group => Self::Group(id),
        }
    }

    pub fn kind(&self) -> SubjectKind {
        match self {
            Self::User(_) => SubjectKind::User,
            Self::Group(_) => SubjectKind::Group,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::User(id) | Self::Group(id) => *id,
        }
    }

    /// Reject identifiers that can never name a real subject.
    ///
    /// Group ids are negative on most chat platforms, so only zero is refused.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id() == 0 {
            return Err(crate::Error::InvalidSubject(format!(
                "{} id must be non-zero",
                self.kind()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Approval status of an access subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatus {
    /// Seen but not yet decided by an operator.
    Pending,
    /// Allowed to submit jobs.
    Approved,
    /// Explicitly refused.
    Rejected,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(crate::Error::InvalidStatus(format!(
                "unknown access status '{other}'"
            ))),
        }
    }
}
