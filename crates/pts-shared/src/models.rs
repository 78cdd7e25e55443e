//! # Core Data Models
//!
//! Durable entities shared by the mail engines, the control processor and
//! the task engine. Persistence is behind the [`Storage`](crate::storage::Storage)
//! contract; these types are plain data.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tracked subject, identified by its unique name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub kind: PackageKind,
}

/// Real source packages and pseudo-packages (tracked names that are not
/// actual software packages, e.g. "installation-reports").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageKind {
    Source,
    Pseudo,
}

impl Package {
    pub fn source(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PackageKind::Source,
        }
    }

    pub fn pseudo(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PackageKind::Pseudo,
        }
    }
}

/// A participant identified by email address.
///
/// Addresses are normalized to lower case so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailUser {
    pub email: String,
}

impl EmailUser {
    pub fn new(email: &str) -> Self {
        Self {
            email: normalize_email(email),
        }
    }
}

/// Normalize an address for storage and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Topic tag attached to a dispatched message, used to filter subscribers.
///
/// The built-in vocabulary is closed; vendors may classify into additional
/// keywords via `Other`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Keyword {
    Default,
    Bts,
    BtsControl,
    UploadSource,
    UploadBinary,
    Archive,
    Other(String),
}

impl Keyword {
    /// The keyword set a fresh subscription accepts.
    pub fn default_set() -> BTreeSet<Keyword> {
        [
            Keyword::Default,
            Keyword::Bts,
            Keyword::BtsControl,
            Keyword::UploadSource,
            Keyword::UploadBinary,
            Keyword::Archive,
        ]
        .into_iter()
        .collect()
    }

    pub fn as_str(&self) -> &str {
        match self {
            Keyword::Default => "default",
            Keyword::Bts => "bts",
            Keyword::BtsControl => "bts-control",
            Keyword::UploadSource => "upload-source",
            Keyword::UploadBinary => "upload-binary",
            Keyword::Archive => "archive",
            Keyword::Other(name) => name,
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Keyword {
    fn from(s: &str) -> Self {
        match s {
            "default" => Keyword::Default,
            "bts" => Keyword::Bts,
            "bts-control" => Keyword::BtsControl,
            "upload-source" => Keyword::UploadSource,
            "upload-binary" => Keyword::UploadBinary,
            "archive" => Keyword::Archive,
            other => Keyword::Other(other.to_string()),
        }
    }
}

impl FromStr for Keyword {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Keyword::from(s))
    }
}

impl Serialize for Keyword {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Keyword {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Keyword::from(s.as_str()))
    }
}

/// The (package, user) subscription with its allowed-keyword set.
///
/// A user receives a dispatched message iff an active subscription exists
/// and the message keyword is in the allowed set. At most one subscription
/// exists per (package, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub package: String,
    pub email: String,
    pub active: bool,
    pub keywords: BTreeSet<Keyword>,
}

impl Subscription {
    pub fn new(package: &str, email: &str) -> Self {
        Self {
            package: package.to_string(),
            email: normalize_email(email),
            active: true,
            keywords: Keyword::default_set(),
        }
    }

    pub fn accepts(&self, keyword: &Keyword) -> bool {
        self.active && self.keywords.contains(keyword)
    }
}

/// A named group of users. Public teams permit self-join by email
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub slug: String,
    pub name: String,
    pub owner_email: String,
    pub public: bool,
    pub members: BTreeSet<String>,
}

impl Team {
    pub fn new(slug: &str, name: &str, owner_email: &str, public: bool) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            owner_email: normalize_email(owner_email),
            public,
            members: BTreeSet::new(),
        }
    }
}

/// Per-day bounce statistics for one user. Append-only time series,
/// aggregated by calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceRecord {
    pub email: String,
    pub date: NaiveDate,
    pub sent_count: u32,
    pub bounced_count: u32,
}

impl BounceRecord {
    pub fn new(email: &str, date: NaiveDate) -> Self {
        Self {
            email: normalize_email(email),
            date,
            sent_count: 0,
            bounced_count: 0,
        }
    }
}

/// A pending one-time confirmation token bound to a command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfirmation {
    pub token: String,
    /// The canonical command text to re-execute on confirmation.
    pub command: String,
    pub requester: String,
    pub created_at: DateTime<Utc>,
}

impl CommandConfirmation {
    pub fn new(command: &str, requester: &str) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            command: command.to_string(),
            requester: normalize_email(requester),
            created_at: Utc::now(),
        }
    }
}

/// Persistent record of one job run of the task engine.
///
/// The task engine owns the logical `JobState`; this is its storage shape,
/// referenced by opaque identifier only (no back-pointers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningJob {
    pub id: Uuid,
    pub initial_task_name: String,
    pub additional_parameters: Option<serde_json::Value>,
    /// Serialized events and processed-task names.
    pub state: serde_json::Value,
    pub is_complete: bool,
}
