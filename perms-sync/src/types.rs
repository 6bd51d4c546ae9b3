use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub type UserId = i32;
pub type RepoId = i32;
pub type ExternalAccountId = i32;

/// Source of the current time; swapped for a fixed clock in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Which side of the user/repo relation a sync request reconciles.
///
/// Declaration order matters: `User` compares greater than `Repo` and wins
/// ties in the request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Repo,
    User
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repo => "repo",
            Self::User => "user"
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Low,
    High
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPermsOptions {
    /// Ask providers to bypass their internal caches (e.g. group memberships).
    pub invalidate_caches: bool
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub created_at: DateTime<Utc>
}

/// Identity of a repository on its code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalRepoSpec {
    pub id: String,
    pub service_type: String,
    pub service_id: String
}

impl ExternalRepoSpec {
    pub fn new(
        id: impl Into<String>,
        service_type: impl Into<String>,
        service_id: impl Into<String>
    ) -> Self {
        Self {
            id: id.into(),
            service_type: service_type.into(),
            service_id: service_id.into()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: RepoId,
    pub name: String,
    pub private: bool,
    /// URNs of the code host connections this repo was discovered through.
    pub sources: BTreeSet<String>,
    pub external_repo: ExternalRepoSpec,
    pub created_at: DateTime<Utc>
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MinimalRepo {
    pub id: RepoId,
    pub name: String
}

/// Link between an internal user and a code host identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAccount {
    pub id: ExternalAccountId,
    pub user_id: UserId,
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
    pub expired_at: Option<DateTime<Utc>>,
    pub last_valid_at: Option<DateTime<Utc>>
}

impl ExternalAccount {
    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }

    pub fn matches_service(&self, service_type: &str, service_id: &str) -> bool {
        self.service_type == service_type && self.service_id == service_id
    }
}

/// A batch of code host account IDs belonging to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAccounts {
    pub service_type: String,
    pub service_id: String,
    pub account_ids: Vec<String>
}

/// Path-level rules layered beneath full repository access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRepoPermissions {
    pub paths: Vec<String>
}

/// Permissions reported by a provider for one external account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalUserPermissions {
    /// Exact external repository IDs.
    pub exacts: Vec<String>,
    /// Prefix rules granting access.
    pub include_contains: Vec<String>,
    /// Prefix rules carving exceptions out of `include_contains`.
    pub exclude_contains: Vec<String>,
    /// Keyed by external repository ID.
    pub sub_repo_permissions: HashMap<String, SubRepoPermissions>
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPermissionsResult {
    pub added: u32,
    pub removed: u32,
    pub found: u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Error
}

/// Outcome of a single provider call made during a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub provider_type: String,
    pub status: SyncStatus,
    pub message: String
}

impl ProviderStatus {
    pub fn new(
        provider_id: &str,
        provider_type: &str,
        operation: &str,
        error: Option<&dyn std::error::Error>
    ) -> Self {
        let (status, message) = match error {
            Some(e) => (SyncStatus::Error, format!("{}: {}", operation, e)),
            None => (SyncStatus::Success, operation.to_string())
        };
        Self {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status,
            message
        }
    }
}

/// Ordered provider outcomes collected during one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderStatusesSet(pub Vec<ProviderStatus>);

impl ProviderStatusesSet {
    pub fn push(&mut self, status: ProviderStatus) {
        self.0.push(status);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProviderStatus> {
        self.0.iter()
    }

    /// Returns `(total, succeeded, failed)`.
    pub fn count_statuses(&self) -> (usize, usize, usize) {
        let succeeded = self
            .0
            .iter()
            .filter(|s| s.status == SyncStatus::Success)
            .count();
        (self.0.len(), succeeded, self.0.len() - succeeded)
    }
}

impl IntoIterator for ProviderStatusesSet {
    type Item = ProviderStatus;
    type IntoIter = std::vec::IntoIter<ProviderStatus>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
