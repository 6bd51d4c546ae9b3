//! Durable sync job rows and the queue contract that stores them.

use crate::error::{PermsSyncError, PermsSyncResult};
use crate::queue::RequestMeta;
use crate::store::StoreResult;
use crate::types::{FetchPermsOptions, Priority, ProviderStatusesSet, SetPermissionsResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Reason recorded when a queued job is replaced by a more urgent one.
pub const CANCELLATION_REASON_HIGHER_PRIORITY: &str = "A job with higher priority was added.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
    Canceled
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Errored => "errored",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Canceled => "canceled"
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "errored" => Self::Errored,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            "canceled" => Self::Canceled,
            _ => return None
        })
    }

    /// No further processing will happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum JobPriority {
    #[default]
    Low,
    Medium,
    High
}

impl JobPriority {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Medium => 5,
            Self::High => 10
        }
    }

    /// Unknown values fall back to `Low`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            10 => Self::High,
            5 => Self::Medium,
            _ => Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH"
        }
    }

    /// Medium and high jobs both jump the in-memory queue.
    pub fn queue_priority(self) -> Priority {
        match self {
            Self::Low => Priority::Low,
            Self::Medium | Self::High => Priority::High
        }
    }
}

impl From<Priority> for JobPriority {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => Self::Low,
            Priority::High => Self::High
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonGroup {
    Manual,
    Webhook,
    Schedule,
    Internal,
    Unknown
}

impl ReasonGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Webhook => "WEBHOOK",
            Self::Schedule => "SCHEDULE",
            Self::Internal => "INTERNAL",
            Self::Unknown => "UNKNOWN"
        }
    }

    pub fn reasons(self) -> Vec<SyncJobReason> {
        SyncJobReason::ALL
            .iter()
            .copied()
            .filter(|r| r.group() == self)
            .collect()
    }
}

/// Why a sync job was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncJobReason {
    UserOutdatedPerms,
    UserNoPerms,
    RepoOutdatedPerms,
    RepoNoPerms,
    RepoUpdatedFromCodeHost,
    UserEmailRemoved,
    UserEmailVerified,
    UserAdded,
    UserAddedToOrg,
    UserRemovedFromOrg,
    UserAcceptedOrgInvite,
    ExternalAccountAdded,
    ExternalAccountDeleted,
    GitHubUserEvent,
    GitHubUserAddedEvent,
    GitHubUserRemovedEvent,
    GitHubUserMembershipAddedEvent,
    GitHubUserMembershipRemovedEvent,
    GitHubTeamAddedToRepoEvent,
    GitHubTeamRemovedFromRepoEvent,
    GitHubOrgMemberAddedEvent,
    GitHubOrgMemberRemovedEvent,
    GitHubRepoEvent,
    GitHubRepoMadePrivateEvent,
    ManualRepoSync,
    ManualUserSync
}

impl SyncJobReason {
    pub const ALL: [Self; 26] = [
        Self::UserOutdatedPerms,
        Self::UserNoPerms,
        Self::RepoOutdatedPerms,
        Self::RepoNoPerms,
        Self::RepoUpdatedFromCodeHost,
        Self::UserEmailRemoved,
        Self::UserEmailVerified,
        Self::UserAdded,
        Self::UserAddedToOrg,
        Self::UserRemovedFromOrg,
        Self::UserAcceptedOrgInvite,
        Self::ExternalAccountAdded,
        Self::ExternalAccountDeleted,
        Self::GitHubUserEvent,
        Self::GitHubUserAddedEvent,
        Self::GitHubUserRemovedEvent,
        Self::GitHubUserMembershipAddedEvent,
        Self::GitHubUserMembershipRemovedEvent,
        Self::GitHubTeamAddedToRepoEvent,
        Self::GitHubTeamRemovedFromRepoEvent,
        Self::GitHubOrgMemberAddedEvent,
        Self::GitHubOrgMemberRemovedEvent,
        Self::GitHubRepoEvent,
        Self::GitHubRepoMadePrivateEvent,
        Self::ManualRepoSync,
        Self::ManualUserSync
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserOutdatedPerms => "REASON_USER_OUTDATED_PERMS",
            Self::UserNoPerms => "REASON_USER_NO_PERMS",
            Self::RepoOutdatedPerms => "REASON_REPO_OUTDATED_PERMS",
            Self::RepoNoPerms => "REASON_REPO_NO_PERMS",
            Self::RepoUpdatedFromCodeHost => "REASON_REPO_UPDATED_FROM_CODE_HOST",
            Self::UserEmailRemoved => "REASON_USER_EMAIL_REMOVED",
            Self::UserEmailVerified => "REASON_USER_EMAIL_VERIFIED",
            Self::UserAdded => "REASON_USER_ADDED",
            Self::UserAddedToOrg => "REASON_USER_ADDED_TO_ORG",
            Self::UserRemovedFromOrg => "REASON_USER_REMOVED_FROM_ORG",
            Self::UserAcceptedOrgInvite => "REASON_USER_ACCEPTED_ORG_INVITE",
            Self::ExternalAccountAdded => "REASON_EXTERNAL_ACCOUNT_ADDED",
            Self::ExternalAccountDeleted => "REASON_EXTERNAL_ACCOUNT_DELETED",
            Self::GitHubUserEvent => "REASON_GITHUB_USER_EVENT",
            Self::GitHubUserAddedEvent => "REASON_GITHUB_USER_ADDED_EVENT",
            Self::GitHubUserRemovedEvent => "REASON_GITHUB_USER_REMOVED_EVENT",
            Self::GitHubUserMembershipAddedEvent => "REASON_GITHUB_USER_MEMBERSHIP_ADDED_EVENT",
            Self::GitHubUserMembershipRemovedEvent => "REASON_GITHUB_USER_MEMBERSHIP_REMOVED_EVENT",
            Self::GitHubTeamAddedToRepoEvent => "REASON_GITHUB_TEAM_ADDED_TO_REPO_EVENT",
            Self::GitHubTeamRemovedFromRepoEvent => "REASON_GITHUB_TEAM_REMOVED_FROM_REPO_EVENT",
            Self::GitHubOrgMemberAddedEvent => "REASON_GITHUB_ORG_MEMBER_ADDED_EVENT",
            Self::GitHubOrgMemberRemovedEvent => "REASON_GITHUB_ORG_MEMBER_REMOVED_EVENT",
            Self::GitHubRepoEvent => "REASON_GITHUB_REPO_EVENT",
            Self::GitHubRepoMadePrivateEvent => "REASON_GITHUB_REPO_MADE_PRIVATE_EVENT",
            Self::ManualRepoSync => "REASON_MANUAL_REPO_SYNC",
            Self::ManualUserSync => "REASON_MANUAL_USER_SYNC"
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == s)
    }

    pub fn group(self) -> ReasonGroup {
        match self {
            Self::ManualRepoSync | Self::ManualUserSync => ReasonGroup::Manual,
            Self::GitHubUserEvent
            | Self::GitHubUserAddedEvent
            | Self::GitHubUserRemovedEvent
            | Self::GitHubUserMembershipAddedEvent
            | Self::GitHubUserMembershipRemovedEvent
            | Self::GitHubTeamAddedToRepoEvent
            | Self::GitHubTeamRemovedFromRepoEvent
            | Self::GitHubOrgMemberAddedEvent
            | Self::GitHubOrgMemberRemovedEvent
            | Self::GitHubRepoEvent
            | Self::GitHubRepoMadePrivateEvent => ReasonGroup::Webhook,
            Self::UserOutdatedPerms
            | Self::UserNoPerms
            | Self::RepoOutdatedPerms
            | Self::RepoNoPerms
            | Self::RepoUpdatedFromCodeHost => ReasonGroup::Schedule,
            Self::UserEmailRemoved
            | Self::UserEmailVerified
            | Self::UserAdded
            | Self::UserAddedToOrg
            | Self::UserRemovedFromOrg
            | Self::UserAcceptedOrgInvite
            | Self::ExternalAccountAdded
            | Self::ExternalAccountDeleted => ReasonGroup::Internal
        }
    }
}

impl fmt::Display for SyncJobReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the durable job table. Exactly one of `user_id` and
/// `repository_id` is set on a valid row.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionSyncJob {
    pub id: i64,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub reason: Option<SyncJobReason>,
    pub cancellation_reason: Option<String>,
    pub triggered_by_user_id: Option<i32>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_resets: i32,
    pub num_failures: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_hostname: String,
    pub cancel: bool,
    pub repository_id: Option<i32>,
    pub user_id: Option<i32>,
    pub priority: JobPriority,
    pub no_perms: bool,
    pub invalidate_caches: bool,
    pub permissions_added: i32,
    pub permissions_removed: i32,
    pub permissions_found: i32,
    pub code_host_states: ProviderStatusesSet,
    pub is_partial_success: bool
}

impl PermissionSyncJob {
    /// Translates the row into an in-memory sync request.
    pub fn to_request(&self) -> PermsSyncResult<RequestMeta> {
        let priority = self.priority.queue_priority();
        let meta = match (self.user_id, self.repository_id) {
            (Some(user_id), None) => RequestMeta::user(user_id, priority),
            (None, Some(repo_id)) => RequestMeta::repo(repo_id, priority),
            (Some(_), Some(_)) => {
                return Err(PermsSyncError::InvalidJob {
                    job_id: self.id,
                    reason: "both user and repository are set".to_string()
                });
            }
            (None, None) => {
                return Err(PermsSyncError::InvalidJob {
                    job_id: self.id,
                    reason: "neither user nor repository is set".to_string()
                });
            }
        };
        Ok(meta
            .with_no_perms(self.no_perms)
            .with_options(FetchPermsOptions {
                invalidate_caches: self.invalidate_caches
            }))
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSyncJob {
    pub reason: Option<SyncJobReason>,
    pub priority: JobPriority,
    pub triggered_by_user_id: Option<i32>,
    /// Delayed jobs skip duplicate detection.
    pub process_after: Option<DateTime<Utc>>,
    pub no_perms: bool,
    pub invalidate_caches: bool
}

/// What the handler reports back onto a job row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncJobResult {
    pub result: SetPermissionsResult,
    /// The sync committed but at least one provider call failed.
    pub partial_success: bool,
    pub provider_states: ProviderStatusesSet
}

/// Outcome of a stalled-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetStats {
    pub reset: u64,
    pub failed: u64
}

/// Durable, crash-recoverable queue of sync jobs.
///
/// Dequeue order is priority first, user jobs before repository jobs, then
/// oldest first.
#[async_trait]
pub trait SyncJobQueue: Send + Sync {
    /// Creates an immediate or delayed user job. Returns `None` when an
    /// equal or higher priority immediate job is already queued.
    async fn create_user_sync_job(&self, user_id: i32, job: &NewSyncJob)
    -> StoreResult<Option<i64>>;

    async fn create_repo_sync_job(&self, repo_id: i32, job: &NewSyncJob)
    -> StoreResult<Option<i64>>;

    /// Claims the next due job and marks it processing.
    async fn dequeue(&self, worker_hostname: &str) -> StoreResult<Option<PermissionSyncJob>>;

    async fn heartbeat(&self, job_ids: &[i64]) -> StoreResult<()>;

    async fn mark_completed(&self, job_id: i64, result: &SyncJobResult) -> StoreResult<()>;

    /// Records a failure. The job becomes `failed` once it has failed
    /// `max_num_failures` times, `errored` otherwise. Returns the new state.
    async fn mark_errored(
        &self,
        job_id: i64,
        failure_message: &str,
        provider_states: &ProviderStatusesSet,
        max_num_failures: i32
    ) -> StoreResult<JobState>;

    /// Requeues processing jobs without a heartbeat for `stalled_after`.
    /// Jobs already reset `max_num_resets` times are failed instead.
    async fn reset_stalled(&self, stalled_after: Duration, max_num_resets: i32)
    -> StoreResult<ResetStats>;

    async fn cancel(&self, job_id: i64, reason: &str) -> StoreResult<bool>;
}
