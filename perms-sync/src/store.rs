//! Store contracts consumed by the syncer, scheduler and dispatcher.
//!
//! The permission tables and repository catalogue live outside this crate;
//! only the operations the sync algorithms need are modelled here.

use crate::types::{
    Clock, ExternalAccount, ExternalAccounts, ExternalRepoSpec, MinimalRepo, Priority,
    ProviderStatusesSet, Repo, RepoId, RequestType, SetPermissionsResult, SubRepoPermissions,
    User, UserId, system_clock
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

/// Staleness statistics for the permission tables.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PermsMetrics {
    pub users_with_stale_perms: i64,
    pub users_perms_gap_seconds: f64,
    pub repos_with_stale_perms: i64,
    pub repos_perms_gap_seconds: f64,
    pub sub_repos_with_stale_perms: i64,
    pub sub_repos_perms_gap_seconds: f64
}

#[async_trait]
pub trait PermsStore: Send + Sync {
    async fn load_user_permissions(&self, user_id: UserId) -> StoreResult<BTreeSet<RepoId>>;

    async fn load_repo_permissions(&self, repo_id: RepoId) -> StoreResult<BTreeSet<UserId>>;

    /// Replaces the user's readable repository set.
    async fn set_user_permissions(
        &self,
        user_id: UserId,
        repo_ids: &BTreeSet<RepoId>
    ) -> StoreResult<SetPermissionsResult>;

    /// Bumps the freshness timestamp without changing contents.
    async fn touch_user_permissions(&self, user_id: UserId) -> StoreResult<()>;

    async fn touch_repo_permissions(&self, repo_id: RepoId) -> StoreResult<()>;

    /// Maps code host account IDs to internal user IDs. Unknown accounts are
    /// absent from the result.
    async fn get_user_ids_by_external_accounts(
        &self,
        accounts: &ExternalAccounts
    ) -> StoreResult<HashMap<String, UserId>>;

    /// Repositories the user was last granted through the given service.
    async fn fetch_repos_by_user_and_external_service(
        &self,
        user_id: UserId,
        service_type: &str,
        service_id: &str
    ) -> StoreResult<Vec<RepoId>>;

    async fn user_ids_with_no_perms(&self) -> StoreResult<Vec<UserId>>;

    /// Private repositories that have never been synced.
    async fn repo_ids_with_no_perms(&self) -> StoreResult<Vec<RepoId>>;

    /// Up to `limit` users whose last sync is older than `age`, oldest
    /// first, with their last sync time.
    async fn user_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<Vec<(UserId, DateTime<Utc>)>>;

    async fn repo_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<Vec<(RepoId, DateTime<Utc>)>>;

    async fn metrics(&self, stale_age: Duration) -> StoreResult<PermsMetrics>;

    async fn transact(&self) -> StoreResult<Box<dyn PermsTransaction>>;
}

/// Repo-centric writes that must land together.
#[async_trait]
pub trait PermsTransaction: Send {
    async fn set_repo_permissions(
        &mut self,
        repo_id: RepoId,
        user_ids: &BTreeSet<UserId>
    ) -> StoreResult<SetPermissionsResult>;

    /// Records grants for accounts that have no internal user yet.
    async fn set_repo_pending_permissions(
        &mut self,
        accounts: &ExternalAccounts,
        repo_id: RepoId
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Filter for [`RepoStore::list_minimal_repos`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReposListOptions {
    pub only_private: bool,
    pub external_repos: Vec<ExternalRepoSpec>,
    pub external_repo_include_contains: Vec<ExternalRepoSpec>,
    pub external_repo_exclude_contains: Vec<ExternalRepoSpec>
}

impl ReposListOptions {
    /// Evaluates the prefix rules against one repository. The longest
    /// matching include wins unless a strictly longer exclude also matches,
    /// so an exclude identical to an include has no effect.
    pub fn matches_contains(&self, spec: &ExternalRepoSpec) -> bool {
        fn longest(rules: &[ExternalRepoSpec], spec: &ExternalRepoSpec) -> Option<usize> {
            rules
                .iter()
                .filter(|r| {
                    r.service_type == spec.service_type
                        && r.service_id == spec.service_id
                        && spec.id.starts_with(&r.id)
                })
                .map(|r| r.id.len())
                .max()
        }

        let Some(include) = longest(&self.external_repo_include_contains, spec) else {
            return false;
        };
        match longest(&self.external_repo_exclude_contains, spec) {
            Some(exclude) => exclude <= include,
            None => true
        }
    }
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn get(&self, repo_id: RepoId) -> StoreResult<Option<Repo>>;

    async fn list_minimal_repos(&self, options: &ReposListOptions) -> StoreResult<Vec<MinimalRepo>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, user_id: UserId) -> StoreResult<Option<User>>;

    async fn verified_emails(&self, user_id: UserId) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalAccountsListOptions {
    pub user_id: UserId,
    pub service_type: Option<String>,
    pub exclude_expired: bool,
    pub only_expired: bool
}

#[async_trait]
pub trait ExternalAccountsStore: Send + Sync {
    async fn list(&self, options: &ExternalAccountsListOptions) -> StoreResult<Vec<ExternalAccount>>;

    /// Inserts or updates the account and returns the stored row.
    async fn upsert(&self, account: &ExternalAccount) -> StoreResult<ExternalAccount>;

    async fn touch_expired(&self, account_id: i32) -> StoreResult<()>;

    async fn touch_last_valid(&self, account_id: i32) -> StoreResult<()>;
}

#[async_trait]
pub trait SubRepoPermsStore: Send + Sync {
    async fn upsert_with_spec(
        &self,
        user_id: UserId,
        spec: &ExternalRepoSpec,
        perms: &SubRepoPermissions
    ) -> StoreResult<()>;

    async fn get_by_user_and_service(
        &self,
        user_id: UserId,
        service_type: &str,
        service_id: &str
    ) -> StoreResult<HashMap<ExternalRepoSpec, SubRepoPermissions>>;
}

/// Observability record of one processed sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub request_type: RequestType,
    pub id: i32,
    pub priority: Priority,
    pub no_perms: bool,
    pub invalidate_caches: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Option<SetPermissionsResult>,
    pub provider_states: ProviderStatusesSet,
    pub failure_message: Option<String>
}

#[async_trait]
pub trait SyncRecordsStore: Send + Sync {
    async fn record(&self, record: &SyncRecord) -> StoreResult<()>;

    /// Finish time of the latest successful sync for the entity.
    async fn latest_finished_sync(
        &self,
        request_type: RequestType,
        id: i32
    ) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Handles to every store the engine talks to.
#[derive(Clone)]
pub struct Stores {
    pub perms: Arc<dyn PermsStore>,
    pub repos: Arc<dyn RepoStore>,
    pub users: Arc<dyn UserStore>,
    pub external_accounts: Arc<dyn ExternalAccountsStore>,
    pub sub_repo_perms: Arc<dyn SubRepoPermsStore>,
    pub sync_records: Arc<dyn SyncRecordsStore>,
    pub clock: Clock
}

impl Stores {
    pub fn new(
        perms: Arc<dyn PermsStore>,
        repos: Arc<dyn RepoStore>,
        users: Arc<dyn UserStore>,
        external_accounts: Arc<dyn ExternalAccountsStore>,
        sub_repo_perms: Arc<dyn SubRepoPermsStore>,
        sync_records: Arc<dyn SyncRecordsStore>
    ) -> Self {
        Self {
            perms,
            repos,
            users,
            external_accounts,
            sub_repo_perms,
            sync_records,
            clock: system_clock()
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
