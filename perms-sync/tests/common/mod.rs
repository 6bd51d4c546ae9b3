#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use errors::{ProviderError, StoreError};
use parking_lot::Mutex;
use perms_sync::provider::{AuthzProvider, FetchResult, ProviderRegistry};
use perms_sync::store::{
    ExternalAccountsListOptions, ExternalAccountsStore, PermsMetrics, PermsStore,
    PermsTransaction, RepoStore, ReposListOptions, Stores, StoreResult, SubRepoPermsStore,
    SyncRecord, SyncRecordsStore, UserStore
};
use perms_sync::syncer::PermsSyncer;
use perms_sync::types::{
    Clock, ExternalAccount, ExternalAccounts, ExternalRepoSpec, ExternalUserPermissions,
    FetchPermsOptions, MinimalRepo, Repo, RepoId, RequestType, SetPermissionsResult,
    SubRepoPermissions, User, UserId
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const GITHUB_ID: &str = "https://github.com/";
pub const GITLAB_ID: &str = "https://gitlab.com/";
pub const PERFORCE_ID: &str = "ssl:111.222.333.444:1666";

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

fn diff(old: &BTreeSet<i32>, new: &BTreeSet<i32>) -> SetPermissionsResult {
    SetPermissionsResult {
        added: new.difference(old).count() as u32,
        removed: old.difference(new).count() as u32,
        found: new.len() as u32
    }
}

#[derive(Default)]
pub struct PermsState {
    pub user_perms: HashMap<UserId, BTreeSet<RepoId>>,
    pub repo_perms: HashMap<RepoId, BTreeSet<UserId>>,
    pub pending: HashMap<RepoId, ExternalAccounts>,
    /// Code host account ID to internal user.
    pub accounts: HashMap<String, UserId>,
    /// Previously granted repos per (user, service type, service ID).
    pub service_repos: HashMap<(UserId, String, String), Vec<RepoId>>,
    pub touched_users: Vec<UserId>,
    pub touched_repos: Vec<RepoId>,
    pub no_perms_users: Vec<UserId>,
    pub no_perms_repos: Vec<RepoId>,
    pub oldest_users: Vec<(UserId, DateTime<Utc>)>,
    pub oldest_repos: Vec<(RepoId, DateTime<Utc>)>,
    pub oldest_calls: Vec<(RequestType, usize, Duration)>,
    pub metrics_ages: Vec<Duration>,
    pub fail_set_repo: bool,
    pub fail_pending: bool,
    pub fail_schedule: bool,
    pub set_user_calls: usize,
    pub commits: usize,
    pub rollbacks: usize
}

#[derive(Clone, Default)]
pub struct MemPermsStore {
    pub state: Arc<Mutex<PermsState>>
}

fn memory_error(reason: &str) -> StoreError {
    StoreError::query("memory", reason)
}

#[async_trait]
impl PermsStore for MemPermsStore {
    async fn load_user_permissions(&self, user_id: UserId) -> StoreResult<BTreeSet<RepoId>> {
        Ok(self.state.lock().user_perms.get(&user_id).cloned().unwrap_or_default())
    }

    async fn load_repo_permissions(&self, repo_id: RepoId) -> StoreResult<BTreeSet<UserId>> {
        Ok(self.state.lock().repo_perms.get(&repo_id).cloned().unwrap_or_default())
    }

    async fn set_user_permissions(
        &self,
        user_id: UserId,
        repo_ids: &BTreeSet<RepoId>
    ) -> StoreResult<SetPermissionsResult> {
        let mut state = self.state.lock();
        state.set_user_calls += 1;
        let old = state.user_perms.get(&user_id).cloned().unwrap_or_default();
        let result = diff(&old, repo_ids);
        state.user_perms.insert(user_id, repo_ids.clone());
        Ok(result)
    }

    async fn touch_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
        self.state.lock().touched_users.push(user_id);
        Ok(())
    }

    async fn touch_repo_permissions(&self, repo_id: RepoId) -> StoreResult<()> {
        self.state.lock().touched_repos.push(repo_id);
        Ok(())
    }

    async fn get_user_ids_by_external_accounts(
        &self,
        accounts: &ExternalAccounts
    ) -> StoreResult<HashMap<String, UserId>> {
        let state = self.state.lock();
        Ok(accounts
            .account_ids
            .iter()
            .filter_map(|id| state.accounts.get(id).map(|user| (id.clone(), *user)))
            .collect())
    }

    async fn fetch_repos_by_user_and_external_service(
        &self,
        user_id: UserId,
        service_type: &str,
        service_id: &str
    ) -> StoreResult<Vec<RepoId>> {
        Ok(self
            .state
            .lock()
            .service_repos
            .get(&(user_id, service_type.to_string(), service_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn user_ids_with_no_perms(&self) -> StoreResult<Vec<UserId>> {
        let state = self.state.lock();
        if state.fail_schedule {
            return Err(memory_error("schedule unavailable"));
        }
        Ok(state.no_perms_users.clone())
    }

    async fn repo_ids_with_no_perms(&self) -> StoreResult<Vec<RepoId>> {
        Ok(self.state.lock().no_perms_repos.clone())
    }

    async fn user_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<Vec<(UserId, DateTime<Utc>)>> {
        let mut state = self.state.lock();
        state.oldest_calls.push((RequestType::User, limit, age));
        Ok(state.oldest_users.iter().take(limit).copied().collect())
    }

    async fn repo_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<Vec<(RepoId, DateTime<Utc>)>> {
        let mut state = self.state.lock();
        state.oldest_calls.push((RequestType::Repo, limit, age));
        Ok(state.oldest_repos.iter().take(limit).copied().collect())
    }

    async fn metrics(&self, stale_age: Duration) -> StoreResult<PermsMetrics> {
        self.state.lock().metrics_ages.push(stale_age);
        Ok(PermsMetrics {
            users_with_stale_perms: 3,
            users_perms_gap_seconds: 42.0,
            repos_with_stale_perms: 2,
            repos_perms_gap_seconds: 7.0,
            sub_repos_with_stale_perms: 1,
            sub_repos_perms_gap_seconds: 1.5
        })
    }

    async fn transact(&self) -> StoreResult<Box<dyn PermsTransaction>> {
        Ok(Box::new(MemTransaction {
            state: Arc::clone(&self.state),
            repo_perms: None,
            pending: None
        }))
    }
}

pub struct MemTransaction {
    state: Arc<Mutex<PermsState>>,
    repo_perms: Option<(RepoId, BTreeSet<UserId>)>,
    pending: Option<(RepoId, ExternalAccounts)>
}

#[async_trait]
impl PermsTransaction for MemTransaction {
    async fn set_repo_permissions(
        &mut self,
        repo_id: RepoId,
        user_ids: &BTreeSet<UserId>
    ) -> StoreResult<SetPermissionsResult> {
        let state = self.state.lock();
        if state.fail_set_repo {
            return Err(memory_error("set repo permissions failed"));
        }
        let old = state.repo_perms.get(&repo_id).cloned().unwrap_or_default();
        self.repo_perms = Some((repo_id, user_ids.clone()));
        Ok(diff(&old, user_ids))
    }

    async fn set_repo_pending_permissions(
        &mut self,
        accounts: &ExternalAccounts,
        repo_id: RepoId
    ) -> StoreResult<()> {
        if self.state.lock().fail_pending {
            return Err(memory_error("set pending permissions failed"));
        }
        self.pending = Some((repo_id, accounts.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some((repo_id, users)) = self.repo_perms {
            state.repo_perms.insert(repo_id, users);
        }
        if let Some((repo_id, accounts)) = self.pending {
            state.pending.insert(repo_id, accounts);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.state.lock().rollbacks += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemRepoStore {
    pub repos: Mutex<HashMap<RepoId, Repo>>,
    pub list_calls: Mutex<Vec<ReposListOptions>>
}

impl MemRepoStore {
    pub fn add(&self, repo: Repo) {
        self.repos.lock().insert(repo.id, repo);
    }
}

#[async_trait]
impl RepoStore for MemRepoStore {
    async fn get(&self, repo_id: RepoId) -> StoreResult<Option<Repo>> {
        Ok(self.repos.lock().get(&repo_id).cloned())
    }

    async fn list_minimal_repos(&self, options: &ReposListOptions) -> StoreResult<Vec<MinimalRepo>> {
        self.list_calls.lock().push(options.clone());
        let repos = self.repos.lock();
        let mut found: Vec<MinimalRepo> = repos
            .values()
            .filter(|r| !options.only_private || r.private)
            .filter(|r| {
                options.external_repos.contains(&r.external_repo)
                    || options.matches_contains(&r.external_repo)
            })
            .map(|r| MinimalRepo {
                id: r.id,
                name: r.name.clone()
            })
            .collect();
        found.sort_by_key(|r| r.id);
        Ok(found)
    }
}

#[derive(Default)]
pub struct MemUserStore {
    pub users: Mutex<HashMap<UserId, User>>,
    pub emails: Mutex<HashMap<UserId, Vec<String>>>
}

#[async_trait]
impl UserStore for MemUserStore {
    async fn get_by_id(&self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.users.lock().get(&user_id).cloned())
    }

    async fn verified_emails(&self, user_id: UserId) -> StoreResult<Vec<String>> {
        Ok(self.emails.lock().get(&user_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemAccountsStore {
    pub accounts: Mutex<Vec<ExternalAccount>>,
    pub expired: Mutex<Vec<i32>>,
    pub last_valid: Mutex<Vec<i32>>,
    pub list_calls: Mutex<Vec<ExternalAccountsListOptions>>
}

#[async_trait]
impl ExternalAccountsStore for MemAccountsStore {
    async fn list(&self, options: &ExternalAccountsListOptions) -> StoreResult<Vec<ExternalAccount>> {
        self.list_calls.lock().push(options.clone());
        Ok(self
            .accounts
            .lock()
            .iter()
            .filter(|a| a.user_id == options.user_id)
            .filter(|a| {
                options
                    .service_type
                    .as_ref()
                    .is_none_or(|st| &a.service_type == st)
            })
            .filter(|a| !options.exclude_expired || !a.is_expired())
            .filter(|a| !options.only_expired || a.is_expired())
            .cloned()
            .collect())
    }

    async fn upsert(&self, account: &ExternalAccount) -> StoreResult<ExternalAccount> {
        let mut accounts = self.accounts.lock();
        let mut stored = account.clone();
        if stored.id == 0 {
            stored.id = accounts.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        }
        accounts.retain(|a| a.id != stored.id);
        accounts.push(stored.clone());
        Ok(stored)
    }

    async fn touch_expired(&self, account_id: i32) -> StoreResult<()> {
        self.expired.lock().push(account_id);
        for account in self.accounts.lock().iter_mut() {
            if account.id == account_id {
                account.expired_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn touch_last_valid(&self, account_id: i32) -> StoreResult<()> {
        self.last_valid.lock().push(account_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemSubRepoStore {
    pub perms: Mutex<HashMap<(UserId, ExternalRepoSpec), SubRepoPermissions>>,
    pub upserts: AtomicUsize
}

#[async_trait]
impl SubRepoPermsStore for MemSubRepoStore {
    async fn upsert_with_spec(
        &self,
        user_id: UserId,
        spec: &ExternalRepoSpec,
        perms: &SubRepoPermissions
    ) -> StoreResult<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.perms.lock().insert((user_id, spec.clone()), perms.clone());
        Ok(())
    }

    async fn get_by_user_and_service(
        &self,
        user_id: UserId,
        service_type: &str,
        service_id: &str
    ) -> StoreResult<HashMap<ExternalRepoSpec, SubRepoPermissions>> {
        Ok(self
            .perms
            .lock()
            .iter()
            .filter(|((user, spec), _)| {
                *user == user_id && spec.service_type == service_type && spec.service_id == service_id
            })
            .map(|((_, spec), perms)| (spec.clone(), perms.clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct MemRecords {
    pub records: Mutex<Vec<SyncRecord>>,
    pub latest: Mutex<HashMap<(RequestType, i32), DateTime<Utc>>>,
    pub fail: Mutex<bool>
}

impl MemRecords {
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl SyncRecordsStore for MemRecords {
    async fn record(&self, record: &SyncRecord) -> StoreResult<()> {
        if *self.fail.lock() {
            return Err(memory_error("records unavailable"));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn latest_finished_sync(
        &self,
        request_type: RequestType,
        id: i32
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.latest.lock().get(&(request_type, id)).copied())
    }
}

/// Provider returning canned responses and counting calls.
pub struct MockProvider {
    urn: String,
    service_type: String,
    service_id: String,
    pub account: Mutex<Result<Option<ExternalAccount>, ProviderError>>,
    pub user_perms: Mutex<FetchResult<ExternalUserPermissions>>,
    pub repo_perms: Mutex<FetchResult<Vec<String>>>,
    pub account_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub repo_calls: AtomicUsize,
    pub last_options: Mutex<Option<FetchPermsOptions>>
}

impl MockProvider {
    pub fn new(id: u32, service_type: &str, service_id: &str) -> Arc<Self> {
        Arc::new(Self {
            urn: format!("extsvc:{}:{}", service_type, id),
            service_type: service_type.to_string(),
            service_id: service_id.to_string(),
            account: Mutex::new(Ok(None)),
            user_perms: Mutex::new(Ok(ExternalUserPermissions::default())),
            repo_perms: Mutex::new(Ok(Vec::new())),
            account_calls: AtomicUsize::new(0),
            user_calls: AtomicUsize::new(0),
            repo_calls: AtomicUsize::new(0),
            last_options: Mutex::new(None)
        })
    }

    pub fn github() -> Arc<Self> {
        Self::new(1, "github", GITHUB_ID)
    }

    pub fn gitlab() -> Arc<Self> {
        Self::new(2, "gitlab", GITLAB_ID)
    }

    pub fn perforce() -> Arc<Self> {
        Self::new(3, "perforce", PERFORCE_ID)
    }

    pub fn set_user_perms(&self, result: FetchResult<ExternalUserPermissions>) {
        *self.user_perms.lock() = result;
    }

    pub fn set_repo_perms(&self, result: FetchResult<Vec<String>>) {
        *self.repo_perms.lock() = result;
    }

    pub fn total_calls(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst)
            + self.user_calls.load(Ordering::SeqCst)
            + self.repo_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthzProvider for MockProvider {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn service_type(&self) -> &str {
        &self.service_type
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn fetch_account(
        &self,
        _user: &User,
        _current: &[ExternalAccount],
        _verified_emails: &[String]
    ) -> Result<Option<ExternalAccount>, ProviderError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        self.account.lock().clone()
    }

    async fn fetch_user_perms(
        &self,
        _account: &ExternalAccount,
        options: FetchPermsOptions
    ) -> FetchResult<ExternalUserPermissions> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options);
        self.user_perms.lock().clone()
    }

    async fn fetch_repo_perms(&self, _repo: &Repo, options: FetchPermsOptions) -> FetchResult<Vec<String>> {
        self.repo_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options);
        self.repo_perms.lock().clone()
    }
}

/// In-memory stores plus a registry, ready to build a syncer.
pub struct Harness {
    pub perms: MemPermsStore,
    pub repos: Arc<MemRepoStore>,
    pub users: Arc<MemUserStore>,
    pub accounts: Arc<MemAccountsStore>,
    pub sub_repo: Arc<MemSubRepoStore>,
    pub records: Arc<MemRecords>,
    pub registry: Arc<ProviderRegistry>,
    providers: Mutex<Vec<Arc<dyn AuthzProvider>>>,
    pub now: DateTime<Utc>
}

impl Harness {
    pub fn new() -> Self {
        Self {
            perms: MemPermsStore::default(),
            repos: Arc::new(MemRepoStore::default()),
            users: Arc::new(MemUserStore::default()),
            accounts: Arc::new(MemAccountsStore::default()),
            sub_repo: Arc::new(MemSubRepoStore::default()),
            records: Arc::new(MemRecords::default()),
            registry: Arc::new(ProviderRegistry::empty()),
            providers: Mutex::new(Vec::new()),
            now: ts(1_700_000_000)
        }
    }

    pub fn stores(&self) -> Stores {
        Stores::new(
            Arc::new(self.perms.clone()),
            Arc::clone(&self.repos) as Arc<dyn RepoStore>,
            Arc::clone(&self.users) as Arc<dyn UserStore>,
            Arc::clone(&self.accounts) as Arc<dyn ExternalAccountsStore>,
            Arc::clone(&self.sub_repo) as Arc<dyn SubRepoPermsStore>,
            Arc::clone(&self.records) as Arc<dyn SyncRecordsStore>
        )
        .with_clock(fixed_clock(self.now))
    }

    pub fn syncer(&self) -> PermsSyncer {
        PermsSyncer::new(Arc::clone(&self.registry), self.stores())
    }

    pub fn add_provider(&self, provider: Arc<MockProvider>) {
        let mut providers = self.providers.lock();
        providers.push(provider as Arc<dyn AuthzProvider>);
        self.registry.replace(false, providers.clone());
    }

    pub fn add_user(&self, id: UserId, username: &str) {
        self.users.users.lock().insert(
            id,
            User {
                id,
                username: username.to_string(),
                created_at: ts(1_600_000_000)
            }
        );
    }

    pub fn add_account(&self, id: i32, user_id: UserId, provider: &MockProvider, account_id: &str) {
        self.accounts.accounts.lock().push(ExternalAccount {
            id,
            user_id,
            service_type: provider.service_type().to_string(),
            service_id: provider.service_id().to_string(),
            account_id: account_id.to_string(),
            expired_at: None,
            last_valid_at: None
        });
    }

    /// Adds a repository discovered through `provider`.
    pub fn add_repo(&self, id: RepoId, external_id: &str, private: bool, provider: &MockProvider) {
        self.repos.add(Repo {
            id,
            name: format!("repo-{}", id),
            private,
            sources: BTreeSet::from([provider.urn().to_string()]),
            external_repo: ExternalRepoSpec::new(
                external_id,
                provider.service_type(),
                provider.service_id()
            ),
            created_at: ts(1_650_000_000)
        });
    }

    pub fn user_perms(&self, user_id: UserId) -> BTreeSet<RepoId> {
        self.perms
            .state
            .lock()
            .user_perms
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until `check` holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
