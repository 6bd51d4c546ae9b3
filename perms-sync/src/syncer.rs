//! User-centric and repository-centric permission reconciliation.
//!
//! Both directions ask the configured providers, classify their failures and
//! commit the merged result under a single process-wide write lock. A
//! temporary provider failure re-contributes what was previously stored for
//! that provider so an outage never revokes access.

use crate::error::{
    PermsSyncError, PermsSyncResult, StoreContext, SyncFailure, SyncOutcome, SyncResult
};
use crate::provider::{AuthzProvider, FetchFailure, ProviderRegistry, provider_status};
use crate::store::{ExternalAccountsListOptions, PermsTransaction, ReposListOptions, Stores};
use crate::telemetry::{SyncTimer, Telemetry};
use crate::types::{
    ExternalAccount, ExternalAccounts, ExternalRepoSpec, ExternalUserPermissions,
    FetchPermsOptions, MinimalRepo, ProviderStatusesSet, Repo, RepoId, RequestType,
    SetPermissionsResult, SubRepoPermissions, User, UserId
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::ProviderErrorKind;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

/// Maximum number of external repository specs sent in one lookup.
pub const REPO_SPECS_BATCH_SIZE: usize = 10_000;

const GITLAB_SERVICE_TYPE: &str = "gitlab";

const OP_FETCH_ACCOUNT: &str = "FetchAccount";
const OP_FETCH_USER_PERMS: &str = "FetchUserPerms";
const OP_FETCH_REPO_PERMS: &str = "FetchRepoPerms";

/// Entry points used by the dispatcher and the durable worker.
#[async_trait]
pub trait PermsSync: Send + Sync {
    async fn sync_user_perms(
        &self,
        user_id: UserId,
        no_perms: bool,
        options: FetchPermsOptions
    ) -> SyncResult;

    async fn sync_repo_perms(
        &self,
        repo_id: RepoId,
        no_perms: bool,
        options: FetchPermsOptions
    ) -> SyncResult;
}

#[derive(Debug, Default)]
struct UserPermsResults {
    repo_ids: BTreeSet<RepoId>,
    sub_repo_perms: HashMap<ExternalRepoSpec, SubRepoPermissions>
}

pub struct PermsSyncer {
    registry: Arc<ProviderRegistry>,
    stores: Stores,
    // Serializes every permission write across users and repos.
    write_lock: Mutex<()>
}

impl PermsSyncer {
    pub fn new(registry: Arc<ProviderRegistry>, stores: Stores) -> Self {
        Self {
            registry,
            stores,
            write_lock: Mutex::new(())
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn finish(
        timer: SyncTimer,
        res: PermsSyncResult<Option<SetPermissionsResult>>,
        provider_states: ProviderStatusesSet
    ) -> SyncResult {
        timer.finish(res.is_ok());
        match res {
            Ok(result) => Ok(SyncOutcome {
                result,
                provider_states
            }),
            Err(error) => Err(SyncFailure::new(error, provider_states))
        }
    }

    #[instrument(skip(self, states))]
    async fn sync_user(
        &self,
        user_id: UserId,
        no_perms: bool,
        options: FetchPermsOptions,
        states: &mut ProviderStatusesSet
    ) -> PermsSyncResult<Option<SetPermissionsResult>> {
        let user = self
            .stores
            .users
            .get_by_id(user_id)
            .await
            .context("get user")?
            .ok_or(PermsSyncError::UserNotFound(user_id))?;

        let results = self
            .fetch_user_perms_via_external_accounts(&user, no_perms, options, states)
            .await?;

        let latest = self.latest_finished_sync(RequestType::User, user_id).await;

        for (spec, perms) in &results.sub_repo_perms {
            self.stores
                .sub_repo_perms
                .upsert_with_spec(user.id, spec, perms)
                .await
                .with_context(|| {
                    format!(
                        "upsert sub-repo permissions for repo {} of user {:?} (id: {})",
                        spec.id, user.username, user.id
                    )
                })?;
        }
        if !results.sub_repo_perms.is_empty() {
            debug!(count = results.sub_repo_perms.len(), "Sub-repo permissions synced");
        }

        let result = {
            let _guard = self.write_lock.lock().await;
            self.stores
                .perms
                .set_user_permissions(user.id, &results.repo_ids)
                .await
                .with_context(|| {
                    format!(
                        "set user repo permissions for user {:?} (id: {})",
                        user.username, user.id
                    )
                })?
        };

        debug!(
            count = results.repo_ids.len(),
            invalidate_caches = options.invalidate_caches,
            "User permissions synced"
        );
        self.record_delays(RequestType::User, latest, user.created_at);

        Ok(Some(result))
    }

    async fn fetch_user_perms_via_external_accounts(
        &self,
        user: &User,
        no_perms: bool,
        options: FetchPermsOptions,
        states: &mut ProviderStatusesSet
    ) -> PermsSyncResult<UserPermsResults> {
        let accounts_store = &self.stores.external_accounts;

        let mut accounts = accounts_store
            .list(&ExternalAccountsListOptions {
                user_id: user.id,
                exclude_expired: true,
                ..Default::default()
            })
            .await
            .context("list external accounts")?;

        // Expired GitLab accounts can still refresh their tokens.
        let expired_gitlab = accounts_store
            .list(&ExternalAccountsListOptions {
                user_id: user.id,
                service_type: Some(GITLAB_SERVICE_TYPE.to_string()),
                only_expired: true,
                ..Default::default()
            })
            .await
            .context("list expired gitlab external accounts")?;
        accounts.extend(expired_gitlab);

        let emails = self
            .stores
            .users
            .verified_emails(user.id)
            .await
            .context("list user verified emails")?;

        let snapshot = self.registry.snapshot();
        let by_service_id = snapshot.by_service_id();

        for provider in by_service_id.values() {
            let linked = accounts
                .iter()
                .any(|a| a.matches_service(provider.service_type(), provider.service_id()));
            if linked {
                continue;
            }

            let account = match provider.fetch_account(user, &accounts, &emails).await {
                Ok(found) => {
                    states.push(provider_status(provider.as_ref(), OP_FETCH_ACCOUNT, None));
                    let Some(account) = found else {
                        debug!(provider = provider.urn(), "No account found for provider");
                        continue;
                    };
                    account
                }
                Err(e) => {
                    states.push(provider_status(provider.as_ref(), OP_FETCH_ACCOUNT, Some(&e)));
                    error!(provider = provider.urn(), error = %e, "Could not fetch account from authz provider");
                    continue;
                }
            };

            match accounts_store.upsert(&account).await {
                Ok(stored) => {
                    debug!(provider = provider.urn(), account_id = stored.id, "Account found for provider");
                    accounts.push(stored);
                }
                Err(e) => {
                    error!(provider = provider.urn(), error = %e, "Could not associate external account to user");
                }
            }
        }

        let mut results = UserPermsResults::default();

        for account in &accounts {
            let Some(provider) = by_service_id.get(&account.service_id) else {
                continue;
            };

            let Some(perms) = self
                .fetch_account_perms(user, account, provider.as_ref(), no_perms, options, states, &mut results)
                .await?
            else {
                continue;
            };

            let exacts: Vec<ExternalRepoSpec> = perms
                .exacts
                .iter()
                .map(|id| spec_for(provider.as_ref(), id))
                .collect();
            let mut repos = self
                .list_private_repos_by_specs(&exacts)
                .await
                .context("list private repositories by exact matching")?;

            for (id, sub) in perms.sub_repo_permissions {
                results
                    .sub_repo_perms
                    .insert(spec_for(provider.as_ref(), &id), sub);
            }

            // Excludes only narrow includes, so exclude-only rules need no lookup.
            if !perms.include_contains.is_empty() {
                let contains = self
                    .stores
                    .repos
                    .list_minimal_repos(&ReposListOptions {
                        only_private: true,
                        external_repo_include_contains: perms
                            .include_contains
                            .iter()
                            .map(|id| spec_for(provider.as_ref(), id))
                            .collect(),
                        external_repo_exclude_contains: perms
                            .exclude_contains
                            .iter()
                            .map(|id| spec_for(provider.as_ref(), id))
                            .collect(),
                        ..Default::default()
                    })
                    .await
                    .context("list external repositories by contains matching")?;
                repos.extend(contains);
            }

            results.repo_ids.extend(repos.iter().map(|r| r.id));
        }

        Ok(results)
    }

    /// Calls `fetch_user_perms` for one account and applies the failure
    /// policy. `Ok(None)` means the account contributes nothing further.
    async fn fetch_account_perms(
        &self,
        user: &User,
        account: &ExternalAccount,
        provider: &dyn AuthzProvider,
        no_perms: bool,
        options: FetchPermsOptions,
        states: &mut ProviderStatusesSet,
        results: &mut UserPermsResults
    ) -> PermsSyncResult<Option<ExternalUserPermissions>> {
        let accounts_store = &self.stores.external_accounts;

        let FetchFailure { error, partial } = match provider.fetch_user_perms(account, options).await {
            Ok(perms) => {
                states.push(provider_status(provider, OP_FETCH_USER_PERMS, None));
                accounts_store
                    .touch_last_valid(account.id)
                    .await
                    .with_context(|| format!("set last valid for external account {}", account.id))?;
                return Ok(Some(perms));
            }
            Err(failure) => failure
        };

        states.push(provider_status(provider, OP_FETCH_USER_PERMS, Some(&error)));
        debug!(account_id = account.id, error = %error, "Error fetching user permissions");

        if error.is_revocation() {
            accounts_store
                .touch_expired(account.id)
                .await
                .with_context(|| format!("set expired for external account {}", account.id))?;
            warn!(account_id = account.id, kind = ?error.kind(), "External account expired");
            return Ok(None);
        }

        match error.kind() {
            ProviderErrorKind::Unimplemented => Ok(None),
            ProviderErrorKind::Temporary => {
                warn!(account_id = account.id, error = %error, "Temporary error, returning previously synced permissions");

                let previous_sub = self
                    .stores
                    .sub_repo_perms
                    .get_by_user_and_service(user.id, provider.service_type(), provider.service_id())
                    .await
                    .context("fetch existing sub-repo permissions")?;
                let previous_repos = self
                    .stores
                    .perms
                    .fetch_repos_by_user_and_external_service(
                        user.id,
                        provider.service_type(),
                        provider.service_id()
                    )
                    .await
                    .context("fetch existing repo permissions")?;
                results.repo_ids.extend(previous_repos);

                Ok(Some(ExternalUserPermissions {
                    sub_repo_permissions: previous_sub
                        .into_iter()
                        .map(|(spec, perms)| (spec.id, perms))
                        .collect(),
                    ..Default::default()
                }))
            }
            _ => {
                if !no_perms {
                    return Err(PermsSyncError::provider(
                        format!("fetch user permissions for external account {}", account.id),
                        error
                    ));
                }
                warn!(account_id = account.id, error = %error, "Proceeding with partial results");
                Ok(partial)
            }
        }
    }

    /// Looks up private repositories by exact spec, in slices small enough
    /// for the backend's bind parameter limit.
    async fn list_private_repos_by_specs(
        &self,
        specs: &[ExternalRepoSpec]
    ) -> Result<Vec<MinimalRepo>, errors::StoreError> {
        let mut repos = Vec::with_capacity(specs.len());
        for chunk in specs.chunks(REPO_SPECS_BATCH_SIZE) {
            let found = self
                .stores
                .repos
                .list_minimal_repos(&ReposListOptions {
                    only_private: true,
                    external_repos: chunk.to_vec(),
                    ..Default::default()
                })
                .await?;
            repos.extend(found);
        }
        Ok(repos)
    }

    #[instrument(skip(self, states))]
    async fn sync_repo(
        &self,
        repo_id: RepoId,
        no_perms: bool,
        options: FetchPermsOptions,
        states: &mut ProviderStatusesSet
    ) -> PermsSyncResult<Option<SetPermissionsResult>> {
        let Some(repo) = self
            .stores
            .repos
            .get(repo_id)
            .await
            .context("get repository")?
        else {
            debug!("Repository no longer exists");
            return Ok(None);
        };

        // Public repositories are never restricted.
        let provider = if repo.private {
            let by_urn = self.registry.snapshot().by_urn();
            repo.sources.iter().find_map(|urn| by_urn.get(urn).cloned())
        } else {
            None
        };

        let Some(provider) = provider else {
            debug!(private = repo.private, "No authz provider for repository, skipping fetch");
            self.touch_repo(repo_id).await?;
            return Ok(None);
        };

        let account_ids = match provider.fetch_repo_perms(&repo, options).await {
            Ok(ids) => {
                states.push(provider_status(provider.as_ref(), OP_FETCH_REPO_PERMS, None));
                ids
            }
            Err(FetchFailure { error, partial }) => match error.kind() {
                ProviderErrorKind::NotFound => {
                    warn!(
                        error = %error,
                        suggestion = "the token owner may only have read access to the repository",
                        "Ignoring not-found error from code host"
                    );
                    states.push(provider_status(provider.as_ref(), OP_FETCH_REPO_PERMS, None));
                    self.touch_repo(repo_id).await?;
                    return Ok(None);
                }
                ProviderErrorKind::Unimplemented => {
                    debug!(error = %error, "Repository permissions not implemented by provider");
                    states.push(provider_status(provider.as_ref(), OP_FETCH_REPO_PERMS, None));
                    self.touch_repo(repo_id).await?;
                    return Ok(None);
                }
                _ => {
                    states.push(provider_status(provider.as_ref(), OP_FETCH_REPO_PERMS, Some(&error)));
                    if !no_perms {
                        return Err(PermsSyncError::provider(
                            format!(
                                "fetch repository permissions for repository {:?} (id: {})",
                                repo.name, repo.id
                            ),
                            error
                        ));
                    }
                    warn!(error = %error, "Proceeding with partial results");
                    partial.unwrap_or_default()
                }
            }
        };

        let account_ids: BTreeSet<String> = account_ids.into_iter().collect();
        let resolved = if account_ids.is_empty() {
            HashMap::new()
        } else {
            self.stores
                .perms
                .get_user_ids_by_external_accounts(&ExternalAccounts {
                    service_type: provider.service_type().to_string(),
                    service_id: provider.service_id().to_string(),
                    account_ids: account_ids.iter().cloned().collect()
                })
                .await
                .with_context(|| {
                    format!(
                        "get user IDs by external accounts for repository {:?} (id: {})",
                        repo.name, repo.id
                    )
                })?
        };

        let user_ids: BTreeSet<UserId> = resolved.values().copied().collect();
        let pending = ExternalAccounts {
            service_type: provider.service_type().to_string(),
            service_id: provider.service_id().to_string(),
            account_ids: account_ids
                .into_iter()
                .filter(|id| !resolved.contains_key(id))
                .collect()
        };

        let latest = self.latest_finished_sync(RequestType::Repo, repo_id).await;

        let result = {
            let _guard = self.write_lock.lock().await;

            let mut tx = self.stores.perms.transact().await.with_context(|| {
                format!("start transaction for repository {:?} (id: {})", repo.name, repo.id)
            })?;

            let written = write_repo_perms(tx.as_mut(), &repo, &user_ids, &pending).await;

            match written {
                Ok(result) => {
                    tx.commit().await.with_context(|| {
                        format!("commit permissions for repository {:?} (id: {})", repo.name, repo.id)
                    })?;
                    result
                }
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        error!(error = %rollback, "Failed to roll back repository permissions");
                    }
                    return Err(e);
                }
            }
        };

        debug!(
            regular_count = user_ids.len(),
            pending_count = pending.account_ids.len(),
            invalidate_caches = options.invalidate_caches,
            "Repository permissions synced"
        );
        self.record_delays(RequestType::Repo, latest, repo.created_at);

        Ok(Some(result))
    }

    async fn touch_repo(&self, repo_id: RepoId) -> PermsSyncResult<()> {
        self.stores
            .perms
            .touch_repo_permissions(repo_id)
            .await
            .with_context(|| format!("touch permissions for repository {}", repo_id))
    }

    /// Lookup failures only cost the delay metric.
    async fn latest_finished_sync(&self, request_type: RequestType, id: i32) -> Option<DateTime<Utc>> {
        match self.stores.sync_records.latest_finished_sync(request_type, id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(%request_type, id, error = %e, "Failed to get latest finished sync");
                None
            }
        }
    }

    fn record_delays(
        &self,
        request_type: RequestType,
        latest: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>
    ) {
        let now = self.stores.now();
        Telemetry::record_success(request_type);
        match latest {
            Some(finished_at) => Telemetry::record_consecutive_sync(request_type, now - finished_at),
            None => Telemetry::record_first_sync(request_type, now - created_at)
        }
    }
}

async fn write_repo_perms(
    tx: &mut dyn PermsTransaction,
    repo: &Repo,
    user_ids: &BTreeSet<UserId>,
    pending: &ExternalAccounts
) -> PermsSyncResult<SetPermissionsResult> {
    let result = tx
        .set_repo_permissions(repo.id, user_ids)
        .await
        .with_context(|| {
            format!(
                "set user repo permissions for repository {:?} (id: {})",
                repo.name, repo.id
            )
        })?;
    tx.set_repo_pending_permissions(pending, repo.id)
        .await
        .with_context(|| {
            format!(
                "set repository pending permissions for repository {:?} (id: {})",
                repo.name, repo.id
            )
        })?;
    Ok(result)
}

fn spec_for(provider: &dyn AuthzProvider, id: &str) -> ExternalRepoSpec {
    ExternalRepoSpec::new(id, provider.service_type(), provider.service_id())
}

#[async_trait]
impl PermsSync for PermsSyncer {
    async fn sync_user_perms(
        &self,
        user_id: UserId,
        no_perms: bool,
        options: FetchPermsOptions
    ) -> SyncResult {
        let timer = SyncTimer::new(RequestType::User);
        let mut states = ProviderStatusesSet::default();
        let res = self.sync_user(user_id, no_perms, options, &mut states).await;
        Self::finish(timer, res, states)
    }

    async fn sync_repo_perms(
        &self,
        repo_id: RepoId,
        no_perms: bool,
        options: FetchPermsOptions
    ) -> SyncResult {
        let timer = SyncTimer::new(RequestType::Repo);
        let mut states = ProviderStatusesSet::default();
        let res = self.sync_repo(repo_id, no_perms, options, &mut states).await;
        Self::finish(timer, res, states)
    }
}
