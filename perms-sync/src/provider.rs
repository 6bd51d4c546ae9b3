//! Authorization providers and the process-wide registry holding them.
//!
//! The registry is read on every sync attempt and replaced wholesale by the
//! refresh loop. Readers take an `Arc` to the current snapshot, so a refresh
//! never tears a sync that is already running.

use crate::error::PermsSyncResult;
use crate::telemetry::Telemetry;
use crate::types::{
    ExternalAccount, ExternalUserPermissions, FetchPermsOptions, ProviderStatus, Repo, User
};
use async_trait::async_trait;
use errors::ProviderError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Provider failure carrying whatever results were gathered before it.
#[derive(Debug, Clone)]
pub struct FetchFailure<T> {
    pub error: ProviderError,
    pub partial: Option<T>
}

impl<T> FetchFailure<T> {
    pub fn with_partial(error: ProviderError, partial: T) -> Self {
        Self {
            error,
            partial: Some(partial)
        }
    }
}

impl<T> From<ProviderError> for FetchFailure<T> {
    fn from(error: ProviderError) -> Self {
        Self {
            error,
            partial: None
        }
    }
}

pub type FetchResult<T> = Result<T, FetchFailure<T>>;

/// Adapter for one code host connection that can answer permission questions.
#[async_trait]
pub trait AuthzProvider: Send + Sync {
    /// Unique identifier of the code host connection, e.g. `extsvc:github:1`.
    fn urn(&self) -> &str;

    /// Kind of code host, e.g. `github`.
    fn service_type(&self) -> &str;

    /// Base URL of the code host, e.g. `https://github.com/`.
    fn service_id(&self) -> &str;

    /// Tries to discover the user's account on this code host. `Ok(None)`
    /// means the provider has no opinion about the user.
    async fn fetch_account(
        &self,
        user: &User,
        current: &[ExternalAccount],
        verified_emails: &[String]
    ) -> Result<Option<ExternalAccount>, ProviderError>;

    async fn fetch_user_perms(
        &self,
        account: &ExternalAccount,
        options: FetchPermsOptions
    ) -> FetchResult<ExternalUserPermissions>;

    /// Returns code host account IDs with read access to the repository.
    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        options: FetchPermsOptions
    ) -> FetchResult<Vec<String>>;
}

pub(crate) fn provider_status(
    provider: &dyn AuthzProvider,
    operation: &str,
    error: Option<&ProviderError>
) -> ProviderStatus {
    ProviderStatus::new(
        provider.urn(),
        provider.service_type(),
        operation,
        error.map(|e| e as &dyn std::error::Error)
    )
}

/// Immutable view of the configured providers.
pub struct ProviderSnapshot {
    pub version: u64,
    pub allow_by_default: bool,
    pub providers: Vec<Arc<dyn AuthzProvider>>
}

impl ProviderSnapshot {
    /// Providers keyed by service ID. Later entries win on duplicates.
    pub fn by_service_id(&self) -> BTreeMap<String, Arc<dyn AuthzProvider>> {
        self.providers
            .iter()
            .map(|p| (p.service_id().to_string(), Arc::clone(p)))
            .collect()
    }

    /// Providers keyed by URN.
    pub fn by_urn(&self) -> BTreeMap<String, Arc<dyn AuthzProvider>> {
        self.providers
            .iter()
            .map(|p| (p.urn().to_string(), Arc::clone(p)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSnapshot")
            .field("version", &self.version)
            .field("allow_by_default", &self.allow_by_default)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.urn()).collect::<Vec<_>>()
            )
            .finish()
    }
}

/// Loads the current provider list, typically from site configuration.
#[async_trait]
pub trait ProviderSource: Send + Sync {
    async fn load(&self) -> PermsSyncResult<(bool, Vec<Arc<dyn AuthzProvider>>)>;
}

pub struct ProviderRegistry {
    current: RwLock<Arc<ProviderSnapshot>>
}

impl ProviderRegistry {
    pub fn new(allow_by_default: bool, providers: Vec<Arc<dyn AuthzProvider>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(ProviderSnapshot {
                version: 0,
                allow_by_default,
                providers
            }))
        }
    }

    /// An empty registry that allows access by default, used until the
    /// first refresh lands.
    pub fn empty() -> Self {
        Self::new(true, Vec::new())
    }

    pub fn snapshot(&self) -> Arc<ProviderSnapshot> {
        self.current.read().clone()
    }

    /// Swaps in a new provider list and returns its version.
    pub fn replace(&self, allow_by_default: bool, providers: Vec<Arc<dyn AuthzProvider>>) -> u64 {
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(ProviderSnapshot {
            version,
            allow_by_default,
            providers
        });
        version
    }

    pub async fn refresh(&self, source: &dyn ProviderSource) -> PermsSyncResult<u64> {
        let (allow_by_default, providers) = source.load().await?;
        let count = providers.len();
        let version = self.replace(allow_by_default, providers);
        debug!(version, providers = count, allow_by_default, "Provider registry refreshed");
        Ok(version)
    }

    /// Periodically reloads providers until `shutdown` flips to true. A
    /// failed load keeps the previous snapshot.
    pub fn run_refresh(
        self: Arc<Self>,
        source: Arc<dyn ProviderSource>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh(source.as_ref()).await {
                            Telemetry::record_provider_refresh_error();
                            error!(error = %e, "Failed to refresh authz providers");
                        }
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            info!("Provider refresh loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
