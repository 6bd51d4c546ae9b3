use crate::types::{ProviderStatusesSet, SetPermissionsResult};
use errors::{ProviderError, StoreError};
use thiserror::Error;

pub type PermsSyncResult<T> = Result<T, PermsSyncError>;

#[derive(Debug, Error)]
pub enum PermsSyncError {
    #[error("{context}: {source}")]
    Store {
        context: String,
        source: StoreError
    },

    #[error("{context}: {source}")]
    Provider {
        context: String,
        source: ProviderError
    },

    #[error("User not found: {0}")]
    UserNotFound(i32),

    #[error("Invalid sync job {job_id}: {reason}")]
    InvalidJob { job_id: i64, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Sync task aborted: {0}")]
    TaskAborted(String)
}

impl PermsSyncError {
    pub fn provider(context: impl Into<String>, source: ProviderError) -> Self {
        Self::Provider {
            context: context.into(),
            source
        }
    }
}

/// Attaches a description of the failed step to store errors.
pub(crate) trait StoreContext<T> {
    fn context(self, context: impl Into<String>) -> PermsSyncResult<T>;

    fn with_context<F>(self, f: F) -> PermsSyncResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> StoreContext<T> for Result<T, StoreError> {
    fn context(self, context: impl Into<String>) -> PermsSyncResult<T> {
        self.map_err(|source| PermsSyncError::Store {
            context: context.into(),
            source
        })
    }

    fn with_context<F>(self, f: F) -> PermsSyncResult<T>
    where
        F: FnOnce() -> String
    {
        self.map_err(|source| PermsSyncError::Store {
            context: f(),
            source
        })
    }
}

/// A completed sync: the write result (absent when nothing was written) and
/// the provider calls made along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub result: Option<SetPermissionsResult>,
    pub provider_states: ProviderStatusesSet
}

/// An aborted sync. Provider statuses gathered before the abort are kept.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub error: PermsSyncError,
    pub provider_states: ProviderStatusesSet
}

impl SyncFailure {
    pub fn new(error: PermsSyncError, provider_states: ProviderStatusesSet) -> Self {
        Self {
            error,
            provider_states
        }
    }
}

pub type SyncResult = Result<SyncOutcome, SyncFailure>;
