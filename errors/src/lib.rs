//! # Permissions Sync Errors
//!
//! Shared error taxonomy for the permissions-sync workspace.
//!
//! - `ProviderError`: closed set of failure kinds a code-host provider can
//!   report. The syncer branches on the kind, never on message text.
//! - `StoreError`: failures of the persistence layer behind the store traits.

use thiserror::Error;

/// Failure reported by an authorization provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Account suspended: {reason}")]
    AccountSuspended { reason: String },

    #[error("{operation} is not implemented by {provider}")]
    Unimplemented { provider: String, operation: String },

    #[error("Temporary failure: {reason}")]
    Temporary { reason: String },

    #[error("Not found: {reason}")]
    NotFound { reason: String },

    #[error("Provider failure: {reason}")]
    Other { reason: String }
}

/// Coarse classification of a [`ProviderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Unauthorized,
    Forbidden,
    AccountSuspended,
    Unimplemented,
    Temporary,
    NotFound,
    Other
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Unauthorized { .. } => ProviderErrorKind::Unauthorized,
            Self::Forbidden { .. } => ProviderErrorKind::Forbidden,
            Self::AccountSuspended { .. } => ProviderErrorKind::AccountSuspended,
            Self::Unimplemented { .. } => ProviderErrorKind::Unimplemented,
            Self::Temporary { .. } => ProviderErrorKind::Temporary,
            Self::NotFound { .. } => ProviderErrorKind::NotFound,
            Self::Other { .. } => ProviderErrorKind::Other
        }
    }

    /// Credentials for the account are no longer usable.
    pub fn is_revocation(&self) -> bool {
        matches!(
            self.kind(),
            ProviderErrorKind::Unauthorized
                | ProviderErrorKind::Forbidden
                | ProviderErrorKind::AccountSuspended
        )
    }

    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into()
        }
    }

    pub fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary {
            reason: reason.into()
        }
    }

    pub fn unimplemented(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            provider: provider.into(),
            operation: operation.into()
        }
    }
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection to {backend} failed: {reason}")]
    ConnectionError { backend: String, reason: String },

    #[error("Query on {backend} failed: {reason}")]
    QueryError { backend: String, reason: String },

    #[error("Serialization error: {error_type} - {reason}")]
    SerializationError { error_type: String, reason: String },

    #[error("Not found on {backend}:{id}")]
    NotFound { backend: String, id: String },

    #[error("Transaction on {backend} failed: {reason}")]
    TransactionError { backend: String, reason: String }
}

impl StoreError {
    pub fn query(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::QueryError {
            backend: backend.into(),
            reason: reason.to_string()
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
