//! Error taxonomy for provider calls and the sync engine

use std::time::Duration;

use crate::models::SourceId;
use crate::providers::Capability;

/// Failure of a single call into an external provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Token rejected or expired; the account needs to be re-linked
    #[error("credential rejected: {0}")]
    BadCredential(String),

    /// No credential is linked for the requested account
    #[error("no credential linked for {0}")]
    MissingCredential(String),

    /// Network failure, 429 or 5xx
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    /// Incremental cursor is older than the provider's change-log retention
    #[error("sync cursor expired or invalid")]
    CursorExpired,

    /// Any other 4xx
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("{capability} has not been implemented yet")]
    Unsupported { capability: Capability },

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// The account needs to be re-linked; never retried
    pub fn is_bad_credential(&self) -> bool {
        matches!(
            self,
            ProviderError::BadCredential(_) | ProviderError::MissingCredential(_)
        )
    }

    /// Worth retrying under the per-item backoff policy
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}

/// Errors surfaced by the reconciliation and sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("{source_id} does not support {capability}")]
    Unsupported {
        source_id: SourceId,
        capability: Capability,
    },

    /// Store and decoded data disagree; the affected record's sync is aborted
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// A targeted update matched nothing
    #[error("not found: {0}")]
    NotFound(String),

    /// Another runner already claimed this job bucket
    #[error("job {job_name} already claimed for bucket {bucket}")]
    RaceLoss { job_name: String, bucket: String },

    #[error("sync cancelled")]
    Cancelled,

    #[error("sync cursor expired")]
    CursorExpired,

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether this error means the account must be re-linked
    pub fn is_credential(&self) -> bool {
        matches!(self, SyncError::Credential(_))
    }

    /// Expected conditions that should not page anyone
    pub fn suppresses_escalation(&self) -> bool {
        matches!(
            self,
            SyncError::Credential(_) | SyncError::Cancelled | SyncError::RaceLoss { .. }
        )
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::BadCredential(_) | ProviderError::MissingCredential(_) => {
                SyncError::Credential(err.to_string())
            }
            ProviderError::Transient(_) | ProviderError::Timeout(_) => {
                SyncError::TransientProvider(err.to_string())
            }
            ProviderError::NotFound(msg) => SyncError::NotFound(msg),
            ProviderError::CursorExpired => SyncError::CursorExpired,
            ProviderError::Cancelled => SyncError::Cancelled,
            other => SyncError::Provider(other),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::BadCredential("invalid_grant".into()).is_bad_credential());
        assert!(ProviderError::MissingCredential("jira".into()).is_bad_credential());
        assert!(ProviderError::Transient("503".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_millis(10)).is_retryable());
        assert!(!ProviderError::NotFound("x".into()).is_retryable());
        assert!(!ProviderError::BadCredential("x".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_maps_into_taxonomy() {
        let err: SyncError = ProviderError::BadCredential("expired".into()).into();
        assert!(err.is_credential());
        assert!(err.suppresses_escalation());

        let err: SyncError = ProviderError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, SyncError::TransientProvider(_)));

        let err: SyncError = ProviderError::CursorExpired.into();
        assert!(matches!(err, SyncError::CursorExpired));

        let err: SyncError = ProviderError::Decode("bad json".into()).into();
        assert!(matches!(err, SyncError::Provider(_)));
        assert!(!err.suppresses_escalation());
    }
}
