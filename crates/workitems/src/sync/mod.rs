//! Sync engine
//!
//! Fetches from every linked provider account and merges the results
//! through the reconciler. Every operation is idempotent and safe to rerun.

mod cancel;
mod fanout;
mod retry;
mod threads;

pub use cancel::CancelToken;
pub use fanout::{FanOut, SourceError, SyncReport};
pub use retry::RetryPolicy;
pub use threads::{
    message_external_id, sync_threads, SyncMode, ThreadSyncOptions, ThreadSyncOutput, ThreadSyncStats,
};

use crate::error::{SyncError, SyncResult};

/// Treat "already gone" as success for deletes
pub(crate) fn ignore_not_found<T>(result: SyncResult<T>) -> SyncResult<()> {
    match result {
        Ok(_) | Err(SyncError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found::<()>(Err(SyncError::NotFound("x".to_string()))).is_ok());
        assert!(ignore_not_found::<()>(Err(SyncError::Cancelled)).is_err());
        assert!(ignore_not_found(Ok(5)).is_ok());
    }
}
