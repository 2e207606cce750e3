//! Domain models for work items and sync bookkeeping

mod email;
mod ids;
mod job_lock;
mod record;
mod sync_cursor;

pub use email::{Email, EmailAddress, EmailThread, Recipients};
pub use ids::{AccountId, RecordId, RecordKey, SourceId, UserId};
pub use job_lock::{Granularity, JobLock};
pub use record::{
    CanonicalRecord, EventDetails, Payload, PullRequestDetails, RecordKind, ReviewState,
    TaskDetails,
};
pub use sync_cursor::{CursorKey, SyncCursor};
