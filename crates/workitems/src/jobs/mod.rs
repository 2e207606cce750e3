//! At-most-once scheduled jobs
//!
//! A job runs at most once per time bucket across any number of racing
//! scheduler processes. Claims are write-once store records keyed by
//! (job, bucket) and are never released.

mod lock;

pub use lock::JobLockManager;
