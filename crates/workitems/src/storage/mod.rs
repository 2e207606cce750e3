//! Storage traits and implementations
//!
//! The canonical store persists records, sync cursors and job locks. The
//! trait-based design allows swapping between in-memory and SQLite storage.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub use traits::{IntegrityError, RecordQuery, RecordStore, UpdateOutcome};
