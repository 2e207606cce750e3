//! Reconciliation engine
//!
//! Merges freshly fetched provider data into canonical records:
//! - insert-only fields are written once with a set-on-insert write
//! - always-set fields are applied with an atomic find-and-update
//! - the ordering key is reset only under the rules in [`ordering`]

mod engine;
mod fields;
pub mod ordering;

pub use engine::{Reconciled, Reconciler};
pub(crate) use engine::store_error;
pub use fields::{NewRecord, RecordFilter, RecordUpdate};
