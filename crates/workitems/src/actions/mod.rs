//! Record actions
//!
//! High-level mutations that go through a provider first and then update
//! the canonical store: mark done, reply, create and modify.

mod handler;

pub use handler::ActionHandler;
