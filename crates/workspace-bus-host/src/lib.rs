//! Host side of the workspace bus.
//!
//! Provides:
//! - `Dispatcher` - Serves embedded content over a port, backed by the store
//! - Per-connection subscriptions and cancellable agent executions

mod connection;
pub mod dispatcher;
mod stream;

pub use dispatcher::Dispatcher;
