//! Core abstractions for the workspace bus.
//!
//! This crate provides the building blocks that know nothing about messaging:
//! - `Store` - Keyed reactive store with subscriptions
//! - `ContextProvider` - Snapshot of what the host has open
//! - `AgentEvent` - Decoded agent stream frames
//! - Agent, file and navigation collaborator traits
//! - `BusConfig` and the shared error taxonomy

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod files;
pub mod store;
pub mod traits;

pub use config::BusConfig;
pub use context::{ContextProvider, WorkspaceContext};
pub use error::BusError;
pub use event::AgentEvent;
pub use files::FsFileLoader;
pub use store::{DataState, Store, StoreError, Subscription};
pub use traits::{AgentBackend, AgentError, AgentRequest, FileError, FileLoader, Navigator};
