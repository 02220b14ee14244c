//! Remote-backed collection cache for the ideas board.
//!
//! This crate keeps a local, observable mirror of the idea records held by
//! an ATProto PDS and routes every write through the store before the mirror
//! changes.
//!
//! ## Features
//!
//! - **Cache**: [`IdeaCache`] with fetch/add/update/remove, an observable
//!   idea list and busy flag, and a broadcast stream of [`CacheUpdate`]s
//! - **Resolver**: maps domain ids to record handles by scanning the snapshot
//! - **XRPC store**: [`XrpcStore`] for repo record CRUD and sessions
//! - **Memory store**: [`MemoryStore`] with fault injection, for tests

pub mod cache;
mod error;
mod handle;
pub mod memory;
mod records;
mod store;
mod types;
pub mod xrpc;

pub use cache::{
    CacheState, CacheUpdate, IdeaCache, IdeaCacheBuilder, ParseSyncPolicyError, Snapshot,
    SyncPolicy, resolve_handle,
};
pub use error::{CacheError, StoreError};
pub use handle::{RecordRef, RecordRefError};
pub use memory::{Fault, MemoryStore, StoreOp};
pub use records::*;
pub use store::{IdentityProvider, RecordStore};
pub use types::*;
pub use xrpc::XrpcStore;
