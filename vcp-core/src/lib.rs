//! vcp core library
//!
//! Copy, sync, move and remove files between the local filesystem and
//! versioned repository stores:
//! - Path and location parsing
//! - Backends (local filesystem, in-memory store, on-disk store)
//! - Copy planning and concurrent transfer execution
//! - Per-branch transaction batching with automatic flushes
//! - One-way sync with pluggable comparison

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod location;
pub mod ops;
pub mod path;
pub mod planner;
pub mod registry;
pub mod sync;
pub mod transaction;

pub use backend::{
    CommitRecord, DirEntry, DiskStore, EntryInfo, EntryKind, LocalBackend, MemoryStore, RemoteId,
    RepoBackend, RepoBranchKey, RepoPath, WriteTransaction,
};
pub use config::Config;
pub use error::{CommitFailure, Error, Result};
pub use executor::{ExecutorConfig, TransferExecutor, TransferStatus, TransferSummary, UnitOutcome};
pub use location::Location;
pub use ops::{Context, CopyOptions, CopyReport};
pub use planner::{Plan, Planner, TransferMode, TransferUnit};
pub use registry::BackendRegistry;
pub use sync::{SyncCommand, SyncComparator, SyncOptions, SyncStats};
pub use transaction::{AccessToken, ChangeList, TransactionHandle, TransactionManager};
