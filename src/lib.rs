//! # omnisync - multi-backend synchronization and dedupe
//!
//! omnisync copies, moves and reconciles objects between heterogeneous
//! object stores: local filesystems and configured remote stores, seen
//! through one capability-typed backend contract.
//!
//! ## Features
//!
//! - **Backend contract**: a uniform view over stores with different
//!   consistency, naming and metadata models; optional operations are
//!   discovered through capability flags
//! - **Sync engine**: parallel tree walking, per-path verdicts, and
//!   deletes that only run after their transfers succeeded
//! - **Transfer pipeline**: bounded concurrency, single-pass hashing,
//!   verification, and exponential-backoff retries
//! - **Dedupe**: resolution of duplicate-name groups under six policies
//!
//! ## Quick Start
//!
//! ```no_run
//! use omnisync::accounting::Account;
//! use omnisync::backend::LocalBackend;
//! use omnisync::sync::{run_sync, SyncMode, SyncOptions};
//! use std::sync::Arc;
//!
//! let src = Arc::new(LocalBackend::new("/data"));
//! let dst = Arc::new(LocalBackend::new("/backup"));
//!
//! let options = SyncOptions {
//!     mode: SyncMode::Sync,
//!     ..SyncOptions::default()
//! };
//! let account = Account::new();
//! run_sync(src, dst, options, account.clone()).unwrap();
//! println!("moved {} bytes", account.bytes());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accounting;
pub mod backend;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod filter;
pub mod hash;
pub mod list;
pub mod ops;
pub mod prompt;
pub mod sync;
pub mod tls;
pub mod transfer;

// Re-export commonly used types
pub use accounting::{Account, AccountHandle};
pub use backend::{Backend, DynBackend, DynObject, Object};
pub use error::{Result, SyncError};
pub use sync::{run_sync, SyncMode, SyncOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use omnisync::prelude::*;
    //! ```

    pub use crate::accounting::{Account, AccountHandle};
    pub use crate::backend::{
        make_backend, Backend, DynBackend, DynObject, Entry, LocalBackend, MemoryBackend, Object,
    };
    pub use crate::config::{CliArgs, ConfigStore, RuntimeConfig};
    pub use crate::dedupe::{dedupe, DedupeMode};
    pub use crate::error::{Result, SyncError};
    pub use crate::filter::Filter;
    pub use crate::hash::{HashAlg, MultiHasher};
    pub use crate::list::{ListLevel, Lister};
    pub use crate::sync::{run_sync, SyncEngine, SyncMode, SyncOptions};
    pub use crate::transfer::{Pipeline, PipelineConfig, RetryPolicy};
}
