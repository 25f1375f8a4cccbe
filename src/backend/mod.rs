//! Backend abstraction for object stores
//!
//! Every store implements the [`Backend`] trait: a uniform view over
//! filesystems and remote object stores with different consistency,
//! naming and metadata models. Optional operations are discovered through
//! [`Features`] capability flags before a plan is chosen, never by
//! attempting the call and catching the failure.

mod local;
mod memory;
mod path;

pub use local::LocalBackend;
pub use memory::{FaultOp, MemoryBackend};
pub use path::{join_remote, make_backend, parent_dir, parse_remote, split_name};

use crate::error::{Result, SyncError};
use crate::hash::{HashAlg, HashAlgSet, HashSums};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Shared handle to a backend
pub type DynBackend = Arc<dyn Backend>;

/// Shared handle to an object
pub type DynObject = Arc<dyn Object>;

/// Static capability flags for a backend.
///
/// The engines consult these before choosing a plan; a backend that sets
/// a flag must override the corresponding default method body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    /// Server-side copy within the same store
    pub copy: bool,
    /// Server-side move/rename within the same store
    pub move_obj: bool,
    /// Server-side directory move
    pub dir_move: bool,
    /// Recursive delete cheaper than walking
    pub purge: bool,
    /// Vendor-specific trash emptying
    pub cleanup: bool,
    /// Recursive listing cheaper than per-directory walking
    pub list_r: bool,
}

/// Metadata describing an object about to be written
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Path relative to the backend root, no trailing separator
    pub remote: String,
    /// Size in bytes, negative when unknown
    pub size: i64,
    /// Modification time, if known
    pub mod_time: Option<SystemTime>,
    /// Digests already known for the content
    pub hashes: HashSums,
}

impl ObjectInfo {
    /// Info for a named object of known size and mtime
    pub fn new(remote: impl Into<String>, size: i64, mod_time: Option<SystemTime>) -> Self {
        Self {
            remote: remote.into(),
            size,
            mod_time,
            hashes: HashSums::new(),
        }
    }

    /// Info mirroring an existing object under a new name
    pub fn from_object(obj: &dyn Object, remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            size: obj.size(),
            mod_time: obj.mod_time(),
            hashes: HashSums::new(),
        }
    }
}

/// A non-leaf entry in a listing
#[derive(Debug, Clone)]
pub struct Directory {
    /// Path relative to the backend root
    pub remote: String,
    /// Number of children, if the store reports it
    pub count: Option<u64>,
    /// Modification time, if the store reports it
    pub mod_time: Option<SystemTime>,
}

/// One item produced by a listing
#[derive(Clone)]
pub enum Entry {
    /// A leaf object
    Object(DynObject),
    /// A subdirectory
    Dir(Directory),
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(o) => f.debug_tuple("Object").field(&o.remote()).finish(),
            Self::Dir(d) => f.debug_tuple("Dir").field(&d.remote).finish(),
        }
    }
}

/// Capability contract implemented by every store.
///
/// Required operations have no default body. Optional operations default
/// to `Unsupported`; the matching [`Features`] flag tells callers whether
/// the override exists.
pub trait Backend: Send + Sync {
    /// Configured name of this remote (e.g. `drive`, `local`)
    fn name(&self) -> &str;

    /// Root path within the store
    fn root(&self) -> &str;

    /// Canonical identity string (`name:root`). Two backends with equal
    /// ids address the same store and may use server-side operations
    /// between each other.
    fn id(&self) -> String {
        format!("{}:{}", self.name(), self.root())
    }

    /// Capability flags
    fn features(&self) -> Features;

    /// Algorithms this store can produce without reading content back
    fn hashes(&self) -> HashAlgSet;

    /// Smallest representable mtime increment
    fn precision(&self) -> Duration;

    /// List the direct children of `dir` (relative to root). Ordering is
    /// backend-defined; callers must not assume it.
    fn list(&self, dir: &str) -> Result<Vec<Entry>>;

    /// Look up a single object by its relative path
    fn new_object(&self, remote: &str) -> Result<DynObject>;

    /// Create an object from a reader. Parent directories are created as
    /// needed. Returns the new object.
    fn put(&self, reader: &mut dyn Read, info: &ObjectInfo) -> Result<DynObject>;

    /// Create a directory (and parents)
    fn mkdir(&self, dir: &str) -> Result<()>;

    /// Remove an empty directory; fails with `DirNotEmpty` otherwise
    fn rmdir(&self, dir: &str) -> Result<()>;

    /// Server-side copy of `src` to `dst_name` within this store
    fn copy(&self, _src: &dyn Object, _dst_name: &str) -> Result<DynObject> {
        Err(SyncError::unsupported(self.name(), "server-side copy"))
    }

    /// Server-side move of `src` to `dst_name` within this store
    fn move_obj(&self, _src: &dyn Object, _dst_name: &str) -> Result<DynObject> {
        Err(SyncError::unsupported(self.name(), "server-side move"))
    }

    /// Server-side directory move
    fn dir_move(&self, _src_dir: &str, _dst_dir: &str) -> Result<()> {
        Err(SyncError::unsupported(self.name(), "directory move"))
    }

    /// Recursive delete of `dir` and everything under it
    fn purge(&self, _dir: &str) -> Result<()> {
        Err(SyncError::unsupported(self.name(), "purge"))
    }

    /// Empty the store's trash, if it has one
    fn cleanup(&self) -> Result<()> {
        Err(SyncError::unsupported(self.name(), "cleanup"))
    }

    /// Recursive listing in one call
    fn list_r(&self, _dir: &str) -> Result<Vec<Entry>> {
        Err(SyncError::unsupported(self.name(), "recursive listing"))
    }
}

/// A leaf in a backend's namespace.
///
/// Objects are uniquely identified within their backend by `remote()`
/// and never extend the backend's lifetime: they hold only the minimal
/// shared state needed to perform their operations.
pub trait Object: Send + Sync + std::fmt::Debug {
    /// Path relative to the backend root, never with a trailing separator
    fn remote(&self) -> &str;

    /// Size in bytes; negative when unknown. Unknown size disables ETA
    /// but does not block transfer.
    fn size(&self) -> i64;

    /// Modification time, if known
    fn mod_time(&self) -> Option<SystemTime>;

    /// Digest for `alg`: `Ok(Some(_))` when known or computable,
    /// `Ok(None)` when the store supports the algorithm but has no value
    /// for this object, `Err(Unsupported)` otherwise.
    fn hash(&self, alg: HashAlg) -> Result<Option<String>>;

    /// Open the full content for reading
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// Open a byte range for reading
    fn open_range(&self, offset: u64, length: Option<u64>) -> Result<Box<dyn Read + Send>>;

    /// Replace the content in place
    fn update(&self, reader: &mut dyn Read, info: &ObjectInfo) -> Result<()>;

    /// Delete the object
    fn remove(&self) -> Result<()>;

    /// Set the modification time
    fn set_mod_time(&self, mod_time: SystemTime) -> Result<()>;

    /// Whether the object can be stored elsewhere (always true for
    /// regular content)
    fn storable(&self) -> bool {
        true
    }

    /// Downcast support. Stores that allow duplicate names need object
    /// identity beyond `remote()` to address one duplicate among many.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Whether two backends address the same store, making server-side
/// operations between them possible.
pub fn same_store(a: &dyn Backend, b: &dyn Backend) -> bool {
    a.id() == b.id()
}

/// Basename of a remote path
pub fn basename(remote: &str) -> &str {
    remote.rsplit('/').next().unwrap_or(remote)
}
