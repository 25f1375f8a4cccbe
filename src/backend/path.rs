//! Remote path syntax and backend construction
//!
//! A remote is addressed as `name:path` where `name` matches a section
//! of the config store. A bare path, or `:path`, means the local
//! filesystem.

use crate::backend::{DynBackend, LocalBackend, MemoryBackend};
use crate::config::ConfigStore;
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Split `name:path` syntax. Returns `(None, path)` for plain local
/// paths; a leading `:` also means local.
pub fn parse_remote(spec: &str) -> (Option<&str>, &str) {
    if let Some((name, path)) = spec.split_once(':') {
        if name.is_empty() {
            return (None, path);
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        // single letters are `C:\...` style paths, not remote names
        if valid && name.len() > 1 {
            return (Some(name), path);
        }
    }
    (None, spec)
}

/// Join a directory prefix and a child name with `/`
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent directory of a remote path, empty at the root
pub fn parent_dir(remote: &str) -> &str {
    match remote.rfind('/') {
        Some(i) => &remote[..i],
        None => "",
    }
}

/// Split a remote path into `(parent, basename)`
pub fn split_name(remote: &str) -> (&str, &str) {
    match remote.rfind('/') {
        Some(i) => (&remote[..i], &remote[i + 1..]),
        None => ("", remote),
    }
}

fn memory_stores() -> &'static Mutex<HashMap<String, MemoryBackend>> {
    static STORES: OnceLock<Mutex<HashMap<String, MemoryBackend>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Construct a backend for a `name:path` spec using the config store.
///
/// Unnamed specs become local backends rooted at the given path.
/// Configured sections choose the backend by their `type` key.
pub fn make_backend(spec: &str, store: &ConfigStore) -> Result<DynBackend> {
    let (name, path) = parse_remote(spec);

    let Some(name) = name else {
        let root = PathBuf::from(path);
        return Ok(Arc::new(LocalBackend::new(root)));
    };

    let section = store
        .section(name)
        .ok_or_else(|| SyncError::config(format!("remote '{name}' is not configured")))?;

    let typ = section
        .get("type")
        .map(String::as_str)
        .ok_or_else(|| SyncError::config(format!("remote '{name}' has no type")))?;

    match typ {
        "local" => {
            let base = section
                .get("path")
                .map(String::as_str)
                .unwrap_or("");
            let root = PathBuf::from(base).join(path.trim_start_matches('/'));
            Ok(Arc::new(LocalBackend::named(name, root)))
        }
        "memory" => {
            // one shared store per configured name within the process
            let mut stores = memory_stores().lock().unwrap();
            let proto = stores
                .entry(name.to_string())
                .or_insert_with(|| MemoryBackend::new(name));
            Ok(Arc::new(proto.attach()))
        }
        other => Err(SyncError::config(format!(
            "remote '{name}' has unknown type '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    #[test]
    fn test_parse_remote() {
        assert_eq!(parse_remote("drive:photos/sub"), (Some("drive"), "photos/sub"));
        assert_eq!(parse_remote("/tmp/data"), (None, "/tmp/data"));
        assert_eq!(parse_remote(":relative/dir"), (None, "relative/dir"));
        assert_eq!(parse_remote("s3:bucket"), (Some("s3"), "bucket"));
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_remote("", "a.txt"), "a.txt");
        assert_eq!(join_remote("d/e", "a.txt"), "d/e/a.txt");
        assert_eq!(parent_dir("d/e/a.txt"), "d/e");
        assert_eq!(parent_dir("a.txt"), "");
        assert_eq!(split_name("d/a.txt"), ("d", "a.txt"));
        assert_eq!(split_name("a.txt"), ("", "a.txt"));
    }

    #[test]
    fn test_make_backend_local_unnamed() {
        let store = ConfigStore::default();
        let be = make_backend("/tmp/somewhere", &store).unwrap();
        assert_eq!(be.name(), "local");
    }

    #[test]
    fn test_make_backend_configured() {
        let mut store = ConfigStore::default();
        store.set("archive", "type", "local");
        store.set("archive", "path", "/tmp/archive");

        let be = make_backend("archive:sub", &store).unwrap();
        assert_eq!(be.name(), "archive");
        assert!(be.root().ends_with("sub"));

        assert!(make_backend("missing:x", &store).is_err());
    }

    #[test]
    fn test_memory_backends_share_store() {
        let mut store = ConfigStore::default();
        store.set("scratch", "type", "memory");

        let a = make_backend("scratch:", &store).unwrap();
        let b = make_backend("scratch:", &store).unwrap();
        assert_eq!(a.id(), b.id());
    }
}
