//! Local filesystem backend
//!
//! Rooted at an absolute directory. Digests are not stored by the
//! filesystem, so `hash()` computes them by streaming the file; mtime
//! precision is nanoseconds on Unix.

use crate::backend::{Backend, Directory, DynObject, Entry, Features, Object, ObjectInfo};
use crate::error::{IoResultExt, Result, SyncError};
use crate::hash::{alg_set, hash_stream, HashAlg, HashAlgSet};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Buffer size for streaming writes
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Backend over a local directory tree
pub struct LocalBackend {
    name: String,
    root: Arc<PathBuf>,
    root_str: String,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. The directory does not need to
    /// exist yet; `mkdir("")` creates it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::named("local", root)
    }

    /// Create a backend with an explicit remote name
    pub fn named(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_str = root.display().to_string();
        Self {
            name: name.into(),
            root: Arc::new(root),
            root_str,
        }
    }

    fn abs(&self, remote: &str) -> PathBuf {
        if remote.is_empty() {
            self.root.as_ref().clone()
        } else {
            remote.split('/').fold(self.root.as_ref().clone(), |p, seg| p.join(seg))
        }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.root.as_ref())
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn object_from_meta(&self, remote: String, meta: &fs::Metadata) -> DynObject {
        Arc::new(LocalObject {
            root: Arc::clone(&self.root),
            remote,
            size: meta.len() as i64,
            mod_time: meta.modified().ok(),
        })
    }

    fn entry_for(&self, path: &Path, meta: &fs::Metadata) -> Option<Entry> {
        let remote = self.relative(path);
        if remote.is_empty() {
            return None;
        }
        if meta.is_dir() {
            Some(Entry::Dir(Directory {
                remote,
                count: None,
                mod_time: meta.modified().ok(),
            }))
        } else if meta.is_file() {
            Some(Entry::Object(self.object_from_meta(remote, meta)))
        } else {
            // sockets, fifos and friends are not storable objects
            None
        }
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        &self.root_str
    }

    fn id(&self) -> String {
        format!("local:{}", self.root_str)
    }

    fn features(&self) -> Features {
        Features {
            copy: true,
            move_obj: true,
            dir_move: true,
            purge: true,
            cleanup: false,
            list_r: true,
        }
    }

    fn hashes(&self) -> HashAlgSet {
        alg_set(&HashAlg::ALL)
    }

    fn precision(&self) -> Duration {
        if cfg!(unix) {
            Duration::from_nanos(1)
        } else {
            // FAT and friends resolve to whole seconds at worst
            Duration::from_secs(1)
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        let abs = self.abs(dir);
        let read = fs::read_dir(&abs).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SyncError::DirNotFound(dir.to_string()),
            _ => SyncError::from_io(&abs, e),
        })?;

        let mut entries = Vec::new();
        for item in read {
            let item = item.with_path(&abs)?;
            let meta = item.metadata().with_path(item.path())?;
            if let Some(entry) = self.entry_for(&item.path(), &meta) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn list_r(&self, dir: &str) -> Result<Vec<Entry>> {
        let abs = self.abs(dir);
        if !abs.exists() {
            return Err(SyncError::DirNotFound(dir.to_string()));
        }

        let mut entries = Vec::new();
        for item in WalkDir::new(&abs).min_depth(1).follow_links(false) {
            let item =
                item.map_err(|e| SyncError::transient(format!("walk {}: {e}", abs.display())))?;
            let meta = item.metadata().map_err(|e| {
                SyncError::transient(format!("stat {}: {e}", item.path().display()))
            })?;
            if let Some(entry) = self.entry_for(item.path(), &meta) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn new_object(&self, remote: &str) -> Result<DynObject> {
        let abs = self.abs(remote);
        let meta = fs::metadata(&abs)
            .map_err(|_| SyncError::NotFound(remote.to_string()))?;
        if meta.is_dir() {
            return Err(SyncError::NotFound(remote.to_string()));
        }
        Ok(self.object_from_meta(remote.to_string(), &meta))
    }

    fn put(&self, reader: &mut dyn Read, info: &ObjectInfo) -> Result<DynObject> {
        let abs = self.abs(&info.remote);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        let file = File::create(&abs).with_path(&abs)?;
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader
                .read(&mut buffer)
                .map_err(|e| SyncError::transient(format!("read from source: {e}")))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).with_path(&abs)?;
        }
        writer.flush().with_path(&abs)?;
        drop(writer);

        if let Some(mtime) = info.mod_time {
            filetime::set_file_mtime(&abs, FileTime::from_system_time(mtime))
                .with_path(&abs)?;
        }

        let meta = fs::metadata(&abs).with_path(&abs)?;
        Ok(self.object_from_meta(info.remote.clone(), &meta))
    }

    fn mkdir(&self, dir: &str) -> Result<()> {
        let abs = self.abs(dir);
        fs::create_dir_all(&abs).with_path(&abs)
    }

    fn rmdir(&self, dir: &str) -> Result<()> {
        let abs = self.abs(dir);
        match fs::remove_dir(&abs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::DirNotFound(dir.to_string()))
            }
            Err(e) => {
                let non_empty = fs::read_dir(&abs)
                    .map(|mut it| it.next().is_some())
                    .unwrap_or(false);
                if non_empty {
                    Err(SyncError::DirNotEmpty(dir.to_string()))
                } else {
                    Err(SyncError::from_io(&abs, e))
                }
            }
        }
    }

    fn copy(&self, src: &dyn Object, dst_name: &str) -> Result<DynObject> {
        let src_abs = self.abs(src.remote());
        let dst_abs = self.abs(dst_name);
        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::copy(&src_abs, &dst_abs).with_path(&dst_abs)?;
        if let Some(mtime) = src.mod_time() {
            filetime::set_file_mtime(&dst_abs, FileTime::from_system_time(mtime))
                .with_path(&dst_abs)?;
        }
        let meta = fs::metadata(&dst_abs).with_path(&dst_abs)?;
        Ok(self.object_from_meta(dst_name.to_string(), &meta))
    }

    fn move_obj(&self, src: &dyn Object, dst_name: &str) -> Result<DynObject> {
        let src_abs = self.abs(src.remote());
        let dst_abs = self.abs(dst_name);
        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        match fs::rename(&src_abs, &dst_abs) {
            Ok(()) => {}
            Err(_) => {
                // cross-device rename; fall back to copy and delete
                self.copy(src, dst_name)?;
                fs::remove_file(&src_abs).with_path(&src_abs)?;
            }
        }
        let meta = fs::metadata(&dst_abs).with_path(&dst_abs)?;
        Ok(self.object_from_meta(dst_name.to_string(), &meta))
    }

    fn dir_move(&self, src_dir: &str, dst_dir: &str) -> Result<()> {
        let src_abs = self.abs(src_dir);
        let dst_abs = self.abs(dst_dir);
        if !src_abs.exists() {
            return Err(SyncError::DirNotFound(src_dir.to_string()));
        }
        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::rename(&src_abs, &dst_abs).with_path(&dst_abs)
    }

    fn purge(&self, dir: &str) -> Result<()> {
        let abs = self.abs(dir);
        if !abs.exists() {
            return Err(SyncError::DirNotFound(dir.to_string()));
        }
        fs::remove_dir_all(&abs).with_path(&abs)
    }
}

/// Object backed by a file under a [`LocalBackend`] root
#[derive(Debug)]
pub struct LocalObject {
    root: Arc<PathBuf>,
    remote: String,
    size: i64,
    mod_time: Option<SystemTime>,
}

impl LocalObject {
    fn path(&self) -> PathBuf {
        self.remote
            .split('/')
            .fold(self.root.as_ref().clone(), |p, seg| p.join(seg))
    }
}

impl Object for LocalObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> i64 {
        fs::metadata(self.path())
            .map(|m| m.len() as i64)
            .unwrap_or(self.size)
    }

    fn mod_time(&self) -> Option<SystemTime> {
        fs::metadata(self.path())
            .ok()
            .and_then(|m| m.modified().ok())
            .or(self.mod_time)
    }

    fn hash(&self, alg: HashAlg) -> Result<Option<String>> {
        let path = self.path();
        let file = File::open(&path).with_path(&path)?;
        let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, file);
        let (sums, _) = hash_stream(&mut reader, &alg_set(&[alg]))?;
        Ok(sums.get(&alg).cloned())
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let path = self.path();
        let file = File::open(&path).with_path(&path)?;
        Ok(Box::new(BufReader::with_capacity(COPY_BUFFER_SIZE, file)))
    }

    fn open_range(&self, offset: u64, length: Option<u64>) -> Result<Box<dyn Read + Send>> {
        use std::io::{Seek, SeekFrom};
        let path = self.path();
        let mut file = File::open(&path).with_path(&path)?;
        file.seek(SeekFrom::Start(offset)).with_path(&path)?;
        let reader: Box<dyn Read + Send> = match length {
            Some(len) => Box::new(file.take(len)),
            None => Box::new(file),
        };
        Ok(reader)
    }

    fn update(&self, reader: &mut dyn Read, info: &ObjectInfo) -> Result<()> {
        let path = self.path();
        let file = File::create(&path).with_path(&path)?;
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader
                .read(&mut buffer)
                .map_err(|e| SyncError::transient(format!("read from source: {e}")))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).with_path(&path)?;
        }
        writer.flush().with_path(&path)?;
        drop(writer);

        if let Some(mtime) = info.mod_time {
            filetime::set_file_mtime(&path, FileTime::from_system_time(mtime))
                .with_path(&path)?;
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let path = self.path();
        fs::remove_file(&path).with_path(&path)
    }

    fn set_mod_time(&self, mod_time: SystemTime) -> Result<()> {
        let path = self.path();
        filetime::set_file_mtime(&path, FileTime::from_system_time(mod_time)).with_path(&path)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use tempfile::TempDir;

    fn backend() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let be = LocalBackend::new(dir.path());
        (dir, be)
    }

    fn put(be: &LocalBackend, remote: &str, data: &[u8]) -> DynObject {
        let info = ObjectInfo::new(remote, data.len() as i64, Some(SystemTime::now()));
        be.put(&mut std::io::Cursor::new(data.to_vec()), &info)
            .unwrap()
    }

    #[test]
    fn test_put_creates_parents() {
        let (_dir, be) = backend();
        let obj = put(&be, "deep/nested/file.txt", b"payload");
        assert_eq!(obj.size(), 7);
        assert!(be.new_object("deep/nested/file.txt").is_ok());
    }

    #[test]
    fn test_hash_by_streaming() {
        let (_dir, be) = backend();
        let obj = put(&be, "f.bin", b"hash me");
        assert_eq!(
            obj.hash(HashAlg::Sha1).unwrap().unwrap(),
            hash_bytes(b"hash me", HashAlg::Sha1)
        );
    }

    #[test]
    fn test_list_and_list_r() {
        let (_dir, be) = backend();
        put(&be, "a.txt", b"A");
        put(&be, "d/b.txt", b"B");

        let top = be.list("").unwrap();
        assert_eq!(top.len(), 2); // a.txt and d

        let all = be.list_r("").unwrap();
        let objs = all
            .iter()
            .filter(|e| matches!(e, Entry::Object(_)))
            .count();
        assert_eq!(objs, 2);

        assert!(matches!(be.list("absent"), Err(SyncError::DirNotFound(_))));
    }

    #[test]
    fn test_set_mod_time_roundtrip() {
        let (_dir, be) = backend();
        let obj = put(&be, "t.txt", b"x");
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        obj.set_mod_time(stamp).unwrap();
        let got = obj.mod_time().unwrap();
        let delta = got
            .duration_since(stamp)
            .unwrap_or_else(|e| e.duration());
        assert!(delta < Duration::from_secs(1));
    }

    #[test]
    fn test_rmdir_not_empty() {
        let (_dir, be) = backend();
        put(&be, "d/b.txt", b"B");
        assert!(matches!(be.rmdir("d"), Err(SyncError::DirNotEmpty(_))));
        be.new_object("d/b.txt").unwrap().remove().unwrap();
        be.rmdir("d").unwrap();
    }

    #[test]
    fn test_server_side_copy_and_move() {
        let (_dir, be) = backend();
        let src = put(&be, "orig.txt", b"body");

        let copied = be.copy(src.as_ref(), "copy.txt").unwrap();
        assert_eq!(copied.size(), 4);
        assert!(be.new_object("orig.txt").is_ok());

        be.move_obj(src.as_ref(), "moved.txt").unwrap();
        assert!(be.new_object("orig.txt").is_err());
        assert!(be.new_object("moved.txt").is_ok());
    }

    #[test]
    fn test_purge() {
        let (_dir, be) = backend();
        put(&be, "d/a.txt", b"a");
        put(&be, "d/sub/b.txt", b"b");
        be.purge("d").unwrap();
        assert!(matches!(be.list("d"), Err(SyncError::DirNotFound(_))));
    }
}
