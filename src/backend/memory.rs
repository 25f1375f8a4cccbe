//! In-memory backend
//!
//! A deterministic store double used by the test suite and available as
//! a scratch space. Unlike a filesystem it permits several objects with
//! the same name, which is exactly the shape the dedupe engine exists
//! for, and it can inject scripted failures to exercise the retry path.

use crate::backend::{Backend, Directory, DynObject, Entry, Features, Object, ObjectInfo};
use crate::error::{Result, SyncError};
use crate::hash::{alg_set, HashAlg, HashAlgSet, HashSums, MultiHasher};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Read;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

/// Operations that can have failures scripted against them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    /// Fail the next `put`
    Put,
    /// Fail the next `open`
    Open,
    /// Fail the next `update`
    Update,
    /// Fail the next `remove`
    Remove,
    /// Fail the next recursive listing
    ListR,
}

#[derive(Debug)]
struct MemEntry {
    id: u64,
    remote: String,
    data: Arc<Vec<u8>>,
    mod_time: SystemTime,
    hashes: HashSums,
}

#[derive(Default, Debug)]
struct Store {
    entries: Vec<MemEntry>,
    dirs: BTreeSet<String>,
    next_id: u64,
}

impl Store {
    fn insert(&mut self, remote: String, data: Vec<u8>, mod_time: SystemTime) -> u64 {
        let hashes = digest_all(&data);
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(MemEntry {
            id,
            remote,
            data: Arc::new(data),
            mod_time,
            hashes,
        });
        id
    }

    fn find(&self, id: u64) -> Option<&MemEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut MemEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Whether `dir` exists, explicitly or as a prefix of some entry
    fn dir_exists(&self, dir: &str) -> bool {
        if dir.is_empty() || self.dirs.contains(dir) {
            return true;
        }
        let prefix = format!("{dir}/");
        self.entries.iter().any(|e| e.remote.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }
}

fn digest_all(data: &[u8]) -> HashSums {
    let mut hasher = MultiHasher::new(&alg_set(&HashAlg::ALL));
    hasher.update(data);
    hasher.finalize()
}

fn read_all(reader: &mut dyn Read) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| SyncError::transient(format!("read from source: {e}")))?;
    Ok(data)
}

/// In-memory object store
pub struct MemoryBackend {
    name: String,
    store: Arc<RwLock<Store>>,
    faults: Arc<Mutex<HashMap<FaultOp, VecDeque<SyncError>>>>,
    algs: HashAlgSet,
    precision: Duration,
}

impl MemoryBackend {
    /// Create a fresh, empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: Arc::new(RwLock::new(Store::default())),
            faults: Arc::new(Mutex::new(HashMap::new())),
            algs: alg_set(&HashAlg::ALL),
            precision: Duration::from_nanos(1),
        }
    }

    /// Restrict the algorithms the store claims to support
    pub fn with_hash_algs(mut self, algs: HashAlgSet) -> Self {
        self.algs = algs;
        self
    }

    /// Override the advertised mtime precision
    pub fn with_precision(mut self, precision: Duration) -> Self {
        self.precision = precision;
        self
    }

    /// Another handle onto the same store
    pub fn attach(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            faults: Arc::clone(&self.faults),
            algs: self.algs.clone(),
            precision: self.precision,
        }
    }

    /// Script a failure for the next occurrence of `op`. Multiple calls
    /// queue up in order.
    pub fn fail_next(&self, op: FaultOp, err: SyncError) {
        self.faults
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(err);
    }

    fn take_fault(&self, op: FaultOp) -> Option<SyncError> {
        self.faults
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(|q| q.pop_front())
    }

    /// Insert content directly; always creates a new object, even when
    /// the name already exists (the duplicate-name case).
    pub fn put_bytes(
        &self,
        remote: &str,
        data: &[u8],
        mod_time: SystemTime,
    ) -> DynObject {
        let id = self
            .store
            .write()
            .unwrap()
            .insert(remote.to_string(), data.to_vec(), mod_time);
        self.object_for(id, remote)
    }

    /// Names of all objects, in enumeration order
    pub fn object_names(&self) -> Vec<String> {
        self.store
            .read()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.remote.clone())
            .collect()
    }

    fn object_for(&self, id: u64, remote: &str) -> DynObject {
        Arc::new(MemObject {
            store: Arc::clone(&self.store),
            faults: Arc::clone(&self.faults),
            backend: self.name.clone(),
            id,
            remote: remote.to_string(),
        })
    }

    fn entries_under(&self, dir: &str, recursive: bool) -> Vec<Entry> {
        let store = self.store.read().unwrap();
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        let mut out = Vec::new();
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();

        for entry in &store.entries {
            let Some(rest) = entry.remote.strip_prefix(&prefix) else {
                continue;
            };
            match rest.find('/') {
                None => out.push(Entry::Object(self.object_for(entry.id, &entry.remote))),
                Some(i) => {
                    if recursive {
                        out.push(Entry::Object(self.object_for(entry.id, &entry.remote)));
                    }
                    // record the implied child directory
                    let child = format!("{prefix}{}", &rest[..i]);
                    seen_dirs.insert(child);
                }
            }
        }

        for d in &store.dirs {
            let Some(rest) = d.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.find('/') {
                None => {
                    seen_dirs.insert(d.clone());
                }
                Some(i) => {
                    seen_dirs.insert(format!("{prefix}{}", &rest[..i]));
                }
            }
        }

        if recursive {
            // expand implied intermediate directories too
            let mut all: BTreeSet<String> = seen_dirs;
            for entry in &store.entries {
                if let Some(rest) = entry.remote.strip_prefix(&prefix) {
                    let mut acc = prefix.clone();
                    let segments: Vec<&str> = rest.split('/').collect();
                    for seg in &segments[..segments.len().saturating_sub(1)] {
                        acc.push_str(seg);
                        all.insert(acc.clone());
                        acc.push('/');
                    }
                }
            }
            for d in all {
                out.push(Entry::Dir(Directory {
                    remote: d,
                    count: None,
                    mod_time: None,
                }));
            }
        } else {
            for d in seen_dirs {
                out.push(Entry::Dir(Directory {
                    remote: d,
                    count: None,
                    mod_time: None,
                }));
            }
        }

        out
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        ""
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
        self.algs.clone()
    }

    fn precision(&self) -> Duration {
        self.precision
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        if !self.store.read().unwrap().dir_exists(dir) {
            return Err(SyncError::DirNotFound(dir.to_string()));
        }
        Ok(self.entries_under(dir, false))
    }

    fn list_r(&self, dir: &str) -> Result<Vec<Entry>> {
        if let Some(err) = self.take_fault(FaultOp::ListR) {
            return Err(err);
        }
        if !self.store.read().unwrap().dir_exists(dir) {
            return Err(SyncError::DirNotFound(dir.to_string()));
        }
        Ok(self.entries_under(dir, true))
    }

    fn new_object(&self, remote: &str) -> Result<DynObject> {
        let found = {
            let store = self.store.read().unwrap();
            store
                .entries
                .iter()
                .find(|e| e.remote == remote)
                .map(|e| e.id)
        };
        match found {
            Some(id) => Ok(self.object_for(id, remote)),
            None => Err(SyncError::NotFound(remote.to_string())),
        }
    }

    fn put(&self, reader: &mut dyn Read, info: &ObjectInfo) -> Result<DynObject> {
        if let Some(err) = self.take_fault(FaultOp::Put) {
            return Err(err);
        }
        let data = read_all(reader)?;
        let mod_time = info.mod_time.unwrap_or_else(SystemTime::now);
        let id = self
            .store
            .write()
            .unwrap()
            .insert(info.remote.clone(), data, mod_time);
        Ok(self.object_for(id, &info.remote))
    }

    fn mkdir(&self, dir: &str) -> Result<()> {
        if dir.is_empty() {
            return Ok(());
        }
        let mut store = self.store.write().unwrap();
        let mut acc = String::new();
        for seg in dir.split('/') {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(seg);
            store.dirs.insert(acc.clone());
        }
        Ok(())
    }

    fn rmdir(&self, dir: &str) -> Result<()> {
        let mut store = self.store.write().unwrap();
        if !dir.is_empty() && !store.dir_exists(dir) {
            return Err(SyncError::DirNotFound(dir.to_string()));
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let has_children = store.entries.iter().any(|e| e.remote.starts_with(&prefix))
            || store
                .dirs
                .iter()
                .any(|d| d.starts_with(&prefix) && d.as_str() != dir);
        if has_children {
            return Err(SyncError::DirNotEmpty(dir.to_string()));
        }
        store.dirs.remove(dir);
        Ok(())
    }

    fn copy(&self, src: &dyn Object, dst_name: &str) -> Result<DynObject> {
        let src_id = mem_id(src)
            .ok_or_else(|| SyncError::unsupported(self.name(), "copy from foreign store"))?;
        let mut store = self.store.write().unwrap();
        let entry = store
            .find(src_id)
            .ok_or_else(|| SyncError::NotFound(src.remote().to_string()))?;
        let (data, mod_time) = (entry.data.as_ref().clone(), entry.mod_time);
        let id = store.insert(dst_name.to_string(), data, mod_time);
        drop(store);
        Ok(self.object_for(id, dst_name))
    }

    fn move_obj(&self, src: &dyn Object, dst_name: &str) -> Result<DynObject> {
        let src_id = mem_id(src)
            .ok_or_else(|| SyncError::unsupported(self.name(), "move from foreign store"))?;
        let mut store = self.store.write().unwrap();
        let entry = store
            .find_mut(src_id)
            .ok_or_else(|| SyncError::NotFound(src.remote().to_string()))?;
        entry.remote = dst_name.to_string();
        drop(store);
        Ok(self.object_for(src_id, dst_name))
    }

    fn dir_move(&self, src_dir: &str, dst_dir: &str) -> Result<()> {
        let mut store = self.store.write().unwrap();
        if !store.dir_exists(src_dir) {
            return Err(SyncError::DirNotFound(src_dir.to_string()));
        }
        let src_prefix = format!("{src_dir}/");
        for entry in &mut store.entries {
            if let Some(rest) = entry.remote.strip_prefix(&src_prefix) {
                entry.remote = format!("{dst_dir}/{rest}");
            }
        }
        let moved: Vec<String> = store
            .dirs
            .iter()
            .filter_map(|d| {
                d.strip_prefix(&src_prefix)
                    .map(|rest| format!("{dst_dir}/{rest}"))
            })
            .collect();
        store.dirs.retain(|d| !d.starts_with(&src_prefix) && d != src_dir);
        store.dirs.extend(moved);
        store.dirs.insert(dst_dir.to_string());
        Ok(())
    }

    fn purge(&self, dir: &str) -> Result<()> {
        let mut store = self.store.write().unwrap();
        if !store.dir_exists(dir) {
            return Err(SyncError::DirNotFound(dir.to_string()));
        }
        if dir.is_empty() {
            store.entries.clear();
            store.dirs.clear();
            return Ok(());
        }
        let prefix = format!("{dir}/");
        store.entries.retain(|e| !e.remote.starts_with(&prefix));
        store.dirs.retain(|d| !d.starts_with(&prefix) && d != dir);
        Ok(())
    }
}

fn mem_id(obj: &dyn Object) -> Option<u64> {
    obj.as_any().downcast_ref::<MemObject>().map(|m| m.id)
}

/// Object in a [`MemoryBackend`]. Reads live store state by insertion
/// id, so duplicates with the same name stay distinguishable.
pub struct MemObject {
    store: Arc<RwLock<Store>>,
    faults: Arc<Mutex<HashMap<FaultOp, VecDeque<SyncError>>>>,
    backend: String,
    id: u64,
    remote: String,
}

impl MemObject {
    fn take_fault(&self, op: FaultOp) -> Option<SyncError> {
        self.faults
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(|q| q.pop_front())
    }
}

impl Object for MemObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> i64 {
        self.store
            .read()
            .unwrap()
            .find(self.id)
            .map(|e| e.data.len() as i64)
            .unwrap_or(-1)
    }

    fn mod_time(&self) -> Option<SystemTime> {
        self.store.read().unwrap().find(self.id).map(|e| e.mod_time)
    }

    fn hash(&self, alg: HashAlg) -> Result<Option<String>> {
        let store = self.store.read().unwrap();
        let entry = store
            .find(self.id)
            .ok_or_else(|| SyncError::NotFound(self.remote.clone()))?;
        Ok(entry.hashes.get(&alg).cloned())
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        if let Some(err) = self.take_fault(FaultOp::Open) {
            return Err(err);
        }
        let store = self.store.read().unwrap();
        let entry = store
            .find(self.id)
            .ok_or_else(|| SyncError::NotFound(self.remote.clone()))?;
        Ok(Box::new(std::io::Cursor::new(entry.data.as_ref().clone())))
    }

    fn open_range(&self, offset: u64, length: Option<u64>) -> Result<Box<dyn Read + Send>> {
        let store = self.store.read().unwrap();
        let entry = store
            .find(self.id)
            .ok_or_else(|| SyncError::NotFound(self.remote.clone()))?;
        let data = entry.data.as_ref();
        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(len) => (start + len as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Box::new(std::io::Cursor::new(data[start..end].to_vec())))
    }

    fn update(&self, reader: &mut dyn Read, info: &ObjectInfo) -> Result<()> {
        if let Some(err) = self.take_fault(FaultOp::Update) {
            return Err(err);
        }
        let data = read_all(reader)?;
        let mod_time = info.mod_time.unwrap_or_else(SystemTime::now);
        let mut store = self.store.write().unwrap();
        let entry = store
            .find_mut(self.id)
            .ok_or_else(|| SyncError::NotFound(self.remote.clone()))?;
        entry.hashes = digest_all(&data);
        entry.data = Arc::new(data);
        entry.mod_time = mod_time;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        if let Some(err) = self.take_fault(FaultOp::Remove) {
            return Err(err);
        }
        let mut store = self.store.write().unwrap();
        let before = store.entries.len();
        store.entries.retain(|e| e.id != self.id);
        if store.entries.len() == before {
            return Err(SyncError::NotFound(self.remote.clone()));
        }
        Ok(())
    }

    fn set_mod_time(&self, mod_time: SystemTime) -> Result<()> {
        let mut store = self.store.write().unwrap();
        let entry = store
            .find_mut(self.id)
            .ok_or_else(|| SyncError::NotFound(self.remote.clone()))?;
        entry.mod_time = mod_time;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl std::fmt::Debug for MemObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemObject({}:{} #{})", self.backend, self.remote, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn test_put_and_lookup() {
        let mem = MemoryBackend::new("mem");
        mem.put_bytes("a.txt", b"AAA", now());
        mem.put_bytes("d/b.txt", b"BBB", now());

        let obj = mem.new_object("a.txt").unwrap();
        assert_eq!(obj.size(), 3);
        assert_eq!(
            obj.hash(HashAlg::Md5).unwrap().unwrap(),
            hash_bytes(b"AAA", HashAlg::Md5)
        );
        assert!(matches!(
            mem.new_object("missing"),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_levels() {
        let mem = MemoryBackend::new("mem");
        mem.put_bytes("a.txt", b"A", now());
        mem.put_bytes("d/b.txt", b"B", now());
        mem.put_bytes("d/e/c.txt", b"C", now());

        let top = mem.list("").unwrap();
        let objs: Vec<_> = top
            .iter()
            .filter_map(|e| match e {
                Entry::Object(o) => Some(o.remote().to_string()),
                _ => None,
            })
            .collect();
        let dirs: Vec<_> = top
            .iter()
            .filter_map(|e| match e {
                Entry::Dir(d) => Some(d.remote.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(objs, vec!["a.txt"]);
        assert_eq!(dirs, vec!["d"]);

        let all = mem.list_r("").unwrap();
        let obj_count = all
            .iter()
            .filter(|e| matches!(e, Entry::Object(_)))
            .count();
        assert_eq!(obj_count, 3);

        assert!(matches!(
            mem.list("nope"),
            Err(SyncError::DirNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_names_coexist() {
        let mem = MemoryBackend::new("mem");
        let first = mem.put_bytes("one.txt", b"content-a", now());
        let second = mem.put_bytes("one.txt", b"content-b", now());

        let all = mem.list_r("").unwrap();
        assert_eq!(all.len(), 2);

        // removing one duplicate leaves the other
        second.remove().unwrap();
        assert_eq!(mem.object_names(), vec!["one.txt"]);
        assert_eq!(first.size(), 9);
    }

    #[test]
    fn test_rmdir_semantics() {
        let mem = MemoryBackend::new("mem");
        mem.mkdir("d/e").unwrap();
        mem.put_bytes("d/x.txt", b"x", now());

        assert!(matches!(mem.rmdir("d"), Err(SyncError::DirNotEmpty(_))));
        mem.rmdir("d/e").unwrap();
        mem.new_object("d/x.txt").unwrap().remove().unwrap();
        mem.rmdir("d").unwrap();
        assert!(matches!(mem.rmdir("d"), Err(SyncError::DirNotFound(_))));
    }

    #[test]
    fn test_server_side_move_targets_one_duplicate() {
        let mem = MemoryBackend::new("mem");
        mem.put_bytes("two.txt", b"1", now());
        let dupe = mem.put_bytes("two.txt", b"22", now());

        mem.move_obj(dupe.as_ref(), "two-1.txt").unwrap();
        let mut names = mem.object_names();
        names.sort();
        assert_eq!(names, vec!["two-1.txt", "two.txt"]);
        assert_eq!(mem.new_object("two-1.txt").unwrap().size(), 2);
    }

    #[test]
    fn test_update_refreshes_content() {
        let mem = MemoryBackend::new("mem");
        let obj = mem.put_bytes("f", b"old", now());
        let info = ObjectInfo::new("f", 3, Some(now()));
        obj.update(&mut std::io::Cursor::new(b"new".to_vec()), &info)
            .unwrap();
        assert_eq!(
            obj.hash(HashAlg::Md5).unwrap().unwrap(),
            hash_bytes(b"new", HashAlg::Md5)
        );
    }

    #[test]
    fn test_fault_injection() {
        let mem = MemoryBackend::new("mem");
        mem.fail_next(FaultOp::Put, SyncError::transient("flaky"));

        let info = ObjectInfo::new("f", 1, Some(now()));
        let err = mem
            .put(&mut std::io::Cursor::new(b"x".to_vec()), &info)
            .unwrap_err();
        assert!(err.is_retryable());

        // second attempt goes through
        mem.put(&mut std::io::Cursor::new(b"x".to_vec()), &info)
            .unwrap();
    }

    #[test]
    fn test_purge_and_dir_move() {
        let mem = MemoryBackend::new("mem");
        mem.put_bytes("keep.txt", b"k", now());
        mem.put_bytes("d/a.txt", b"a", now());
        mem.put_bytes("d/sub/b.txt", b"b", now());

        mem.dir_move("d", "moved").unwrap();
        assert!(mem.new_object("moved/a.txt").is_ok());
        assert!(mem.new_object("d/a.txt").is_err());

        mem.purge("moved").unwrap();
        assert_eq!(mem.object_names(), vec!["keep.txt"]);
    }
}
