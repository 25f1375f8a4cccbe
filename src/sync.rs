//! Sync and reconciliation engine
//!
//! Walks source and destination in parallel, merges the listings by
//! relative path, decides a verdict per path, and feeds the transfer
//! pipeline. Deletes never run before the transfers they depend on have
//! succeeded.

use crate::accounting::AccountHandle;
use crate::backend::{DynBackend, DynObject, Entry};
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::hash::common_alg;
use crate::list::Lister;
use crate::ops::move_object;
use crate::transfer::{Pipeline, PipelineConfig, RetryPolicy, TransferRequest};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// What to do with the destination tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Copy source objects over, leave everything else alone
    Copy,
    /// Make the destination identical, deleting extras
    Sync,
    /// Copy, then delete the sources
    Move,
}

/// Options for a sync run
#[derive(Clone)]
pub struct SyncOptions {
    /// Operation mode
    pub mode: SyncMode,
    /// Concurrent transfers
    pub transfers: usize,
    /// Concurrent listing/checking tasks
    pub checkers: usize,
    /// Per-transfer attempt bound
    pub low_level_retries: usize,
    /// Log instead of act
    pub dry_run: bool,
    /// Convert matching copy+delete pairs into renames
    pub track_renames: bool,
    /// Include/exclude rules
    pub filter: Arc<Filter>,
    /// Retry schedule override; defaults to the standard backoff with
    /// `low_level_retries` attempts
    pub policy: Option<RetryPolicy>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Copy,
            transfers: 4,
            checkers: 8,
            low_level_retries: 10,
            dry_run: false,
            track_renames: false,
            filter: Arc::new(Filter::default()),
            policy: None,
        }
    }
}

impl SyncOptions {
    fn retry_policy(&self) -> RetryPolicy {
        self.policy
            .clone()
            .unwrap_or_else(|| RetryPolicy::with_retries(self.low_level_retries))
    }
}

/// Per-path verdict from the comparison phase
enum Verdict {
    /// Not at the destination yet
    TransferNew(DynObject),
    /// Present but different; overwrite
    TransferChanged(DynObject, DynObject),
    /// Present and equal
    Equal(DynObject),
}

/// One sync run between two stores
pub struct SyncEngine {
    src_fs: DynBackend,
    dst_fs: DynBackend,
    options: SyncOptions,
    account: AccountHandle,
    cancel: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Create an engine
    pub fn new(
        src_fs: DynBackend,
        dst_fs: DynBackend,
        options: SyncOptions,
        account: AccountHandle,
    ) -> Self {
        Self {
            src_fs,
            dst_fs,
            options,
            account,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag for cooperative cancellation
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Execute the run
    pub fn run(&self) -> Result<()> {
        let (src_list, dst_list) = self.list_both()?;

        if src_list.root_missing {
            return Err(SyncError::DirNotFound(self.src_fs.id()));
        }
        if self.cancelled() {
            return Err(SyncError::Cancelled);
        }

        // index both sides by relative path
        let (src_objs, src_dirs) = index_entries(&src_list.entries);
        let (dst_objs, dst_dirs) = index_entries(&dst_list.entries);

        self.make_dirs(&src_dirs, &dst_dirs)?;

        // verdicts, checked in parallel
        let verdicts = self.compare(&src_objs, &dst_objs)?;

        let mut to_transfer: Vec<(String, DynObject, Option<DynObject>)> = Vec::new();
        let mut equal_pairs: Vec<(String, DynObject)> = Vec::new();
        for (name, verdict) in verdicts {
            match verdict {
                Verdict::TransferNew(src) => to_transfer.push((name, src, None)),
                Verdict::TransferChanged(src, dst) => to_transfer.push((name, src, Some(dst))),
                Verdict::Equal(src) => equal_pairs.push((name, src)),
            }
        }

        let mut to_delete: BTreeMap<String, DynObject> = dst_objs
            .iter()
            .filter(|(name, _)| !src_objs.contains_key(*name))
            .map(|(name, obj)| (name.clone(), Arc::clone(obj)))
            .collect();

        if self.options.track_renames && self.options.mode == SyncMode::Sync {
            self.track_renames(&mut to_transfer, &mut to_delete);
        }

        // transfer phase
        let total: i64 = to_transfer
            .iter()
            .map(|(_, src, _)| src.size().max(0))
            .sum();
        self.account.set_total_bytes(total as u64);

        let pipeline = Pipeline::new(
            PipelineConfig {
                transfers: self.options.transfers,
                policy: self.options.retry_policy(),
                dry_run: self.options.dry_run,
            },
            self.account.clone(),
            Arc::clone(&self.cancel),
        );

        for (name, src, existing) in to_transfer {
            pipeline.submit(TransferRequest {
                src,
                src_fs: Arc::clone(&self.src_fs),
                dst_fs: Arc::clone(&self.dst_fs),
                dst_name: name,
                existing_dst: existing,
                delete_src_after: self.options.mode == SyncMode::Move,
            })?;
        }
        let outcomes = pipeline.finish();
        let failed = outcomes.iter().filter(|o| !o.ok()).count();

        // in move mode, sources whose content already sits at the
        // destination are deleted once their equality is established
        if self.options.mode == SyncMode::Move {
            for (name, src) in &equal_pairs {
                if self.cancelled() {
                    return Err(SyncError::Cancelled);
                }
                if self.options.dry_run {
                    tracing::info!("(dry run) would delete source {name}");
                    continue;
                }
                match src.remove() {
                    Ok(()) => self.account.inc_deletes(),
                    Err(e) => {
                        tracing::error!("deleting source {name}: {e}");
                        self.account.record_error(&e);
                    }
                }
            }
        }

        // delete phase, strictly after the transfers
        if self.options.mode == SyncMode::Sync {
            if failed > 0 {
                tracing::warn!(
                    "not deleting {} extraneous objects: {failed} transfers failed",
                    to_delete.len()
                );
            } else {
                self.delete_extraneous(&to_delete)?;
            }
        }

        Ok(())
    }

    fn list_both(
        &self,
    ) -> Result<(crate::list::ListResult, crate::list::ListResult)> {
        let lister = Lister::new()
            .filter(Arc::clone(&self.options.filter))
            .checkers(self.options.checkers);

        let src_fs = Arc::clone(&self.src_fs);
        let dst_fs = Arc::clone(&self.dst_fs);

        let (src_res, dst_res) = thread::scope(|scope| {
            let dst_handle = scope.spawn(|| lister.get_all(dst_fs, ""));
            let src_res = lister.get_all(src_fs, "");
            (src_res, dst_handle.join().expect("listing thread panicked"))
        });

        Ok((src_res?, dst_res?))
    }

    fn make_dirs(&self, src_dirs: &BTreeSet<String>, dst_dirs: &BTreeSet<String>) -> Result<()> {
        // BTreeSet order creates parents before children
        for dir in src_dirs.difference(dst_dirs) {
            if self.options.dry_run {
                tracing::info!("(dry run) would create directory {dir}");
                continue;
            }
            self.dst_fs.mkdir(dir)?;
        }
        Ok(())
    }

    fn compare(
        &self,
        src_objs: &BTreeMap<String, DynObject>,
        dst_objs: &BTreeMap<String, DynObject>,
    ) -> Result<Vec<(String, Verdict)>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.checkers.max(1))
            .build()
            .map_err(|e| SyncError::fatal(format!("checker pool: {e}")))?;

        use rayon::prelude::*;
        let pairs: Vec<(&String, &DynObject)> = src_objs.iter().collect();
        let verdicts: Vec<(String, Verdict)> = pool.install(|| {
            pairs
                .par_iter()
                .map(|(name, src)| {
                    let verdict = match dst_objs.get(*name) {
                        None => Verdict::TransferNew(Arc::clone(src)),
                        Some(dst) => {
                            self.account.inc_checks();
                            if self.objects_equal(src, dst) {
                                tracing::debug!("{name}: unchanged, skipping");
                                Verdict::Equal(Arc::clone(src))
                            } else {
                                tracing::debug!("{name}: differs, transferring");
                                Verdict::TransferChanged(Arc::clone(src), Arc::clone(dst))
                            }
                        }
                    };
                    ((*name).clone(), verdict)
                })
                .collect()
        });
        Ok(verdicts)
    }

    /// Equality per the comparison priority: a common digest decides;
    /// otherwise equal sizes with mtimes inside the coarser precision
    /// window; otherwise different.
    fn objects_equal(&self, src: &DynObject, dst: &DynObject) -> bool {
        let src_size = src.size();
        let dst_size = dst.size();
        if src_size >= 0 && dst_size >= 0 && src_size != dst_size {
            return false;
        }

        if let Some(alg) = common_alg(&self.src_fs.hashes(), &self.dst_fs.hashes()) {
            match (src.hash(alg), dst.hash(alg)) {
                (Ok(Some(a)), Ok(Some(b))) => return a == b,
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("hash check failed for {}: {e}", src.remote());
                    self.account.record_error(&e);
                    return false;
                }
                // digest not available on one side; fall through
                _ => {}
            }
        }

        let window = self.src_fs.precision().max(self.dst_fs.precision());
        match (src.mod_time(), dst.mod_time()) {
            (Some(a), Some(b)) => time_within(a, b, window.max(Duration::from_nanos(1))),
            _ => false,
        }
    }

    /// Convert unmatched src-only/dst-only pairs of identical content
    /// into a rename on the destination.
    fn track_renames(
        &self,
        to_transfer: &mut Vec<(String, DynObject, Option<DynObject>)>,
        to_delete: &mut BTreeMap<String, DynObject>,
    ) {
        let Some(alg) = common_alg(&self.src_fs.hashes(), &self.dst_fs.hashes()) else {
            tracing::debug!("track-renames disabled: no common hash");
            return;
        };

        // index deletion candidates by (size, digest)
        let mut by_content: BTreeMap<(i64, String), Vec<String>> = BTreeMap::new();
        for (name, obj) in to_delete.iter() {
            if let Ok(Some(digest)) = obj.hash(alg) {
                by_content
                    .entry((obj.size(), digest))
                    .or_default()
                    .push(name.clone());
            }
        }

        let mut handled = Vec::new();
        for (name, src, existing) in to_transfer.iter() {
            if existing.is_some() {
                continue;
            }
            let Ok(Some(digest)) = src.hash(alg) else {
                continue;
            };
            let key = (src.size(), digest);
            let Some(candidates) = by_content.get_mut(&key) else {
                continue;
            };
            let Some(old_name) = candidates.pop() else {
                continue;
            };

            if self.options.dry_run {
                tracing::info!("(dry run) would rename {old_name} to {name}");
                handled.push((name.clone(), old_name));
                continue;
            }

            let Some(dst_obj) = to_delete.get(&old_name) else {
                continue;
            };
            match move_object(&self.dst_fs, dst_obj, name) {
                Ok(_) => {
                    tracing::info!("{name}: renamed from {old_name}");
                    self.account.inc_renames();
                    handled.push((name.clone(), old_name));
                }
                Err(e) => {
                    tracing::warn!("rename {old_name} to {name} failed: {e}; copying instead");
                    candidates.push(old_name);
                }
            }
        }

        for (new_name, old_name) in handled {
            to_transfer.retain(|(name, _, _)| *name != new_name);
            to_delete.remove(&old_name);
        }
    }

    fn delete_extraneous(&self, to_delete: &BTreeMap<String, DynObject>) -> Result<()> {
        for (name, obj) in to_delete {
            if self.cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.options.dry_run {
                tracing::info!("(dry run) would delete {name}");
                continue;
            }
            match obj.remove() {
                Ok(()) => {
                    tracing::info!("{name}: deleted");
                    self.account.inc_deletes();
                }
                Err(e) => {
                    tracing::error!("deleting {name}: {e}");
                    self.account.record_error(&e);
                }
            }
        }
        Ok(())
    }
}

/// Whether two instants are within `window` of each other
fn time_within(a: SystemTime, b: SystemTime, window: Duration) -> bool {
    let delta = match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    delta <= window
}

fn index_entries(entries: &[Entry]) -> (BTreeMap<String, DynObject>, BTreeSet<String>) {
    let mut objs = BTreeMap::new();
    let mut dirs = BTreeSet::new();
    for entry in entries {
        match entry {
            Entry::Object(obj) => {
                if objs
                    .insert(obj.remote().to_string(), Arc::clone(obj))
                    .is_some()
                {
                    tracing::warn!("duplicate name in listing: {}", obj.remote());
                }
            }
            Entry::Dir(dir) => {
                dirs.insert(dir.remote.clone());
            }
        }
    }
    (objs, dirs)
}

/// Run a sync with the given mode between two stores
pub fn run_sync(
    src_fs: DynBackend,
    dst_fs: DynBackend,
    options: SyncOptions,
    account: AccountHandle,
) -> Result<()> {
    SyncEngine::new(src_fs, dst_fs, options, account).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::Account;
    use crate::backend::{Backend, MemoryBackend};
    use crate::hash::{alg_set, hash_bytes, HashAlg, HashAlgSet};

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn opts(mode: SyncMode) -> SyncOptions {
        SyncOptions {
            mode,
            transfers: 2,
            checkers: 2,
            ..SyncOptions::default()
        }
    }

    fn names(fs: &MemoryBackend) -> Vec<String> {
        let mut names = fs.object_names();
        names.sort();
        names
    }

    #[test]
    fn test_basic_copy() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"AAA", now());
        src.put_bytes("d/b.txt", b"BBB", now());

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Copy), account.clone()).unwrap();

        assert_eq!(names(&dst), vec!["a.txt", "d/b.txt"]);
        assert_eq!(account.transfers(), 2);
        assert_eq!(account.errors(), 0);

        for name in ["a.txt", "d/b.txt"] {
            let s = src.new_object(name).unwrap();
            let d = dst.new_object(name).unwrap();
            assert_eq!(
                s.hash(HashAlg::Md5).unwrap(),
                d.hash(HashAlg::Md5).unwrap()
            );
        }
    }

    #[test]
    fn test_copy_is_non_destructive() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"AAA", now());
        dst.put_bytes("pre-existing.txt", b"KEEP", now());

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Copy), account).unwrap();

        assert_eq!(names(&dst), vec!["a.txt", "pre-existing.txt"]);
    }

    #[test]
    fn test_sync_deletes_extraneous() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"AAA", now());
        dst.put_bytes("a.txt", b"AAA", now());
        dst.put_bytes("stale.txt", b"XXX", now());

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Sync), account.clone()).unwrap();

        assert_eq!(names(&dst), vec!["a.txt"]);
        assert_eq!(account.transfers(), 0);
        assert_eq!(account.deletes(), 1);
        assert_eq!(account.checks(), 1);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"AAA", now());
        src.put_bytes("d/b.txt", b"BBB", now());

        run_sync(src.clone(), dst.clone(), opts(SyncMode::Sync), Account::new()).unwrap();

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Sync), account.clone()).unwrap();
        assert_eq!(account.transfers(), 0);
        assert_eq!(account.deletes(), 0);
        assert_eq!(account.checks(), 2);
    }

    #[test]
    fn test_mtime_within_precision_is_equal() {
        // no common hash forces the size+mtime comparison
        let no_hashes: HashAlgSet = alg_set(&[]);
        let src = Arc::new(
            MemoryBackend::new("src")
                .with_hash_algs(no_hashes.clone())
                .with_precision(Duration::from_secs(1)),
        );
        let dst = Arc::new(
            MemoryBackend::new("dst")
                .with_hash_algs(no_hashes)
                .with_precision(Duration::from_secs(1)),
        );

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200);
        src.put_bytes("x", b"Q", base);
        dst.put_bytes("x", b"Q", base + Duration::from_millis(300));

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Sync), account.clone()).unwrap();
        assert_eq!(account.transfers(), 0);
        assert_eq!(account.checks(), 1);
    }

    #[test]
    fn test_mtime_outside_precision_transfers() {
        let no_hashes: HashAlgSet = alg_set(&[]);
        let src = Arc::new(MemoryBackend::new("src").with_hash_algs(no_hashes.clone()));
        let dst = Arc::new(MemoryBackend::new("dst").with_hash_algs(no_hashes));

        let base = now();
        src.put_bytes("x", b"Q", base);
        dst.put_bytes("x", b"Q", base + Duration::from_secs(90));

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Sync), account.clone()).unwrap();
        assert_eq!(account.transfers(), 1);
    }

    #[test]
    fn test_changed_content_overwrites() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"new content", now());
        dst.put_bytes("a.txt", b"old", now());

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Sync), account.clone()).unwrap();

        assert_eq!(account.transfers(), 1);
        let d = dst.new_object("a.txt").unwrap();
        assert_eq!(
            d.hash(HashAlg::Md5).unwrap().unwrap(),
            hash_bytes(b"new content", HashAlg::Md5)
        );
        // still exactly one object of that name
        assert_eq!(names(&dst), vec!["a.txt"]);
    }

    #[test]
    fn test_move_conservation() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"AAA", now());
        src.put_bytes("d/b.txt", b"BBB", now());
        dst.put_bytes("a.txt", b"AAA", now()); // already there

        let account = Account::new();
        run_sync(src.clone(), dst.clone(), opts(SyncMode::Move), account.clone()).unwrap();

        // source drained, destination holds everything
        assert!(names(&src).is_empty());
        assert_eq!(names(&dst), vec!["a.txt", "d/b.txt"]);
        assert_eq!(account.transfers(), 1);
        assert_eq!(account.deletes(), 2);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("a.txt", b"AAA", now());
        dst.put_bytes("stale.txt", b"XXX", now());

        let mut options = opts(SyncMode::Sync);
        options.dry_run = true;
        let account = Account::new();
        run_sync(src.clone(), dst.clone(), options, account.clone()).unwrap();

        assert_eq!(names(&src), vec!["a.txt"]);
        assert_eq!(names(&dst), vec!["stale.txt"]);
        assert_eq!(account.transfers(), 0);
        assert_eq!(account.deletes(), 0);
    }

    #[test]
    fn test_missing_source_is_dir_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = Arc::new(crate::backend::LocalBackend::new(tmp.path().join("missing")));
        let dst = Arc::new(MemoryBackend::new("dst"));

        let err = run_sync(src, dst, opts(SyncMode::Copy), Account::new()).unwrap_err();
        assert!(matches!(err, SyncError::DirNotFound(_)));
        assert_eq!(err.exit_code(), crate::error::exit_code::DIR_NOT_FOUND);
    }

    #[test]
    fn test_track_renames() {
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("renamed/new-name.bin", b"same bytes", now());
        dst.put_bytes("old-name.bin", b"same bytes", now());

        let mut options = opts(SyncMode::Sync);
        options.track_renames = true;
        let account = Account::new();
        run_sync(src.clone(), dst.clone(), options, account.clone()).unwrap();

        assert_eq!(names(&dst), vec!["renamed/new-name.bin"]);
        assert_eq!(account.renames(), 1);
        assert_eq!(account.transfers(), 0);
        assert_eq!(account.deletes(), 0);
    }

    #[test]
    fn test_deletes_skipped_when_transfers_fail() {
        use crate::backend::FaultOp;
        let src = Arc::new(MemoryBackend::new("src"));
        let dst = Arc::new(MemoryBackend::new("dst"));
        src.put_bytes("new.txt", b"NEW", now());
        dst.put_bytes("stale.txt", b"XXX", now());
        dst.fail_next(FaultOp::Put, SyncError::fatal("disk on fire"));

        let mut options = opts(SyncMode::Sync);
        options.low_level_retries = 1;
        let account = Account::new();
        run_sync(src.clone(), dst.clone(), options, account.clone()).unwrap();

        // the stale object survives because a transfer failed
        assert!(names(&dst).contains(&"stale.txt".to_string()));
        assert!(account.errors() > 0);
    }
}
