//! Lazy, level-limited directory listing
//!
//! A [`Lister`] walks a backend and produces a bounded stream of
//! entries. Consumers either pull items one by one or drain everything
//! with [`Lister::get_all`]. Dropping the stream cancels production.

use crate::backend::{Directory, DynBackend, DynObject, Entry};
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crossbeam::channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Default channel capacity between producer and consumer
const DEFAULT_BUFFER: usize = 1024;

/// Listing depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListLevel {
    /// Direct children only
    One,
    /// The whole subtree
    Recursive,
}

/// Builder for listings
pub struct Lister {
    level: ListLevel,
    filter: Arc<Filter>,
    buffer: usize,
    checkers: usize,
}

impl Default for Lister {
    fn default() -> Self {
        Self {
            level: ListLevel::Recursive,
            filter: Arc::new(Filter::default()),
            buffer: DEFAULT_BUFFER,
            checkers: 8,
        }
    }
}

impl Lister {
    /// New lister with defaults (recursive, unfiltered)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listing depth
    pub fn level(mut self, level: ListLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the include/exclude rules applied to objects
    pub fn filter(mut self, filter: Arc<Filter>) -> Self {
        self.filter = filter;
        self
    }

    /// Set the producer/consumer channel capacity
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Set the per-directory listing parallelism
    pub fn checkers(mut self, checkers: usize) -> Self {
        self.checkers = checkers.max(1);
        self
    }

    /// Begin producing entries under `dir`
    pub fn start(&self, fs: DynBackend, dir: &str) -> Listing {
        let (tx, rx) = bounded(self.buffer);
        let cancel = Arc::new(AtomicBool::new(false));
        let root_missing = Arc::new(AtomicBool::new(false));

        let producer = Producer {
            fs,
            dir: dir.to_string(),
            level: self.level,
            filter: Arc::clone(&self.filter),
            checkers: self.checkers,
            tx,
            cancel: Arc::clone(&cancel),
            root_missing: Arc::clone(&root_missing),
        };

        thread::spawn(move || producer.run());

        Listing {
            rx,
            cancel,
            root_missing,
        }
    }

    /// Drain a listing into memory
    pub fn get_all(&self, fs: DynBackend, dir: &str) -> Result<ListResult> {
        let listing = self.start(fs, dir);
        let mut entries = Vec::new();
        for item in &listing {
            entries.push(item?);
        }
        Ok(ListResult {
            entries,
            root_missing: listing.root_missing(),
        })
    }
}

/// A fully drained listing
#[derive(Debug)]
pub struct ListResult {
    /// Everything produced, order backend-defined
    pub entries: Vec<Entry>,
    /// The starting directory did not exist; entries is empty
    pub root_missing: bool,
}

impl ListResult {
    /// The objects in the listing
    pub fn objects(&self) -> Vec<DynObject> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Object(o) => Some(Arc::clone(o)),
                _ => None,
            })
            .collect()
    }

    /// The directories in the listing
    pub fn dirs(&self) -> Vec<Directory> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Dir(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Streaming listing handle. Iterating yields entries; dropping it
/// cancels the producer.
pub struct Listing {
    rx: Receiver<Result<Entry>>,
    cancel: Arc<AtomicBool>,
    root_missing: Arc<AtomicBool>,
}

impl Listing {
    /// Abort production
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether the starting directory was missing. Reliable once the
    /// stream is exhausted.
    pub fn root_missing(&self) -> bool {
        self.root_missing.load(Ordering::SeqCst)
    }
}

impl Drop for Listing {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Iterator for &Listing {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

struct Producer {
    fs: DynBackend,
    dir: String,
    level: ListLevel,
    filter: Arc<Filter>,
    checkers: usize,
    tx: Sender<Result<Entry>>,
    cancel: Arc<AtomicBool>,
    root_missing: Arc<AtomicBool>,
}

impl Producer {
    fn run(self) {
        match self.level {
            ListLevel::One => self.run_one_level(),
            ListLevel::Recursive => self.run_recursive(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Send an entry; false means the consumer went away
    fn send(&self, item: Result<Entry>) -> bool {
        self.tx.send(item).is_ok()
    }

    fn send_entries(&self, entries: Vec<Entry>) -> bool {
        for entry in entries {
            let keep = match &entry {
                Entry::Object(o) => self.filter.matches(o.remote()),
                Entry::Dir(_) => true,
            };
            if keep && !self.send(Ok(entry)) {
                return false;
            }
        }
        true
    }

    fn run_one_level(self) {
        match self.fs.list(&self.dir) {
            Ok(entries) => {
                self.send_entries(entries);
            }
            Err(SyncError::DirNotFound(_)) => {
                self.root_missing.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                self.send(Err(e));
            }
        }
    }

    fn run_recursive(self) {
        if self.fs.features().list_r {
            match self.fs.list_r(&self.dir) {
                Ok(entries) => {
                    self.send_entries(entries);
                    return;
                }
                Err(SyncError::DirNotFound(_)) => {
                    self.root_missing.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) if e.is_retryable() => {
                    // cheap path failed; walk directory by directory
                    tracing::debug!("recursive listing failed, walking instead: {e}");
                }
                Err(e) => {
                    self.send(Err(e));
                    return;
                }
            }
        }
        self.walk();
    }

    fn walk(&self) {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.checkers)
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                self.send(Err(SyncError::fatal(format!("checker pool: {e}"))));
                return;
            }
        };

        let mut frontier = vec![self.dir.clone()];
        let mut at_root = true;

        while !frontier.is_empty() {
            if self.cancelled() {
                return;
            }

            let fs = &self.fs;
            let results: Vec<(String, Result<Vec<Entry>>)> = pool.install(|| {
                frontier
                    .par_iter()
                    .map(|d| (d.clone(), fs.list(d)))
                    .collect()
            });

            let mut next = Vec::new();
            for (dir, result) in results {
                match result {
                    Ok(entries) => {
                        for entry in &entries {
                            if let Entry::Dir(d) = entry {
                                next.push(d.remote.clone());
                            }
                        }
                        if !self.send_entries(entries) {
                            return;
                        }
                    }
                    Err(SyncError::DirNotFound(_)) if at_root => {
                        self.root_missing.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(SyncError::DirNotFound(_)) => {
                        // vanished between listing rounds
                        tracing::warn!("directory disappeared during walk: {dir}");
                    }
                    Err(e) => {
                        if !self.send(Err(e)) {
                            return;
                        }
                    }
                }
            }

            frontier = next;
            at_root = false;
        }
    }
}
