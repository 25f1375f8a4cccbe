//! Transfer accounting and progress reporting
//!
//! A process-wide [`Account`] accumulates counters under atomic updates,
//! but it is lifted into a handle the engines thread through their
//! calls, so tests construct fresh instances. A ticker emits progress at
//! a fixed cadence.

use crate::error::{exit_code, SyncError};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default progress emission cadence
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Smoothing factor for the speed estimate, per tick
const EWMA_ALPHA: f64 = 0.2;

/// Shared handle to an account
pub type AccountHandle = Arc<Account>;

/// Process-wide transfer statistics
pub struct Account {
    bytes: AtomicU64,
    checks: AtomicU64,
    transfers: AtomicU64,
    deletes: AtomicU64,
    renames: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    /// Total bytes expected, negative when unknown
    total_bytes: AtomicI64,
    highest_exit: AtomicI32,
    started_at: Instant,
    speed: Mutex<Ewma>,
}

impl Account {
    /// Create a fresh account
    pub fn new() -> AccountHandle {
        Arc::new(Self {
            bytes: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            renames: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            total_bytes: AtomicI64::new(-1),
            highest_exit: AtomicI32::new(exit_code::SUCCESS),
            started_at: Instant::now(),
            speed: Mutex::new(Ewma::default()),
        })
    }

    /// Record bytes moved
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a comparison that needed no transfer
    pub fn inc_checks(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed transfer
    pub fn inc_transfers(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delete
    pub fn inc_deletes(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a server-side rename
    pub fn inc_renames(&self) {
        self.renames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retry attempt
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error and fold its severity into the exit code
    pub fn record_error(&self, err: &SyncError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.highest_exit
            .fetch_max(err.exit_code(), Ordering::Relaxed);
    }

    /// Set the expected total when the walk has sized the work
    pub fn set_total_bytes(&self, total: u64) {
        self.total_bytes.store(total as i64, Ordering::Relaxed);
    }

    /// Bytes moved so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Checks so far
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Transfers so far
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Deletes so far
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Renames so far
    pub fn renames(&self) -> u64 {
        self.renames.load(Ordering::Relaxed)
    }

    /// Errors so far
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Retries so far
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Time since the account was created
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Update and read the smoothed transfer speed in bytes/second.
    /// Called by the ticker once per interval.
    fn tick_speed(&self) -> f64 {
        let mut ewma = self.speed.lock().unwrap();
        ewma.observe(self.bytes())
    }

    /// Current smoothed speed without advancing the estimate
    pub fn speed(&self) -> f64 {
        self.speed.lock().unwrap().rate
    }

    /// Estimated seconds to completion. `None` when the total or the
    /// speed is unknown.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total < 0 {
            return None;
        }
        let rate = self.speed();
        if rate <= 0.0 {
            return None;
        }
        let remaining = (total as u64).saturating_sub(self.bytes());
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Final exit code for the run: the highest severity seen, demoted
    /// to "partial" when errors occurred but something also succeeded.
    pub fn exit_code(&self) -> i32 {
        let highest = self.highest_exit.load(Ordering::Relaxed);
        if highest == exit_code::SUCCESS {
            return exit_code::SUCCESS;
        }
        let progressed = self.transfers() > 0 || self.checks() > 0 || self.deletes() > 0;
        if progressed && highest == exit_code::FAILURE {
            exit_code::PARTIAL
        } else {
            highest
        }
    }

    /// Point-in-time snapshot for reporting
    pub fn snapshot(&self) -> Snapshot {
        let total = self.total_bytes.load(Ordering::Relaxed);
        Snapshot {
            bytes: self.bytes(),
            total_bytes: (total >= 0).then_some(total as u64),
            checks: self.checks(),
            transfers: self.transfers(),
            deletes: self.deletes(),
            errors: self.errors(),
            retries: self.retries(),
            speed: self.speed(),
            eta: self.eta(),
            elapsed: self.elapsed(),
        }
    }

    /// Log the closing summary
    pub fn log_summary(&self) {
        let snap = self.snapshot();
        tracing::info!(
            "transferred {} in {:.1?} ({}/s), checks: {}, transfers: {}, deletes: {}, errors: {}",
            humansize::format_size(snap.bytes, humansize::BINARY),
            snap.elapsed,
            humansize::format_size(snap.speed as u64, humansize::BINARY),
            snap.checks,
            snap.transfers,
            snap.deletes,
            snap.errors,
        );
    }
}

/// One progress observation
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Bytes moved
    pub bytes: u64,
    /// Expected total, if known
    pub total_bytes: Option<u64>,
    /// Comparisons performed
    pub checks: u64,
    /// Transfers completed
    pub transfers: u64,
    /// Deletes performed
    pub deletes: u64,
    /// Errors recorded
    pub errors: u64,
    /// Retries performed
    pub retries: u64,
    /// Smoothed speed in bytes/second
    pub speed: f64,
    /// Estimated time to completion, if computable
    pub eta: Option<Duration>,
    /// Time since the run started
    pub elapsed: Duration,
}

#[derive(Default)]
struct Ewma {
    rate: f64,
    last_bytes: u64,
    last_at: Option<Instant>,
}

impl Ewma {
    fn observe(&mut self, bytes: u64) -> f64 {
        let now = Instant::now();
        if let Some(last) = self.last_at {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant_rate = bytes.saturating_sub(self.last_bytes) as f64 / dt;
                self.rate = EWMA_ALPHA * instant_rate + (1.0 - EWMA_ALPHA) * self.rate;
            }
        }
        self.last_bytes = bytes;
        self.last_at = Some(now);
        self.rate
    }
}

/// Reader tee reporting every byte to the account
pub struct AccountedReader<R> {
    inner: R,
    account: AccountHandle,
}

impl<R: Read> AccountedReader<R> {
    /// Wrap a reader
    pub fn new(inner: R, account: AccountHandle) -> Self {
        Self { inner, account }
    }
}

impl<R: Read> Read for AccountedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.account.add_bytes(n as u64);
        Ok(n)
    }
}

/// Periodic progress emitter. Stops and joins on drop.
pub struct ProgressGuard {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressGuard {
    /// Start emitting progress for `account` every `interval`. With
    /// `show_bar` a terminal progress bar is drawn; otherwise each tick
    /// is a log line.
    pub fn start(account: AccountHandle, interval: Duration, show_bar: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let bar = if show_bar {
                let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.cyan} {msg}")
                        .expect("static template"),
                );
                Some(bar)
            } else {
                None
            };

            while !stop_flag.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let speed = account.tick_speed();
                let snap = account.snapshot();
                let line = format_progress(&snap, speed);
                match &bar {
                    Some(bar) => bar.set_message(line),
                    None => tracing::info!("{line}"),
                }
            }

            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn format_progress(snap: &Snapshot, speed: f64) -> String {
    let total = match snap.total_bytes {
        Some(t) => humansize::format_size(t, humansize::BINARY),
        None => "-".to_string(),
    };
    let eta = match snap.eta {
        Some(eta) => format!("{}s", eta.as_secs()),
        None => "-".to_string(),
    };
    format!(
        "{}/{} @ {}/s, eta {}, checks {}, transfers {}, errors {}",
        humansize::format_size(snap.bytes, humansize::BINARY),
        total,
        humansize::format_size(speed as u64, humansize::BINARY),
        eta,
        snap.checks,
        snap.transfers,
        snap.errors,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let account = Account::new();
        account.add_bytes(100);
        account.add_bytes(28);
        account.inc_checks();
        account.inc_transfers();
        account.inc_deletes();
        account.inc_retries();

        let snap = account.snapshot();
        assert_eq!(snap.bytes, 128);
        assert_eq!(snap.checks, 1);
        assert_eq!(snap.transfers, 1);
        assert_eq!(snap.deletes, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn test_eta_needs_total_and_speed() {
        let account = Account::new();
        assert!(account.eta().is_none());
        account.set_total_bytes(1_000_000);
        // no speed observed yet
        assert!(account.eta().is_none());
    }

    #[test]
    fn test_exit_code_ladder() {
        let account = Account::new();
        assert_eq!(account.exit_code(), exit_code::SUCCESS);

        account.inc_transfers();
        account.record_error(&SyncError::fatal("boom"));
        // forward progress plus a generic failure reads as partial
        assert_eq!(account.exit_code(), exit_code::PARTIAL);

        account.record_error(&SyncError::transient("flaky"));
        assert_eq!(account.exit_code(), exit_code::TEMPORARY);
    }

    #[test]
    fn test_accounted_reader() {
        let account = Account::new();
        let data = vec![7u8; 4096];
        let mut reader = AccountedReader::new(std::io::Cursor::new(data), account.clone());
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(account.bytes(), 4096);
    }
}
