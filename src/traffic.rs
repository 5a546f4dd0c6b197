use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// How long a counter may accumulate before an inline flush
pub const SYNC_INTERVAL: Duration = Duration::from_secs(3);

/// Every Nth successful flush of a counter schedules a background save
pub const PERSIST_EVERY_FLUSHES: u64 = 10;

/// Receiver of flushed traffic, implemented by the rule registry.
///
/// Lock order is registry first, counter second: `absorb` takes the registry
/// lock and only then calls [`TrafficCounter::drain`]. A counter never calls
/// into its target while holding its own lock.
pub trait FlushTarget: Send + Sync {
    /// Move the counter's pending bytes into the owning rule. Returns false
    /// when the rule no longer exists.
    fn absorb(&self, counter: &TrafficCounter) -> bool;

    /// Schedule a non-blocking save of the current state
    fn persist_in_background(&self);
}

#[derive(Debug)]
struct Pending {
    upload: u64,
    download: u64,
    last_sync: Instant,
}

/// Byte counter for one running rule instance.
///
/// Counts are "since last flush"; the cumulative totals live in the rule.
pub struct TrafficCounter {
    rule_id: String,
    pending: Mutex<Pending>,
    flushes: AtomicU64,
    sync_interval: Duration,
    target: Weak<dyn FlushTarget>,
}

impl TrafficCounter {
    pub fn new(rule_id: impl Into<String>, target: Weak<dyn FlushTarget>) -> Self {
        Self::with_interval(rule_id, target, SYNC_INTERVAL)
    }

    pub fn with_interval(
        rule_id: impl Into<String>,
        target: Weak<dyn FlushTarget>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            pending: Mutex::new(Pending {
                upload: 0,
                download: 0,
                last_sync: Instant::now(),
            }),
            flushes: AtomicU64::new(0),
            sync_interval,
            target,
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    /// Bytes written to the client
    pub fn count_upload(&self, n: u64) {
        let due = {
            let mut pending = self.lock();
            pending.upload += n;
            pending.last_sync.elapsed() > self.sync_interval
        };
        if due {
            self.flush();
        }
    }

    /// Bytes read from the client
    pub fn count_download(&self, n: u64) {
        let due = {
            let mut pending = self.lock();
            pending.download += n;
            pending.last_sync.elapsed() > self.sync_interval
        };
        if due {
            self.flush();
        }
    }

    /// Push pending bytes into the owning rule.
    ///
    /// Must not be called while holding the registry lock; code that already
    /// holds it uses [`TrafficCounter::drain`] directly.
    pub fn flush(&self) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        if !target.absorb(self) {
            return;
        }
        let n = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % PERSIST_EVERY_FLUSHES == 0 {
            target.persist_in_background();
        }
    }

    /// Take the pending (upload, download) bytes, leaving the counter at zero
    pub fn drain(&self) -> (u64, u64) {
        let mut pending = self.lock();
        let taken = (pending.upload, pending.download);
        pending.upload = 0;
        pending.download = 0;
        pending.last_sync = Instant::now();
        taken
    }

    /// Unflushed (upload, download) bytes
    pub fn pending(&self) -> (u64, u64) {
        let pending = self.lock();
        (pending.upload, pending.download)
    }

    /// Number of flushes absorbed by the target so far
    #[cfg(test)]
    pub(crate) fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TrafficCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (upload, download) = self.pending();
        f.debug_struct("TrafficCounter")
            .field("rule_id", &self.rule_id)
            .field("upload", &upload)
            .field("download", &download)
            .finish()
    }
}
