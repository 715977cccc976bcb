//! Retry, throttle, and cache wrapper over a [`KvStore`] backend.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use drover_core::StoreError;

use crate::KvStore;

/// Retry schedule for backend failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per operation (first try included). Default: 3.
    pub attempts: u32,
    /// Base backoff delay in seconds; doubles per attempt. Default: 0.5.
    pub base_delay: f64,
    /// Jitter fraction applied to each delay, in `[0, 1]`. Default: 0.25.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: 0.5,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based), jittered.
    fn delay_us(&self, attempt: u32, rng: &mut ChaCha8Rng) -> u64 {
        let base = self.base_delay * f64::powi(2.0, attempt.saturating_sub(1) as i32);
        let jitter = if self.jitter > 0.0 {
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        (base * jitter.max(0.0) * 1_000_000.0) as u64
    }
}

/// Adapter settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Retry policy; `None` disables retries (single attempt).
    pub retry: Option<RetryPolicy>,
    /// Minimum seconds between actual writes to the same key; writes
    /// inside the window are coalesced. Default: 6.0.
    pub write_min_interval: f64,
    /// Cache successful reads and serve repeats from memory.
    pub cache_reads: bool,
    /// Seed for backoff jitter.
    pub seed: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            retry: Some(RetryPolicy::default()),
            write_min_interval: 6.0,
            cache_reads: false,
            seed: 0,
        }
    }
}

/// Cumulative adapter counters for service snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStats {
    /// Writes accepted by the adapter.
    pub writes: u64,
    /// Writes coalesced into a pending slot.
    pub coalesced: u64,
    /// Backend retries across all operations.
    pub retries: u64,
    /// Operations that exhausted their retry budget.
    pub failures: u64,
    /// Reads served from the cache.
    pub cache_hits: u64,
}

/// Result of one [`StoreAdapter::flush_due`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Pending writes pushed to the backend.
    pub flushed: u32,
    /// Pending writes that failed and were re-parked with backoff.
    pub requeued: u32,
    /// Pending writes dropped after exhausting their retry budget.
    pub dropped: u32,
}

struct PendingWrite {
    value: String,
    not_before_us: u64,
    attempts: u32,
}

struct Inner {
    pending: IndexMap<String, PendingWrite>,
    last_write_us: IndexMap<String, u64>,
    cache: IndexMap<String, String>,
    stats: AdapterStats,
    rng: ChaCha8Rng,
}

/// Retry/throttle/cache wrapper over a [`KvStore`] backend.
///
/// Single-threaded; share it behind an `Rc`.
pub struct StoreAdapter {
    backend: Rc<dyn KvStore>,
    config: AdapterConfig,
    inner: RefCell<Inner>,
}

impl StoreAdapter {
    /// Wrap a backend with the given settings.
    pub fn new(backend: Rc<dyn KvStore>, config: AdapterConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            backend,
            config,
            inner: RefCell::new(Inner {
                pending: IndexMap::new(),
                last_write_us: IndexMap::new(),
                cache: IndexMap::new(),
                stats: AdapterStats::default(),
                rng,
            }),
        }
    }

    fn attempts(&self) -> u32 {
        self.config.retry.as_ref().map_or(1, |r| r.attempts.max(1))
    }

    /// Read through pending writes, the cache, then the backend.
    ///
    /// A value parked for write is returned as-is (read-your-writes).
    /// Backend reads retry immediately up to the policy's attempt count.
    pub fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(pending) = inner.pending.get(key) {
                let value = pending.value.clone();
                return Ok(Some(value));
            }
            if self.config.cache_reads {
                if let Some(value) = inner.cache.get(key).cloned() {
                    inner.stats.cache_hits += 1;
                    return Ok(Some(value));
                }
            }
        }

        let attempts = self.attempts();
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                self.inner.borrow_mut().stats.retries += 1;
            }
            match self.backend.read(key) {
                Ok(value) => {
                    if self.config.cache_reads {
                        let mut inner = self.inner.borrow_mut();
                        match &value {
                            Some(v) => {
                                inner.cache.insert(key.to_string(), v.clone());
                            }
                            None => {
                                inner.cache.shift_remove(key);
                            }
                        }
                    }
                    return Ok(value);
                }
                Err(e) => last = Some(e),
            }
        }
        let mut inner = self.inner.borrow_mut();
        inner.stats.failures += 1;
        let last = last.expect("at least one attempt");
        log::warn!(target: "drover", "store read '{key}' failed: {last}");
        Err(StoreError::RetriesExhausted {
            attempts,
            last: last.to_string(),
        })
    }

    /// Write `value` at `key`, coalescing within the throttle window.
    ///
    /// Inside the window the value is parked and the newest one wins;
    /// [`flush_due`](Self::flush_due) pushes it once the window passes.
    /// Outside the window the write goes straight to the backend; on
    /// failure it is parked with backoff instead of surfacing an error.
    pub fn write(&self, key: &str, value: String, now_us: u64) -> Result<(), StoreError> {
        let window_us = (self.config.write_min_interval * 1_000_000.0) as u64;
        let throttle_until = {
            let mut inner = self.inner.borrow_mut();
            inner.stats.writes += 1;
            if self.config.cache_reads {
                inner.cache.insert(key.to_string(), value.clone());
            }
            inner
                .last_write_us
                .get(key)
                .map(|last| last + window_us)
                .filter(|&until| now_us < until)
        };

        if let Some(until) = throttle_until {
            let mut inner = self.inner.borrow_mut();
            inner.stats.coalesced += 1;
            inner.pending.insert(
                key.to_string(),
                PendingWrite {
                    value,
                    not_before_us: until,
                    attempts: 0,
                },
            );
            return Ok(());
        }

        match self.backend.write(key, value.clone()) {
            Ok(()) => {
                let mut inner = self.inner.borrow_mut();
                inner.last_write_us.insert(key.to_string(), now_us);
                inner.pending.shift_remove(key);
                Ok(())
            }
            Err(e) => {
                // Park with backoff rather than losing the write.
                let mut inner = self.inner.borrow_mut();
                inner.stats.retries += 1;
                let delay = self
                    .config
                    .retry
                    .as_ref()
                    .map(|r| {
                        let rng = &mut inner.rng;
                        r.delay_us(1, rng)
                    })
                    .unwrap_or(0);
                inner.pending.insert(
                    key.to_string(),
                    PendingWrite {
                        value,
                        not_before_us: now_us + delay,
                        attempts: 1,
                    },
                );
                log::warn!(target: "drover", "store write '{key}' parked after failure: {e}");
                Ok(())
            }
        }
    }

    /// Push due pending writes to the backend.
    ///
    /// Intended to run as a recurring background scheduler task. Writes
    /// that fail again are re-parked with exponential backoff until the
    /// retry budget is spent, then dropped and counted as failures.
    pub fn flush_due(&self, now_us: u64) -> FlushReport {
        let mut report = FlushReport::default();
        let due: Vec<(String, String, u32)> = {
            let inner = self.inner.borrow();
            inner
                .pending
                .iter()
                .filter(|(_, p)| p.not_before_us <= now_us)
                .map(|(k, p)| (k.clone(), p.value.clone(), p.attempts))
                .collect()
        };

        for (key, value, attempts) in due {
            match self.backend.write(&key, value.clone()) {
                Ok(()) => {
                    let mut inner = self.inner.borrow_mut();
                    inner.pending.shift_remove(&key);
                    inner.last_write_us.insert(key, now_us);
                    report.flushed += 1;
                }
                Err(e) => {
                    let mut inner = self.inner.borrow_mut();
                    inner.stats.retries += 1;
                    let next_attempt = attempts + 1;
                    if next_attempt >= self.attempts() {
                        inner.pending.shift_remove(&key);
                        inner.stats.failures += 1;
                        report.dropped += 1;
                        log::error!(
                            target: "drover",
                            "store write '{key}' dropped after {next_attempt} attempts: {e}"
                        );
                    } else {
                        let delay = self
                            .config
                            .retry
                            .as_ref()
                            .map(|r| {
                                let rng = &mut inner.rng;
                                r.delay_us(next_attempt, rng)
                            })
                            .unwrap_or(0);
                        if let Some(pending) = inner.pending.get_mut(&key) {
                            pending.attempts = next_attempt;
                            pending.not_before_us = now_us + delay;
                        }
                        report.requeued += 1;
                    }
                }
            }
        }
        report
    }

    /// Remove `key` from the backend, the cache, and the pending set.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.pending.shift_remove(key);
            inner.cache.shift_remove(key);
        }
        let attempts = self.attempts();
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                self.inner.borrow_mut().stats.retries += 1;
            }
            match self.backend.remove(key) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        self.inner.borrow_mut().stats.failures += 1;
        Err(StoreError::RetriesExhausted {
            attempts,
            last: last.expect("at least one attempt").to_string(),
        })
    }

    /// Number of parked writes.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Cumulative counters.
    pub fn stats(&self) -> AdapterStats {
        self.inner.borrow().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Backend double failing the first `fail_first` operations.
    struct FlakyBackend {
        map: RefCell<IndexMap<String, String>>,
        fail_first: Cell<u32>,
        ops: Cell<u32>,
    }

    impl FlakyBackend {
        fn new(fail_first: u32) -> Rc<Self> {
            Rc::new(Self {
                map: RefCell::new(IndexMap::new()),
                fail_first: Cell::new(fail_first),
                ops: Cell::new(0),
            })
        }

        fn trip(&self) -> Result<(), StoreError> {
            self.ops.set(self.ops.get() + 1);
            if self.fail_first.get() > 0 {
                self.fail_first.set(self.fail_first.get() - 1);
                return Err(StoreError::Backend {
                    reason: "backend offline".into(),
                });
            }
            Ok(())
        }
    }

    impl KvStore for FlakyBackend {
        fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.trip()?;
            Ok(self.map.borrow().get(key).cloned())
        }
        fn write(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.trip()?;
            self.map.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.trip()?;
            self.map.borrow_mut().shift_remove(key);
            Ok(())
        }
    }

    fn no_throttle() -> AdapterConfig {
        AdapterConfig {
            write_min_interval: 0.0,
            ..AdapterConfig::default()
        }
    }

    #[test]
    fn read_retries_then_succeeds() {
        let backend = FlakyBackend::new(2);
        backend
            .map
            .borrow_mut()
            .insert("k".into(), "v".into());
        let adapter = StoreAdapter::new(backend.clone(), no_throttle());
        assert_eq!(adapter.read("k").unwrap(), Some("v".to_string()));
        assert_eq!(adapter.stats().retries, 2);
    }

    #[test]
    fn read_exhaustion_reports_attempts() {
        let backend = FlakyBackend::new(10);
        let adapter = StoreAdapter::new(backend, no_throttle());
        match adapter.read("k") {
            Err(StoreError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(adapter.stats().failures, 1);
    }

    #[test]
    fn immediate_write_lands_in_backend() {
        let backend = FlakyBackend::new(0);
        let adapter = StoreAdapter::new(backend.clone(), no_throttle());
        adapter.write("k", "v1".into(), 0).unwrap();
        assert_eq!(backend.map.borrow().get("k"), Some(&"v1".to_string()));
        assert_eq!(adapter.pending_count(), 0);
    }

    #[test]
    fn writes_inside_window_coalesce_newest_wins() {
        let backend = FlakyBackend::new(0);
        let config = AdapterConfig {
            write_min_interval: 6.0,
            ..AdapterConfig::default()
        };
        let adapter = StoreAdapter::new(backend.clone(), config);

        adapter.write("k", "v1".into(), 0).unwrap();
        // Two writes inside the 6 s window: parked, newest wins.
        adapter.write("k", "v2".into(), 1_000_000).unwrap();
        adapter.write("k", "v3".into(), 2_000_000).unwrap();
        assert_eq!(backend.map.borrow().get("k"), Some(&"v1".to_string()));
        assert_eq!(adapter.pending_count(), 1);
        assert_eq!(adapter.stats().coalesced, 2);

        // Read-your-writes: the parked value is visible.
        assert_eq!(adapter.read("k").unwrap(), Some("v3".to_string()));

        // Not yet due at 3 s, due at 6 s.
        assert_eq!(adapter.flush_due(3_000_000).flushed, 0);
        let report = adapter.flush_due(6_000_000);
        assert_eq!(report.flushed, 1);
        assert_eq!(backend.map.borrow().get("k"), Some(&"v3".to_string()));
        assert_eq!(adapter.pending_count(), 0);
    }

    #[test]
    fn failed_write_parks_and_flush_retries() {
        let backend = FlakyBackend::new(1);
        let adapter = StoreAdapter::new(backend.clone(), no_throttle());
        adapter.write("k", "v".into(), 0).unwrap();
        assert_eq!(adapter.pending_count(), 1, "failed write must be parked");

        // Backoff: base 0.5 s with 25% jitter; 1 s is past any first delay.
        let report = adapter.flush_due(1_000_000);
        assert_eq!(report.flushed, 1);
        assert_eq!(backend.map.borrow().get("k"), Some(&"v".to_string()));
    }

    #[test]
    fn flush_drops_after_retry_budget() {
        let backend = FlakyBackend::new(100);
        let adapter = StoreAdapter::new(backend, no_throttle());
        adapter.write("k", "v".into(), 0).unwrap();

        let mut dropped = 0;
        let mut now = 0;
        for _ in 0..10 {
            now += 10_000_000;
            dropped += adapter.flush_due(now).dropped;
        }
        assert_eq!(dropped, 1);
        assert_eq!(adapter.pending_count(), 0);
        assert_eq!(adapter.stats().failures, 1);
    }

    #[test]
    fn cache_serves_repeat_reads() {
        let backend = FlakyBackend::new(0);
        backend
            .map
            .borrow_mut()
            .insert("k".into(), "v".into());
        let config = AdapterConfig {
            cache_reads: true,
            write_min_interval: 0.0,
            ..AdapterConfig::default()
        };
        let adapter = StoreAdapter::new(backend.clone(), config);

        assert_eq!(adapter.read("k").unwrap(), Some("v".to_string()));
        let ops_after_first = backend.ops.get();
        assert_eq!(adapter.read("k").unwrap(), Some("v".to_string()));
        assert_eq!(backend.ops.get(), ops_after_first, "second read was cached");
        assert_eq!(adapter.stats().cache_hits, 1);
    }

    #[test]
    fn remove_clears_pending_and_cache() {
        let backend = FlakyBackend::new(0);
        let config = AdapterConfig {
            cache_reads: true,
            write_min_interval: 100.0,
            ..AdapterConfig::default()
        };
        let adapter = StoreAdapter::new(backend.clone(), config);
        adapter.write("k", "v1".into(), 0).unwrap();
        adapter.write("k", "v2".into(), 1).unwrap(); // parked
        adapter.remove("k").unwrap();
        assert_eq!(adapter.pending_count(), 0);
        assert_eq!(adapter.read("k").unwrap(), None);
    }

    #[test]
    fn jittered_backoff_grows_with_attempts() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: 1.0,
            jitter: 0.0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(policy.delay_us(1, &mut rng), 1_000_000);
        assert_eq!(policy.delay_us(2, &mut rng), 2_000_000);
        assert_eq!(policy.delay_us(3, &mut rng), 4_000_000);
    }
}
