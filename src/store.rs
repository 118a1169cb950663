//! Pluggable shared-state backends.
//!
//! The store is the only thing the admission algorithms share across
//! processes, so its primitives carry the whole correctness story: a
//! fixed-window counter needs an atomic create-or-bump, and GCRA needs an
//! atomic compare-and-set over the stored arrival-time cursor. The traits
//! here express those two capabilities separately; a networked backend (a
//! key-value cache with scripting support, typically) implements them with
//! whatever transport it likes.
//!
//! The in-memory implementations are single-process reference stores for
//! tests and development. They are honest about atomicity (every operation
//! is a single critical section) but share nothing across processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::BoxError;

/// Counter snapshot returned by [`CounterStore::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Total hits recorded for the key in the current window, including the
    /// increment that produced this snapshot.
    pub total_hits: u64,
    /// When the current window resets, in milliseconds since the Unix epoch.
    pub reset_at: u64,
}

/// Storage capability for fixed-window counting.
///
/// All operations must be atomic with respect to concurrent callers across
/// process boundaries. `increment` both creates-if-absent and bumps in one
/// atomic step.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Bump the key's hit counter by `by` and return the new state.
    async fn increment(&self, key: &str, by: u64) -> Result<WindowState, BoxError>;

    /// Lower the key's hit counter by `by`, saturating at zero. Used by
    /// post-response compensation.
    async fn decrement(&self, key: &str, by: u64) -> Result<(), BoxError>;

    /// Forget a single key.
    async fn reset_key(&self, key: &str) -> Result<(), BoxError>;

    /// Forget every key and start a fresh window.
    async fn reset_all(&self) -> Result<(), BoxError>;

    /// Optional startup hook, e.g. to schedule a background sweep. The
    /// default does nothing.
    async fn init(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Storage capability for the GCRA arrival-time cursor.
///
/// The compare-and-set is the critical correctness property: two concurrent
/// requests for the same key must never both read the same stale cursor and
/// both persist an advance when only one should.
#[async_trait]
pub trait GcraStore: Send + Sync {
    /// Read the stored theoretical arrival time for the key, if any.
    async fn tat(&self, key: &str) -> Result<Option<u64>, BoxError>;

    /// Store `new` only if the current value still equals `prev`
    /// (`None` meaning "key absent"). Returns `Ok(false)` when the race was
    /// lost and the caller should re-read.
    async fn set_tat(&self, key: &str, prev: Option<u64>, new: u64) -> Result<bool, BoxError>;

    /// Delete the stored cursor, returning the bucket to fully drained.
    /// Idempotent; safe to call for a key that was never touched.
    async fn clear_tat(&self, key: &str) -> Result<(), BoxError>;
}

#[derive(Debug)]
struct CounterInner {
    window_ms: u64,
    clock: Arc<dyn Clock>,
    hits: Mutex<HashMap<String, u64>>,
    /// Shared across all keys; 0 means "not started yet".
    reset_at: AtomicU64,
    sweeping: AtomicBool,
}

impl CounterInner {
    fn reset_all_now(&self) {
        // Swap the map out under the lock and drop it outside, so the sweep
        // never holds the lock across the whole teardown.
        let drained = {
            let mut hits = self.hits.lock().unwrap();
            std::mem::take(&mut *hits)
        };
        drop(drained);
        let now = self.clock.now_millis();
        self.reset_at.store(now.saturating_add(self.window_ms), Ordering::Release);
    }
}

/// In-memory fixed-window counter store.
///
/// Keeps one hit counter per key and a single shared reset instant. Windows
/// reset lazily on the first increment past `reset_at`; calling
/// [`CounterStore::init`] additionally schedules a background sweep at the
/// window cadence, matching multi-process backends that expire keys on their
/// own.
#[derive(Debug, Clone)]
pub struct MemoryCounterStore {
    inner: Arc<CounterInner>,
}

impl MemoryCounterStore {
    /// Store with the given window duration, using the system clock.
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(SystemClock))
    }

    /// Store driven by an injected clock, for tests.
    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        Self {
            inner: Arc::new(CounterInner {
                window_ms,
                clock,
                hits: Mutex::new(HashMap::new()),
                reset_at: AtomicU64::new(0),
                sweeping: AtomicBool::new(false),
            }),
        }
    }

    /// Current hit count for a key, if any. Test helper.
    pub fn hits(&self, key: &str) -> Option<u64> {
        self.inner.hits.lock().unwrap().get(key).copied()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, by: u64) -> Result<WindowState, BoxError> {
        let now = self.inner.clock.now_millis();
        let mut hits = self.inner.hits.lock().unwrap();
        let mut reset_at = self.inner.reset_at.load(Ordering::Acquire);
        if reset_at == 0 || now >= reset_at {
            hits.clear();
            reset_at = now.saturating_add(self.inner.window_ms);
            self.inner.reset_at.store(reset_at, Ordering::Release);
        }
        let total = hits.entry(key.to_string()).or_insert(0);
        *total = total.saturating_add(by);
        Ok(WindowState { total_hits: *total, reset_at })
    }

    async fn decrement(&self, key: &str, by: u64) -> Result<(), BoxError> {
        let mut hits = self.inner.hits.lock().unwrap();
        if let Some(total) = hits.get_mut(key) {
            *total = total.saturating_sub(by);
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<(), BoxError> {
        self.inner.hits.lock().unwrap().remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), BoxError> {
        self.inner.reset_all_now();
        Ok(())
    }

    async fn init(&self) -> Result<(), BoxError> {
        // Idempotent: only the first call schedules the sweep.
        if self.inner.sweeping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let every = Duration::from_millis(self.inner.window_ms);
        let weak: Weak<CounterInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.reset_all_now(),
                    // Store dropped; the sweep dies with it.
                    None => break,
                }
            }
        });
        Ok(())
    }
}

/// In-memory GCRA cursor store with optimistic locking.
#[derive(Debug, Clone, Default)]
pub struct MemoryGcraStore {
    data: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryGcraStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GcraStore for MemoryGcraStore {
    async fn tat(&self, key: &str) -> Result<Option<u64>, BoxError> {
        Ok(self.data.lock().unwrap().get(key).copied())
    }

    async fn set_tat(&self, key: &str, prev: Option<u64>, new: u64) -> Result<bool, BoxError> {
        let mut data = self.data.lock().unwrap();
        if data.get(key).copied() == prev {
            data.insert(key.to_string(), new);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn clear_tat(&self, key: &str) -> Result<(), BoxError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}
