//! Request-scoped deadline shared by every downstream call of one inbound request.
//!
//! Expiry is driven lazily by whoever observes the deadline first (a check or a
//! waiter), plus a watchdog task when a tokio runtime is available so that
//! registered callbacks fire on time even if nobody is polling.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static DEADLINE_COUNTER: AtomicU64 = AtomicU64::new(0);

type ExpireCallback = Box<dyn FnOnce() + Send>;

/// Cheap to clone; all clones share the same expiry state.
#[derive(Clone)]
pub struct RequestDeadline {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    started_at: Instant,
    /// `None` = no deadline.
    timeout: Option<Duration>,
    /// Set once the expiry race is won; callbacks run under this claim.
    firing: AtomicBool,
    expired: AtomicBool,
    callbacks: Mutex<Vec<ExpireCallback>>,
    /// Cancelled after callbacks have run. Waiters block on this.
    token: CancellationToken,
    /// Cancelled when the request finishes without expiring.
    finished: CancellationToken,
}

impl std::fmt::Debug for RequestDeadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeadline")
            .field("id", &self.inner.id)
            .field("timeout", &self.inner.timeout)
            .field("expired", &self.inner.expired.load(Ordering::Acquire))
            .finish()
    }
}

impl RequestDeadline {
    /// Create a deadline `timeout` from now. Never fails.
    pub fn new(timeout: Duration) -> Self {
        Self::create(Some(timeout))
    }

    /// A deadline that never expires on its own.
    pub fn unbounded() -> Self {
        Self::create(None)
    }

    pub fn create(timeout: Option<Duration>) -> Self {
        let inner = Arc::new(Inner {
            id: DEADLINE_COUNTER.fetch_add(1, Ordering::Relaxed),
            started_at: Instant::now(),
            timeout,
            firing: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        if let Some(timeout) = timeout
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let weak = Arc::downgrade(&inner);
            let finished = inner.finished.clone();
            let at = inner.started_at + timeout;
            handle.spawn(watchdog(weak, finished, at));
        }

        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.inner.started_at.elapsed().as_millis() as u64
    }

    /// Time left before expiry. `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        if self.inner.expired.load(Ordering::Acquire) {
            return Some(Duration::ZERO);
        }
        self.inner
            .timeout
            .map(|t| t.saturating_sub(self.inner.started_at.elapsed()))
    }

    /// Monotonic: once true, stays true.
    pub fn is_expired(&self) -> bool {
        if self.inner.expired.load(Ordering::Acquire) {
            return true;
        }
        match self.inner.timeout {
            None => false,
            Some(t) if self.inner.started_at.elapsed() >= t => {
                self.inner.fire();
                true
            }
            Some(_) => false,
        }
    }

    /// Register a callback to run once on expiry. Runs immediately if the
    /// deadline has already expired. Panics inside callbacks are logged and
    /// swallowed.
    pub fn on_expire(&self, callback: impl FnOnce() + Send + 'static) {
        if self.inner.firing.load(Ordering::Acquire) {
            run_callback(self.inner.id, Box::new(callback));
            return;
        }
        let mut pending = match self.inner.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the lock: fire() drains under the same lock.
        if self.inner.firing.load(Ordering::Acquire) {
            drop(pending);
            run_callback(self.inner.id, Box::new(callback));
        } else {
            pending.push(Box::new(callback));
        }
    }

    /// Child token for downstream calls. Cancelled when the deadline expires;
    /// cancelling the child does not affect the deadline.
    pub fn cancel_signal(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Resolves once the deadline has expired and every callback has run.
    /// Pending forever for an unbounded deadline that is never forced.
    pub async fn expired(&self) {
        if self.inner.expired.load(Ordering::Acquire) {
            return;
        }
        match self.inner.timeout {
            Some(timeout) => {
                let at = self.inner.started_at + timeout;
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => self.inner.fire(),
                }
                // Another observer may be mid-fire; wait for it to publish.
                self.inner.token.cancelled().await;
            }
            None => self.inner.token.cancelled().await,
        }
    }

    /// Expire now regardless of the configured timeout.
    pub fn expire_now(&self) {
        self.inner.fire();
    }

    /// Request finished normally: stop the watchdog. Does not mark expired.
    pub fn finish(&self) {
        self.inner.finished.cancel();
    }
}

impl Inner {
    fn fire(&self) {
        if self
            .firing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let callbacks = {
            let mut pending = match self.callbacks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *pending)
        };
        tracing::debug!(
            request_id = self.id,
            callbacks = callbacks.len(),
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "request deadline expired"
        );
        for cb in callbacks {
            run_callback(self.id, cb);
        }
        self.expired.store(true, Ordering::Release);
        self.token.cancel();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

fn run_callback(request_id: u64, cb: ExpireCallback) {
    if catch_unwind(AssertUnwindSafe(cb)).is_err() {
        tracing::error!(request_id, "deadline expiry callback panicked");
    }
}

async fn watchdog(inner: Weak<Inner>, finished: CancellationToken, at: Instant) {
    tokio::select! {
        _ = finished.cancelled() => {}
        _ = tokio::time::sleep_until(at) => {
            if let Some(inner) = inner.upgrade() {
                inner.fire();
            }
        }
    }
}
