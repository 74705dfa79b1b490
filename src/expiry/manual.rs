use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{Expiry, OnExpire, Outcome, RemovalCause};

/// A deterministic [`Expiry`] driven by [`ManualExpiry::advance`] instead of a clock.
///
/// Callbacks run on the thread calling `advance`. Clones share the same store, so a test can keep
/// one handle while the cache owns another.
pub struct ManualExpiry<V> {
    inner: Arc<Mutex<ManualState<V>>>,
}

impl<V> Clone for ManualExpiry<V> {
    fn clone(&self) -> Self {
        ManualExpiry {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Default for ManualExpiry<V> {
    fn default() -> Self {
        Self::new()
    }
}

struct ManualState<V> {
    now: Duration,
    armed: Option<ManualArmed<V>>,
    generation: u64,
    closed: bool,
}

struct ManualArmed<V> {
    value: V,
    // `None` when `now + after` overflows, such an entry never fires
    due: Option<Duration>,
    on_expire: OnExpire<V>,
}

impl<V> ManualExpiry<V> {
    pub fn new() -> Self {
        ManualExpiry {
            inner: Arc::new(Mutex::new(ManualState {
                now: Duration::ZERO,
                armed: None,
                generation: 0,
                closed: false,
            })),
        }
    }

    /// Move the virtual clock forward, firing every expiry that falls due on the way.
    ///
    /// Returns how many expiries fired.
    pub fn advance(&self, by: Duration) -> usize {
        let mut state = self.inner.lock();
        let target = state.now.saturating_add(by);
        let mut fired = 0;

        loop {
            let due = match &state.armed {
                Some(ManualArmed { due: Some(due), .. }) if *due <= target => *due,
                _ => break,
            };
            state.now = due;

            let Some(ManualArmed {
                value, on_expire, ..
            }) = state.armed.take()
            else {
                break;
            };
            let generation = state.generation;

            let outcome =
                MutexGuard::unlocked(&mut state, || on_expire(RemovalCause::Expired, value));
            fired += 1;

            if state.closed || state.generation != generation {
                continue;
            }

            if let Outcome::Rearm { value, after } = outcome {
                let due = state.now.checked_add(after);
                state.armed = Some(ManualArmed {
                    value,
                    due,
                    on_expire,
                });
            }
        }

        state.now = target;
        fired
    }

    /// Time left until the armed entry fires, if one is armed.
    pub fn next_due(&self) -> Option<Duration> {
        let state = self.inner.lock();
        state
            .armed
            .as_ref()
            .and_then(|armed| armed.due)
            .map(|due| due.saturating_sub(state.now))
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Total virtual time advanced so far.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().now
    }

    /// Swap the armed entry for `next`, given as a value, a delay from now and a callback.
    fn swap(&self, next: Option<(V, Duration, OnExpire<V>)>, cause: RemovalCause, close: bool) {
        let displaced = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }

            // the due time is taken under the same lock that installs the entry
            let now = state.now;
            let next = next.map(|(value, after, on_expire)| ManualArmed {
                value,
                due: now.checked_add(after),
                on_expire,
            });

            state.generation += 1;
            state.closed = close;
            std::mem::replace(&mut state.armed, next)
        };

        if let Some(ManualArmed {
            value, on_expire, ..
        }) = displaced
        {
            let _ = on_expire(cause, value);
        }
    }
}

impl<V: Clone> ManualExpiry<V> {
    /// The value the store currently holds for the armed entry.
    pub fn value(&self) -> Option<V> {
        self.inner
            .lock()
            .armed
            .as_ref()
            .map(|armed| armed.value.clone())
    }
}

impl<V: Send> Expiry<V> for ManualExpiry<V> {
    fn arm(&self, value: V, after: Duration, on_expire: OnExpire<V>) {
        self.swap(
            Some((value, after, on_expire)),
            RemovalCause::Replaced,
            false,
        );
    }

    fn remove(&self) {
        self.swap(None, RemovalCause::Explicit, false);
    }

    fn close(&self) {
        self.swap(None, RemovalCause::Closed, true);
    }
}
