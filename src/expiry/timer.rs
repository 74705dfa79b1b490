use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use super::{Expiry, OnExpire, Outcome, RemovalCause};

/// An [`Expiry`] backed by a dedicated timer thread.
///
/// The thread sleeps until the armed deadline and runs the callback on itself, so a slow callback
/// delays the next deadline rather than overlapping with it. The thread exits once the store is
/// closed or dropped.
pub struct TimerExpiry<V> {
    shared: Arc<Shared<V>>,
}

struct Shared<V> {
    state: Mutex<TimerState<V>>,
    wake: Condvar,
}

struct TimerState<V> {
    armed: Option<Armed<V>>,
    // bumped by every arm, remove and close so a callback in flight can tell it was superseded
    generation: u64,
    closed: bool,
}

struct Armed<V> {
    value: V,
    // `None` when the deadline is too far out to be represented, such an entry never fires
    deadline: Option<Instant>,
    on_expire: OnExpire<V>,
}

fn deadline_after(after: Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}

impl<V: Send + 'static> TimerExpiry<V> {
    /// Start the timer thread.
    pub fn spawn() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                armed: None,
                generation: 0,
                closed: false,
            }),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("warm-slot-timer".into())
            .spawn(move || worker.run())?;

        Ok(TimerExpiry { shared })
    }
}

impl<V> Shared<V> {
    fn run(&self) {
        let mut state = self.state.lock();

        loop {
            if state.closed {
                trace!("timer closed, exiting");
                return;
            }

            let Some(deadline) = state.armed.as_ref().and_then(|armed| armed.deadline) else {
                self.wake.wait(&mut state);
                continue;
            };

            if Instant::now() < deadline {
                // woken early either by the deadline passing or by a re-arm, so just loop again
                self.wake.wait_until(&mut state, deadline);
                continue;
            }

            let Some(Armed { value, on_expire, .. }) = state.armed.take() else {
                continue;
            };
            let generation = state.generation;

            let outcome =
                MutexGuard::unlocked(&mut state, || on_expire(RemovalCause::Expired, value));

            if state.closed || state.generation != generation {
                trace!("entry superseded while its expiry ran, dropping outcome");
                continue;
            }

            if let Outcome::Rearm { value, after } = outcome {
                state.armed = Some(Armed {
                    value,
                    deadline: deadline_after(after),
                    on_expire,
                });
            }
        }
    }

    /// Swap the armed entry under the lock, notifying the displaced callback after the lock is
    /// released.
    fn swap(&self, next: Option<Armed<V>>, cause: RemovalCause, close: bool) {
        let displaced = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            state.generation += 1;
            state.closed = close;
            let displaced = std::mem::replace(&mut state.armed, next);
            self.wake.notify_one();

            displaced
        };

        if let Some(Armed { value, on_expire, .. }) = displaced {
            let _ = on_expire(cause, value);
        }
    }
}

impl<V: Send> Expiry<V> for TimerExpiry<V> {
    fn arm(&self, value: V, after: Duration, on_expire: OnExpire<V>) {
        let armed = Armed {
            value,
            deadline: deadline_after(after),
            on_expire,
        };

        self.shared.swap(Some(armed), RemovalCause::Replaced, false);
    }

    fn remove(&self) {
        self.shared.swap(None, RemovalCause::Explicit, false);
    }

    fn close(&self) {
        self.shared.swap(None, RemovalCause::Closed, true);
    }
}

impl<V> Drop for TimerExpiry<V> {
    fn drop(&mut self) {
        self.shared.swap(None, RemovalCause::Closed, true);
    }
}
