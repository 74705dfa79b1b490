use crate::expiry::{Expiry, OnExpire, Outcome, RemovalCause};
use crate::slot::{CacheSlot, RefreshPolicy, SlotStatus, Stats};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

mod builder;
pub use builder::RefreshCacheBuilder;

/// A `Refresh` is a type with a method [`Refresh::refresh`] that produces a fresh value
pub trait Refresh<V> {
    type Error;

    fn refresh(&self) -> Result<V, Self::Error>;
}

impl<V, F, E> Refresh<V> for F
where
    F: Fn() -> Result<V, E>,
{
    type Error = E;

    fn refresh(&self) -> Result<V, E> {
        self()
    }
}

/// The [`RefreshCache`] holds a single value and keeps it warm by refreshing it in the background.
///
/// The first call to [`RefreshCache::get_or_create`] produces the value synchronously. From then on
/// the value is refreshed every `refresh_period` on the [`Expiry`] store's timeline. If a background
/// refresh fails the previous value keeps being served for one more `validity` period; if the
/// refresh after that also fails the value is evicted and the next read produces it synchronously
/// again. A stale value is therefore never served for longer than `refresh_period + validity`.
///
/// ### Note
/// Cold reads are not deduplicated. Callers that find the slot empty at the same time each run the
/// producer, and the value installed last wins.
pub struct RefreshCache<V, P> {
    inner: Arc<Inner<V, P>>,
}

struct Inner<V, P> {
    name: String,
    slot: Mutex<CacheSlot<V>>,
    producer: P,
    expiry: Box<dyn Expiry<V>>,
}

impl<V, P> RefreshCache<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Refresh<V> + Send + Sync + 'static,
    P::Error: fmt::Display,
{
    /// Create a cache that refreshes every `refresh_period` and serves a stale value for up to
    /// `validity` after a failed refresh.
    ///
    /// # Errors
    /// If either duration is zero, or the timer thread can't be started.
    pub fn new(producer: P, refresh_period: Duration, validity: Duration) -> crate::Result<Self> {
        Self::builder(producer, refresh_period)
            .validity(validity)
            .build()
    }

    pub fn builder(producer: P, refresh_period: Duration) -> RefreshCacheBuilder<V, P> {
        RefreshCacheBuilder::new(producer, refresh_period)
    }

    pub(crate) fn from_parts(
        name: String,
        policy: RefreshPolicy,
        producer: P,
        expiry: Box<dyn Expiry<V>>,
    ) -> Self {
        RefreshCache {
            inner: Arc::new(Inner {
                name,
                slot: Mutex::new(CacheSlot::new(policy)),
                producer,
                expiry,
            }),
        }
    }

    /// Get the cached value, producing it synchronously if the slot is empty.
    ///
    /// # Errors
    /// Only when the slot is empty and the producer fails. The error is returned as is and the
    /// slot stays empty, the next call will try again.
    pub fn get_or_create(&self) -> Result<V, P::Error> {
        let cached = self.inner.slot.lock().value().cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        trace!(cache = %self.inner.name, "slot is empty, producing synchronously");
        let value = self.inner.producer.refresh()?;

        let mut slot = self.inner.slot.lock();
        if slot.is_closed() {
            return Ok(value);
        }

        let after = slot.fill(value.clone());
        let on_expire = self.inner.on_expire(slot.epoch());

        // arm while holding the slot lock so the last fill is also the last arm
        self.inner.expiry.arm(value.clone(), after, on_expire);
        debug!(cache = %self.inner.name, ?after, "filled slot");

        Ok(value)
    }

    /// Try to get the cached value without producing it.
    pub fn peek(&self) -> Option<V> {
        self.inner.slot.lock().value().cloned()
    }

    /// Evict the cached value and cancel its scheduled refresh.
    ///
    /// The next call to [`Self::get_or_create`] produces the value synchronously.
    pub fn invalidate(&self) -> Option<V> {
        let mut slot = self.inner.slot.lock();
        if slot.is_closed() {
            return None;
        }

        let previous = slot.invalidate();
        self.inner.expiry.remove();
        debug!(cache = %self.inner.name, evicted = previous.is_some(), "invalidated slot");

        previous
    }

    /// Stop all future refreshes and release the timer.
    ///
    /// A refresh already running is not interrupted, but its result is discarded. After closing,
    /// the value held at that point keeps being returned; if the slot was empty every call to
    /// [`Self::get_or_create`] runs the producer without caching the result.
    pub fn close(&self) {
        if !self.inner.slot.lock().close() {
            return;
        }

        self.inner.expiry.close();
        debug!(cache = %self.inner.name, "closed");
    }
}

impl<V, P> RefreshCache<V, P> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> SlotStatus {
        self.inner.slot.lock().status()
    }

    /// The policy armed for the current value, `None` while the slot is empty.
    pub fn policy(&self) -> Option<RefreshPolicy> {
        self.inner.slot.lock().policy()
    }

    pub fn stats(&self) -> Stats {
        self.inner.slot.lock().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slot.lock().is_closed()
    }
}

impl<V, P> Inner<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Refresh<V> + Send + Sync + 'static,
    P::Error: fmt::Display,
{
    // the callback holds a weak ref so an armed timer never keeps the cache alive
    fn on_expire(self: &Arc<Self>, epoch: u64) -> OnExpire<V> {
        let inner = Arc::downgrade(self);

        Box::new(move |cause, _| match inner.upgrade() {
            Some(inner) => inner.expired(epoch, cause),
            None => Outcome::Evict,
        })
    }

    fn expired(&self, epoch: u64, cause: RemovalCause) -> Outcome<V> {
        if cause != RemovalCause::Expired {
            trace!(cache = %self.name, ?cause, "ignoring removal that is not an expiry");
            return Outcome::Evict;
        }

        let status = {
            let slot = self.slot.lock();
            if !slot.is_current(epoch) {
                trace!(cache = %self.name, epoch, "refresh is for an entry that is gone");
                return Outcome::Evict;
            }

            slot.status()
        };

        // the producer may be slow, never hold the slot lock across it
        let produced = panic::catch_unwind(AssertUnwindSafe(|| self.producer.refresh()));

        let mut slot = self.slot.lock();
        match produced {
            Ok(Ok(value)) => {
                let outcome = slot.refresh_succeeded(epoch, value);
                if let Outcome::Rearm { after, .. } = &outcome {
                    debug!(cache = %self.name, ?status, ?after, "refreshed value");
                }

                outcome
            }
            Ok(Err(err)) => {
                error!(cache = %self.name, ?status, error = %err, "background refresh failed");
                self.degrade(&mut slot, epoch)
            }
            Err(_) => {
                error!(cache = %self.name, ?status, "producer panicked during background refresh");
                self.degrade(&mut slot, epoch)
            }
        }
    }

    fn degrade(&self, slot: &mut CacheSlot<V>, epoch: u64) -> Outcome<V> {
        if !slot.is_current(epoch) {
            return Outcome::Evict;
        }

        let outcome = slot.refresh_failed(epoch);
        match &outcome {
            Outcome::Rearm { after, .. } => {
                warn!(cache = %self.name, grace = ?after, "serving stale value during grace period");
            }
            Outcome::Evict => {
                error!(cache = %self.name, "no grace left, evicting cached value");
            }
        }

        outcome
    }
}

impl<V, P> Drop for RefreshCache<V, P> {
    fn drop(&mut self) {
        let closing = self.inner.slot.lock().close();
        if closing {
            self.inner.expiry.close();
        }
    }
}

impl<V, P> fmt::Debug for RefreshCache<V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();

        f.debug_struct("RefreshCache")
            .field("name", &self.inner.name)
            .field("status", &slot.status())
            .field("base", &slot.base())
            .field("closed", &slot.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expiry::ManualExpiry;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;

    type Producer = Box<dyn Fn() -> Result<u64, String> + Send + Sync>;
    type TestCache = RefreshCache<u64, Producer>;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// A producer returning its call number, failing the calls `fails` picks.
    fn counting<F>(fails: F) -> (Arc<AtomicU64>, Producer)
    where
        F: Fn(u64) -> bool + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        let producer: Producer = Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if fails(n) {
                Err(format!("call {n} failed"))
            } else {
                Ok(n)
            }
        });

        (calls, producer)
    }

    fn cache(producer: Producer, validity: Option<u64>) -> (TestCache, ManualExpiry<u64>) {
        let expiry = ManualExpiry::new();

        let mut builder = RefreshCacheBuilder::new(producer, secs(5)).name("test");
        if let Some(validity) = validity {
            builder = builder.validity(secs(validity));
        }

        (builder.build_with(expiry.clone()).unwrap(), expiry)
    }

    #[test_log::test]
    fn test_first_read_fills_and_arms() {
        let (calls, producer) = counting(|_| false);
        let (cache, expiry) = cache(producer, Some(10));

        assert_eq!(cache.status(), SlotStatus::Empty);
        assert_eq!(cache.peek(), None);

        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(cache.status(), SlotStatus::Fresh);
        assert_eq!(expiry.next_due(), Some(secs(5)));
        assert_eq!(expiry.value(), Some(1));

        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(cache.peek(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_refresh_serves_the_newest_value() {
        let (calls, producer) = counting(|_| false);
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();

        for expected in 2..6 {
            expiry.advance(secs(5));
            assert_eq!(cache.get_or_create(), Ok(expected));
            assert_eq!(expiry.next_due(), Some(secs(5)));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(cache.stats().refreshes, 4);
    }

    #[test_log::test]
    fn test_failed_refresh_serves_stale_value_then_evicts() {
        let (calls, producer) = counting(|n| n == 2 || n == 3);
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();

        expiry.advance(secs(5));
        assert_eq!(cache.status(), SlotStatus::StaleGrace);
        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(cache.policy(), Some(RefreshPolicy::new(secs(10), None)));
        assert_eq!(expiry.next_due(), Some(secs(10)));

        // still within grace
        expiry.advance(secs(9));
        assert_eq!(cache.get_or_create(), Ok(1));

        expiry.advance(secs(1));
        assert_eq!(cache.status(), SlotStatus::Empty);
        assert!(!expiry.is_armed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(cache.get_or_create(), Ok(4));
        assert_eq!(cache.status(), SlotStatus::Fresh);

        let stats = cache.stats();
        assert_eq!(stats.fills, 2);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test_log::test]
    fn test_success_in_grace_restores_full_grace() {
        let (_, producer) = counting(|n| n == 2 || n == 4);
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();

        expiry.advance(secs(5));
        assert_eq!(cache.status(), SlotStatus::StaleGrace);

        expiry.advance(secs(10));
        assert_eq!(cache.status(), SlotStatus::Fresh);
        assert_eq!(cache.get_or_create(), Ok(3));
        assert_eq!(expiry.next_due(), Some(secs(5)));

        expiry.advance(secs(5));
        assert_eq!(cache.status(), SlotStatus::StaleGrace);
        assert_eq!(cache.get_or_create(), Ok(3));
    }

    #[test_log::test]
    fn test_failed_refresh_without_grace_evicts() {
        let (_, producer) = counting(|n| n == 2);
        let (cache, expiry) = cache(producer, None);

        cache.get_or_create().unwrap();

        expiry.advance(secs(5));
        assert_eq!(cache.status(), SlotStatus::Empty);
        assert_eq!(cache.peek(), None);
        assert_eq!(cache.get_or_create(), Ok(3));
    }

    #[test_log::test]
    fn test_cold_fill_error_is_returned_and_slot_stays_empty() {
        let (calls, producer) = counting(|n| n == 1);
        let (cache, expiry) = cache(producer, Some(10));

        assert_eq!(cache.get_or_create(), Err("call 1 failed".to_string()));
        assert_eq!(cache.status(), SlotStatus::Empty);
        assert!(!expiry.is_armed());

        // nothing retries on the caller's behalf
        expiry.advance(secs(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_or_create(), Ok(2));
    }

    #[test_log::test]
    fn test_panicking_refresh_counts_as_failure() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let producer: Producer = Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                panic!("producer blew up");
            }
            Ok(n)
        });
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();
        expiry.advance(secs(5));

        assert_eq!(cache.status(), SlotStatus::StaleGrace);
        assert_eq!(cache.get_or_create(), Ok(1));

        expiry.advance(secs(10));
        assert_eq!(cache.get_or_create(), Ok(3));
    }

    #[test_log::test]
    fn test_close_stops_refreshes() {
        let (calls, producer) = counting(|_| false);
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();
        cache.close();
        cache.close();

        assert!(cache.is_closed());
        assert!(expiry.is_closed());
        assert_eq!(expiry.advance(secs(60)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // the value held at close keeps being served
        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(cache.invalidate(), None);
    }

    #[test_log::test]
    fn test_closed_empty_cache_produces_without_storing() {
        let (calls, producer) = counting(|_| false);
        let (cache, expiry) = cache(producer, Some(10));

        cache.close();

        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(cache.get_or_create(), Ok(2));
        assert_eq!(cache.status(), SlotStatus::Empty);
        assert!(!expiry.is_armed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test]
    fn test_drop_closes_the_expiry() {
        let (calls, producer) = counting(|_| false);
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();
        drop(cache);

        assert_eq!(expiry.advance(secs(60)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_invalidate_cancels_refresh() {
        let (calls, producer) = counting(|_| false);
        let (cache, expiry) = cache(producer, Some(10));

        cache.get_or_create().unwrap();
        expiry.advance(secs(3));

        assert_eq!(cache.invalidate(), Some(1));
        assert_eq!(cache.status(), SlotStatus::Empty);
        assert!(!expiry.is_armed());

        expiry.advance(secs(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_or_create(), Ok(2));
        assert_eq!(expiry.next_due(), Some(secs(5)));
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let (_, producer) = counting(|_| false);
        let err = RefreshCacheBuilder::new(producer, Duration::ZERO)
            .build_with(ManualExpiry::<u64>::new())
            .unwrap_err();
        assert!(matches!(err, crate::Error::RefreshPeriod(_)));

        let (_, producer) = counting(|_| false);
        let err = RefreshCacheBuilder::new(producer, secs(5))
            .validity(Duration::ZERO)
            .build_with(ManualExpiry::<u64>::new())
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validity(_)));
    }

    #[test_log::test]
    fn test_unbounded_period_keeps_the_value_armed() {
        let (calls, producer) = counting(|_| false);
        let expiry = ManualExpiry::new();
        let cache = RefreshCacheBuilder::new(producer, Duration::MAX)
            .validity(secs(1))
            .build_with(expiry.clone())
            .unwrap();

        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(cache.status(), SlotStatus::Fresh);
        assert!(expiry.is_armed());

        // the refresh is too far out to ever fall due
        assert_eq!(expiry.advance(secs(3_600)), 0);
        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.close();
        assert!(!expiry.is_armed());
    }

    #[test_log::test]
    fn test_unbounded_grace_keeps_the_stale_value() {
        let (_, producer) = counting(|n| n > 1);
        let expiry = ManualExpiry::new();
        let cache = RefreshCacheBuilder::new(producer, secs(5))
            .validity(Duration::MAX)
            .build_with(expiry.clone())
            .unwrap();

        assert_eq!(cache.get_or_create(), Ok(1));
        assert_eq!(expiry.advance(secs(5)), 1);
        assert_eq!(cache.status(), SlotStatus::StaleGrace);

        assert_eq!(expiry.advance(secs(3_600)), 0);
        assert_eq!(cache.get_or_create(), Ok(1));
        assert!(expiry.is_armed());
    }

    #[test_log::test]
    fn test_concurrent_cold_reads_each_produce() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let producer: Producer = Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(Duration::from_millis(100));
            Ok(n)
        });
        let (cache, expiry) = cache(producer, Some(10));
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_or_create().unwrap();
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().fills, 2);

        // the last fill owns the only armed refresh
        assert_eq!(expiry.value(), cache.peek());
        assert_eq!(expiry.advance(secs(5)), 1);
        assert_eq!(cache.get_or_create(), Ok(3));
    }
}
