use std::time::Duration;

pub mod manual;
pub mod timer;

pub use manual::ManualExpiry;
pub use timer::TimerExpiry;

/// Why an armed entry left the [`Expiry`] store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    /// The armed duration elapsed.
    Expired,
    /// A newer call to [`Expiry::arm`] superseded the entry.
    Replaced,
    /// [`Expiry::remove`] was called.
    Explicit,
    /// The store was closed.
    Closed,
}

/// What the store should do once an expiry callback returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<V> {
    /// Keep `value` and fire again after `after`.
    Rearm { value: V, after: Duration },
    /// Drop the entry without rearming.
    Evict,
}

/// Callback handed to [`Expiry::arm`].
///
/// It runs without any of the store's locks held. The returned [`Outcome`] is only acted upon for
/// [`RemovalCause::Expired`], every other cause is a notification.
pub type OnExpire<V> = Box<dyn Fn(RemovalCause, V) -> Outcome<V> + Send + Sync>;

/// A single entry store that removes its entry after a duration, asking a callback first.
///
/// Implementations must guarantee that:
/// - `on_expire` fires no earlier than `after` and at most once per arm,
/// - an [`Outcome::Rearm`] from an expiry rearms atomically, unless the entry was re-armed, removed
///   or closed while the callback was running,
/// - nothing fires after [`Expiry::close`] returns, other than the [`RemovalCause::Closed`]
///   notification issued by `close` itself.
pub trait Expiry<V>: Send + Sync {
    /// Arm `value`, replacing any entry that is already armed.
    fn arm(&self, value: V, after: Duration, on_expire: OnExpire<V>);

    /// Remove the armed entry, if any, without treating it as an expiry.
    fn remove(&self);

    /// Remove the armed entry and stop all future callbacks. Idempotent.
    fn close(&self);
}
