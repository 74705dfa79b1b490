use std::time::{Duration, Instant};

use crate::expiry::Outcome;

/// The parameters governing the next scheduled refresh check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Time until the next refresh attempt fires.
    pub period: Duration,
    /// How long a stale value may still be served after a failed refresh.
    /// `None` means a failed refresh under this policy evicts.
    pub grace: Option<Duration>,
}

impl RefreshPolicy {
    pub fn new(period: Duration, grace: Option<Duration>) -> Self {
        RefreshPolicy { period, grace }
    }

    /// The policy of the grace tier entered when a refresh under `self` fails.
    ///
    /// The grace tier never carries grace of its own, so it can only be entered once per failure
    /// streak.
    pub fn degrade(&self) -> Option<RefreshPolicy> {
        self.grace.map(|grace| RefreshPolicy {
            period: grace,
            grace: None,
        })
    }
}

/// A snapshot of which state the slot is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    /// Holding a value produced by the last fill or a successful refresh.
    Fresh,
    /// Holding the last known value after a failed refresh.
    StaleGrace,
}

/// Counters describing what the slot has been through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Synchronous fills of an empty slot.
    pub fills: u64,
    /// Successful background refreshes.
    pub refreshes: u64,
    /// Failed background refreshes, panics included.
    pub failures: u64,
    /// Values dropped because a refresh failed with no grace left.
    pub evictions: u64,
    /// When the current value was installed.
    pub installed_at: Option<Instant>,
}

enum SlotState<V> {
    Empty,
    Fresh { value: V, policy: RefreshPolicy },
    StaleGrace { value: V, policy: RefreshPolicy },
}

/// The single slot of a [`crate::RefreshCache`] and its refresh state machine.
///
/// Every fill and invalidation starts a new epoch. Refresh outcomes carry the epoch they were
/// started under and are ignored once it is over, so a refresh that raced an invalidation can
/// never touch the entry that replaced it.
pub(crate) struct CacheSlot<V> {
    state: SlotState<V>,
    base: RefreshPolicy,
    epoch: u64,
    closed: bool,
    stats: Stats,
}

impl<V> CacheSlot<V> {
    pub(crate) fn new(base: RefreshPolicy) -> Self {
        CacheSlot {
            state: SlotState::Empty,
            base,
            epoch: 0,
            closed: false,
            stats: Stats::default(),
        }
    }

    pub(crate) fn value(&self) -> Option<&V> {
        match &self.state {
            SlotState::Empty => None,
            SlotState::Fresh { value, .. } | SlotState::StaleGrace { value, .. } => Some(value),
        }
    }

    pub(crate) fn status(&self) -> SlotStatus {
        match self.state {
            SlotState::Empty => SlotStatus::Empty,
            SlotState::Fresh { .. } => SlotStatus::Fresh,
            SlotState::StaleGrace { .. } => SlotStatus::StaleGrace,
        }
    }

    /// The policy armed for the held value.
    pub(crate) fn policy(&self) -> Option<RefreshPolicy> {
        match self.state {
            SlotState::Empty => None,
            SlotState::Fresh { policy, .. } | SlotState::StaleGrace { policy, .. } => Some(policy),
        }
    }

    pub(crate) fn base(&self) -> RefreshPolicy {
        self.base
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns false if the slot was already closed.
    pub(crate) fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    /// Whether a refresh started under `epoch` may still act on the slot.
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        !self.closed && self.epoch == epoch && !matches!(self.state, SlotState::Empty)
    }

    /// Install a synchronously produced value, returning how long until the first refresh.
    pub(crate) fn fill(&mut self, value: V) -> Duration {
        self.epoch += 1;
        self.state = SlotState::Fresh {
            value,
            policy: self.base,
        };
        self.stats.fills += 1;
        self.stats.installed_at = Some(Instant::now());

        self.base.period
    }

    /// Drop the held value and end the current epoch.
    pub(crate) fn invalidate(&mut self) -> Option<V> {
        self.epoch += 1;
        self.stats.installed_at = None;

        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Empty => None,
            SlotState::Fresh { value, .. } | SlotState::StaleGrace { value, .. } => Some(value),
        }
    }
}

impl<V: Clone> CacheSlot<V> {
    /// A refresh started under `epoch` produced `value`.
    ///
    /// From either tier this returns to [`SlotStatus::Fresh`] under the base policy.
    pub(crate) fn refresh_succeeded(&mut self, epoch: u64, value: V) -> Outcome<V> {
        if !self.is_current(epoch) {
            return Outcome::Evict;
        }

        self.state = SlotState::Fresh {
            value: value.clone(),
            policy: self.base,
        };
        self.stats.refreshes += 1;
        self.stats.installed_at = Some(Instant::now());

        Outcome::Rearm {
            value,
            after: self.base.period,
        }
    }

    /// A refresh started under `epoch` failed.
    ///
    /// Enters the grace tier if the armed policy still carries grace, otherwise evicts.
    pub(crate) fn refresh_failed(&mut self, epoch: u64) -> Outcome<V> {
        if !self.is_current(epoch) {
            return Outcome::Evict;
        }

        self.stats.failures += 1;

        let (value, policy) = match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Empty => return Outcome::Evict,
            SlotState::Fresh { value, policy } | SlotState::StaleGrace { value, policy } => {
                (value, policy)
            }
        };

        match policy.degrade() {
            Some(next) => {
                self.state = SlotState::StaleGrace {
                    value: value.clone(),
                    policy: next,
                };

                Outcome::Rearm {
                    value,
                    after: next.period,
                }
            }
            None => {
                self.stats.evictions += 1;
                self.stats.installed_at = None;

                Outcome::Evict
            }
        }
    }
}
