use super::{Refresh, RefreshCache};
use crate::expiry::{Expiry, TimerExpiry};
use crate::slot::RefreshPolicy;
use crate::{Error, Result};

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

const DEFAULT_NAME: &str = "refresh-cache";

/// Configures and builds a [`RefreshCache`].
///
/// Leaving [`RefreshCacheBuilder::validity`] unset disables the grace tier, so the first failed
/// background refresh evicts the value.
pub struct RefreshCacheBuilder<V, P> {
    pub(crate) producer: P,
    pub(crate) refresh_period: Duration,
    pub(crate) validity: Option<Duration>,
    pub(crate) name: Option<String>,
    _value: PhantomData<fn() -> V>,
}

impl<V, P> RefreshCacheBuilder<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Refresh<V> + Send + Sync + 'static,
    P::Error: fmt::Display,
{
    pub fn new(producer: P, refresh_period: Duration) -> Self {
        RefreshCacheBuilder {
            producer,
            refresh_period,
            validity: None,
            name: None,
            _value: PhantomData,
        }
    }

    /// How long the last value may still be served after a failed background refresh.
    pub fn validity(mut self, validity: Duration) -> Self {
        self.validity = Some(validity);
        self
    }

    /// A name attached to every log event of the cache.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the cache with its own timer thread.
    pub fn build(self) -> Result<RefreshCache<V, P>> {
        // validate before spawning anything
        self.policy()?;

        let expiry = TimerExpiry::spawn()?;
        self.build_with(expiry)
    }

    /// Build the cache on top of a caller supplied [`Expiry`] store.
    pub fn build_with<X>(self, expiry: X) -> Result<RefreshCache<V, P>>
    where
        X: Expiry<V> + 'static,
    {
        let policy = self.policy()?;
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_string());

        Ok(RefreshCache::from_parts(
            name,
            policy,
            self.producer,
            Box::new(expiry),
        ))
    }

    fn policy(&self) -> Result<RefreshPolicy> {
        if self.refresh_period.is_zero() {
            return Err(Error::RefreshPeriod(self.refresh_period));
        }

        match self.validity {
            Some(validity) if validity.is_zero() => Err(Error::Validity(validity)),
            validity => Ok(RefreshPolicy::new(self.refresh_period, validity)),
        }
    }
}
