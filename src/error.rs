use std::time::Duration;

/// Errors raised while configuring or constructing a [`crate::RefreshCache`].
///
/// Producer failures are never wrapped in this type, they are handed back to the caller as is.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The refresh period was zero.
    #[error("refresh period must be positive, got {0:?}")]
    RefreshPeriod(Duration),
    /// A validity (grace) period was given but it was zero.
    #[error("validity period must be positive, got {0:?}")]
    Validity(Duration),
    /// The background timer thread could not be started.
    #[error("failed to spawn refresh timer: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
