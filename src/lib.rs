//! A single value cache that keeps itself warm.
//!
//! A [`RefreshCache`] holds exactly one value. The first read produces it, after which it is
//! recomputed on a fixed schedule in the background. Reads never wait on a background refresh, and
//! a failed refresh keeps the previous value around for a bounded grace period instead of failing
//! readers straight away.
//!
//! # Quick Start
//! ```
//! use std::time::Duration;
//! use warm_slot::RefreshCache;
//!
//! let cache = RefreshCache::new(
//!     || Ok::<_, std::io::Error>(String::from("expensive")),
//!     Duration::from_secs(30),
//!     Duration::from_secs(60),
//! )?;
//!
//! assert_eq!(cache.get_or_create()?, "expensive");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
#[doc(inline)]
pub use error::{Error, Result};

/// The timed removal stores that drive background refreshes.
pub mod expiry;
#[doc(inline)]
pub use expiry::Expiry;

/// The [`RefreshCache`] itself and its builder.
pub mod refresh;
#[doc(inline)]
pub use refresh::RefreshCache;

/// The slot state machine and the types describing it.
pub mod slot;
#[doc(inline)]
pub use slot::SlotStatus;
