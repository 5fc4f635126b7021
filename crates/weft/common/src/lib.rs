//! Shared primitives used by every weft crate.
//!
//! This crate is deliberately small: typed hash references, a synchronous
//! publish/subscribe handle, a keyed mutex registry and a lifecycle state
//! helper. Everything here is free of I/O so the higher layers can be tested
//! without a runtime where possible.

pub mod event;
mod hash;
pub mod lifecycle;
pub mod locks;

pub use self::event::Event;
pub use self::hash::{HashOf, IdOf, ParseHashError, RawHash, HASH_LEN};
pub use self::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use self::locks::KeyedLocks;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// All persisted timestamps (creation times, invitation expiries) use this
/// clock.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the unix epoch")
		.as_millis() as u64
}
