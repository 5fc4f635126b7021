//! Keyed mutex registry.
//!
//! Tasks await a fair FIFO queue per key (tokio mutexes wake waiters in
//! order); distinct keys proceed in parallel. Guards release on drop, so a
//! lock scope is just the guard's lexical scope.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

// Above this many registered keys, each lock() opportunistically drops
// entries nobody holds or waits on.
const PURGE_THRESHOLD: usize = 64;

pub struct KeyedLocks<K> {
	locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K> KeyedLocks<K> {
	pub fn new() -> Self {
		Self {
			locks: Mutex::new(HashMap::new()),
		}
	}
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
	/// Acquires the mutex for `key`, creating it on first use.
	pub async fn lock(&self, key: &K) -> KeyedGuard {
		let mutex = {
			let mut locks = self.locks.lock().expect("poisoned");
			if locks.len() > PURGE_THRESHOLD {
				locks.retain(|_, m| Arc::strong_count(m) > 1);
			}
			Arc::clone(
				locks
					.entry(key.clone())
					.or_insert_with(|| Arc::new(AsyncMutex::new(()))),
			)
		};
		KeyedGuard {
			_guard: mutex.lock_owned().await,
		}
	}

	/// Number of keys currently registered (held, contended or parked).
	pub fn len(&self) -> usize {
		self.locks.lock().expect("poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<K> std::fmt::Debug for KeyedLocks<K> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyedLocks").finish()
	}
}

/// Releases the keyed mutex on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct KeyedGuard {
	_guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for KeyedGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyedGuard").finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[tokio::test]
	async fn test_same_key_is_mutually_exclusive() {
		let locks = Arc::new(KeyedLocks::new());
		let running = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..8 {
			let locks = Arc::clone(&locks);
			let running = Arc::clone(&running);
			let max_seen = Arc::clone(&max_seen);
			handles.push(tokio::spawn(async move {
				let _guard = locks.lock(&"k").await;
				let now = running.fetch_add(1, Ordering::SeqCst) + 1;
				max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(1)).await;
				running.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}
		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_distinct_keys_run_in_parallel() {
		let locks: KeyedLocks<&str> = KeyedLocks::new();
		let _a = locks.lock(&"a").await;
		// Holding "a" must not block "b".
		let acquired_b = tokio::time::timeout(Duration::from_secs(1), locks.lock(&"b"))
			.await
			.is_ok();
		assert!(acquired_b);
	}
}
