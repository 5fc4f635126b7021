//! Typed publish/subscribe with synchronous fan-out.
//!
//! Listeners run on the emitting task, in subscription order. Dropping the
//! [`SubscriptionGuard`] removes the listener. The first/last listener hooks
//! let lazy models install their upstream store subscriptions only while
//! somebody is actually listening.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Hook = Box<dyn Fn() + Send + Sync>;

struct EventInner<T> {
	listeners: Mutex<Vec<(u64, Listener<T>)>>,
	next_id: AtomicU64,
	on_first_listener: Mutex<Option<Hook>>,
	on_last_listener: Mutex<Option<Hook>>,
}

/// A typed event handle. Cloning yields another handle to the same listener
/// set, so a model can emit on one clone while consumers subscribe on another.
pub struct Event<T> {
	inner: Arc<EventInner<T>>,
}

impl<T> Clone for Event<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for Event<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Event<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(EventInner {
				listeners: Mutex::new(Vec::new()),
				next_id: AtomicU64::new(0),
				on_first_listener: Mutex::new(None),
				on_last_listener: Mutex::new(None),
			}),
		}
	}

	/// Registers `listener`. It stays registered until the returned guard is
	/// dropped.
	pub fn subscribe(
		&self,
		listener: impl Fn(&T) + Send + Sync + 'static,
	) -> SubscriptionGuard
	where
		T: 'static,
	{
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let was_empty = {
			let mut listeners = self.inner.listeners.lock().expect("poisoned");
			let was_empty = listeners.is_empty();
			listeners.push((id, Arc::new(listener)));
			was_empty
		};
		if was_empty {
			if let Some(hook) = &*self.inner.on_first_listener.lock().expect("poisoned")
			{
				hook();
			}
		}

		let weak: Weak<EventInner<T>> = Arc::downgrade(&self.inner);
		SubscriptionGuard {
			unsubscribe: Some(Box::new(move || {
				let Some(inner) = weak.upgrade() else {
					return;
				};
				let now_empty = {
					let mut listeners = inner.listeners.lock().expect("poisoned");
					listeners.retain(|(lid, _)| *lid != id);
					listeners.is_empty()
				};
				if now_empty {
					if let Some(hook) =
						&*inner.on_last_listener.lock().expect("poisoned")
					{
						hook();
					}
				}
			})),
		}
	}

	/// Calls every registered listener with `value`.
	///
	/// Listeners are snapshotted first, so a listener that subscribes or
	/// unsubscribes during fan-out does not deadlock.
	pub fn emit(&self, value: &T) {
		let snapshot: Vec<Listener<T>> = {
			let listeners = self.inner.listeners.lock().expect("poisoned");
			listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
		};
		for listener in snapshot {
			listener(value);
		}
	}

	pub fn listener_count(&self) -> usize {
		self.inner.listeners.lock().expect("poisoned").len()
	}

	/// Hook invoked when the listener set becomes non-empty.
	pub fn set_on_first_listener(&self, hook: impl Fn() + Send + Sync + 'static) {
		*self.inner.on_first_listener.lock().expect("poisoned") = Some(Box::new(hook));
	}

	/// Hook invoked when the listener set becomes empty again.
	pub fn set_on_last_listener(&self, hook: impl Fn() + Send + Sync + 'static) {
		*self.inner.on_last_listener.lock().expect("poisoned") = Some(Box::new(hook));
	}
}

impl<T> std::fmt::Debug for Event<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Event")
			.field("listeners", &self.listener_count())
			.finish()
	}
}

/// Removes the associated listener on drop.
pub struct SubscriptionGuard {
	unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
	/// Keeps the listener registered for the lifetime of the event instead.
	pub fn forget(mut self) {
		self.unsubscribe = None;
	}
}

impl Drop for SubscriptionGuard {
	fn drop(&mut self) {
		if let Some(unsubscribe) = self.unsubscribe.take() {
			unsubscribe();
		}
	}
}

impl std::fmt::Debug for SubscriptionGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionGuard").finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[test]
	fn test_emit_reaches_all_listeners() {
		let event: Event<u32> = Event::new();
		let seen = Arc::new(AtomicUsize::new(0));

		let seen1 = Arc::clone(&seen);
		let _g1 = event.subscribe(move |v| {
			seen1.fetch_add(*v as usize, Ordering::SeqCst);
		});
		let seen2 = Arc::clone(&seen);
		let _g2 = event.subscribe(move |v| {
			seen2.fetch_add(*v as usize, Ordering::SeqCst);
		});

		event.emit(&21);
		assert_eq!(seen.load(Ordering::SeqCst), 42);
	}

	#[test]
	fn test_guard_drop_unsubscribes() {
		let event: Event<()> = Event::new();
		let seen = Arc::new(AtomicUsize::new(0));

		let seen1 = Arc::clone(&seen);
		let guard = event.subscribe(move |()| {
			seen1.fetch_add(1, Ordering::SeqCst);
		});
		event.emit(&());
		drop(guard);
		event.emit(&());

		assert_eq!(seen.load(Ordering::SeqCst), 1);
		assert_eq!(event.listener_count(), 0);
	}

	#[test]
	fn test_listener_lifecycle_hooks() {
		let event: Event<()> = Event::new();
		let first = Arc::new(AtomicUsize::new(0));
		let last = Arc::new(AtomicUsize::new(0));

		let first1 = Arc::clone(&first);
		event.set_on_first_listener(move || {
			first1.fetch_add(1, Ordering::SeqCst);
		});
		let last1 = Arc::clone(&last);
		event.set_on_last_listener(move || {
			last1.fetch_add(1, Ordering::SeqCst);
		});

		let g1 = event.subscribe(|()| {});
		let g2 = event.subscribe(|()| {});
		assert_eq!(first.load(Ordering::SeqCst), 1);

		drop(g1);
		assert_eq!(last.load(Ordering::SeqCst), 0);
		drop(g2);
		assert_eq!(last.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_forget_keeps_listener() {
		let event: Event<()> = Event::new();
		let seen = Arc::new(AtomicUsize::new(0));

		let seen1 = Arc::clone(&seen);
		event
			.subscribe(move |()| {
				seen1.fetch_add(1, Ordering::SeqCst);
			})
			.forget();
		event.emit(&());
		assert_eq!(seen.load(Ordering::SeqCst), 1);
	}
}
