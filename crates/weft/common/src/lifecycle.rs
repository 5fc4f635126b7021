//! A small lifecycle state machine composed into each long-lived manager:
//! `Uninitialised → Initialised → Shutdown`, with idempotent shutdown.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	Uninitialised,
	Initialised,
	Shutdown,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LifecycleError {
	#[error("operation requires an initialised model, state is {0:?}")]
	NotInitialised(LifecycleState),
	#[error("model was already initialised")]
	AlreadyInitialised,
}

#[derive(Debug)]
pub struct Lifecycle {
	state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
	fn default() -> Self {
		Self::new()
	}
}

impl Lifecycle {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(LifecycleState::Uninitialised),
		}
	}

	pub fn state(&self) -> LifecycleState {
		*self.state.lock().expect("poisoned")
	}

	pub fn init(&self) -> Result<(), LifecycleError> {
		let mut state = self.state.lock().expect("poisoned");
		match *state {
			LifecycleState::Uninitialised => {
				*state = LifecycleState::Initialised;
				Ok(())
			}
			LifecycleState::Initialised => Err(LifecycleError::AlreadyInitialised),
			LifecycleState::Shutdown => {
				Err(LifecycleError::NotInitialised(LifecycleState::Shutdown))
			}
		}
	}

	/// Moves to `Shutdown`. Returns `true` on the first call, `false` on
	/// every later one so callers can skip repeated teardown.
	pub fn shutdown(&self) -> bool {
		let mut state = self.state.lock().expect("poisoned");
		if *state == LifecycleState::Shutdown {
			return false;
		}
		*state = LifecycleState::Shutdown;
		true
	}

	pub fn assert_initialised(&self) -> Result<(), LifecycleError> {
		let state = self.state();
		if state == LifecycleState::Initialised {
			Ok(())
		} else {
			Err(LifecycleError::NotInitialised(state))
		}
	}
}
