//! Transport providers.
//!
//! The runtime never opens sockets itself: it asks a [`TransportProvider`]
//! to dial an address or to listen on one. Addresses are opaque strings
//! derived from the route configuration (relay URL plus registered public
//! key, or host and port for direct sockets).
//!
//! [`MemoryHub`] is the in-process provider used by tests and demos; it
//! plays the role of the relay and of direct sockets at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::pipe::{pipe_pair, Pipe};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("nobody is listening on {0}")]
	NoListener(String),
	#[error("address {0} is already in use")]
	AddressInUse(String),
}

/// An accepted-connection stream bound to one address. Dropping it releases
/// the address.
pub struct TransportListener {
	address: String,
	incoming: mpsc::UnboundedReceiver<Pipe>,
	_guard: ListenerGuard,
}

impl TransportListener {
	pub fn address(&self) -> &str {
		&self.address
	}

	/// The next incoming pipe; `None` when the listener was torn down by
	/// the provider.
	pub async fn accept(&mut self) -> Option<Pipe> {
		self.incoming.recv().await
	}
}

impl std::fmt::Debug for TransportListener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransportListener")
			.field("address", &self.address)
			.finish()
	}
}

#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
	async fn dial(&self, address: &str) -> Result<Pipe, TransportError>;
	async fn listen(&self, address: &str) -> Result<TransportListener, TransportError>;
}

type ListenerMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Pipe>>>>;

struct ListenerGuard {
	listeners: ListenerMap,
	address: String,
}

impl Drop for ListenerGuard {
	fn drop(&mut self) {
		let mut listeners = self.listeners.lock().expect("poisoned");
		// Only remove our own (possibly superseded) registration.
		if listeners.get(&self.address).is_some_and(|tx| tx.is_closed()) {
			listeners.remove(&self.address);
		}
	}
}

/// In-process relay: listeners register under an address, dials connect a
/// fresh pipe pair to them.
#[derive(Default)]
pub struct MemoryHub {
	listeners: ListenerMap,
}

impl MemoryHub {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Whether somebody currently listens on `address`.
	pub fn has_listener(&self, address: &str) -> bool {
		self.listeners
			.lock()
			.expect("poisoned")
			.get(address)
			.is_some_and(|tx| !tx.is_closed())
	}
}

#[async_trait]
impl TransportProvider for MemoryHub {
	async fn dial(&self, address: &str) -> Result<Pipe, TransportError> {
		let listeners = self.listeners.lock().expect("poisoned");
		let tx = listeners
			.get(address)
			.filter(|tx| !tx.is_closed())
			.ok_or_else(|| TransportError::NoListener(address.to_owned()))?;
		let (near, far) = pipe_pair();
		tx.send(far)
			.map_err(|_| TransportError::NoListener(address.to_owned()))?;
		Ok(near)
	}

	async fn listen(&self, address: &str) -> Result<TransportListener, TransportError> {
		let mut listeners = self.listeners.lock().expect("poisoned");
		if listeners.get(address).is_some_and(|tx| !tx.is_closed()) {
			return Err(TransportError::AddressInUse(address.to_owned()));
		}
		let (tx, rx) = mpsc::unbounded_channel();
		listeners.insert(address.to_owned(), tx);
		Ok(TransportListener {
			address: address.to_owned(),
			incoming: rx,
			_guard: ListenerGuard {
				listeners: Arc::clone(&self.listeners),
				address: address.to_owned(),
			},
		})
	}
}

impl std::fmt::Debug for MemoryHub {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryHub")
			.field(
				"listeners",
				&self.listeners.lock().expect("poisoned").len(),
			)
			.finish()
	}
}
