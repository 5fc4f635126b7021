//! One connection over one byte pipe.
//!
//! A [`Connection`] runs a pump task that folds every pipe event through the
//! plugin chain and feeds surviving frames into a promise-shaped receive
//! queue: `wait_for_*` calls are single-use futures served strictly FIFO.
//! Exactly one `closed` notification is ever delivered, whichever side
//! caused it; pending waits then reject with a synthetic closed error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace};

use weft_common::Event;

use crate::pipe::{Frame, Pipe, PipeEvent, PipeSender};
use crate::plugins::{Chain, InboundEvent, OutboundEvent, Plugin};

/// Transport-imposed cap on close reasons (websocket close frames carry at
/// most 123 payload bytes).
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Default bound on every `wait_for_*` call.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
	Local,
	Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
	pub reason: String,
	pub origin: CloseOrigin,
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
	#[error("connection closed: {reason} (origin {origin:?})")]
	Closed { reason: String, origin: CloseOrigin },
	#[error("timed out waiting for {what}")]
	WaitTimeout { what: String },
	#[error("protocol violation: {0}")]
	Violation(String),
	#[error("message codec: {0}")]
	Codec(#[from] serde_json::Error),
}

impl ConnectionError {
	fn closed(info: &CloseInfo) -> Self {
		Self::Closed {
			reason: info.reason.clone(),
			origin: info.origin,
		}
	}
}

/// Truncates a close reason to the transport cap on a char boundary.
pub(crate) fn truncate_reason(reason: &str) -> String {
	if reason.len() <= MAX_CLOSE_REASON_BYTES {
		return reason.to_owned();
	}
	let mut end = MAX_CLOSE_REASON_BYTES;
	while !reason.is_char_boundary(end) {
		end -= 1;
	}
	reason[..end].to_owned()
}

struct Waiter {
	id: u64,
	tx: oneshot::Sender<Result<Frame, ConnectionError>>,
}

#[derive(Default)]
struct Inbox {
	queue: VecDeque<Frame>,
	waiters: VecDeque<Waiter>,
	next_waiter_id: u64,
}

struct Shared {
	id: u64,
	sender: PipeSender,
	chain: Mutex<Chain>,
	inbox: Mutex<Inbox>,
	closed: Mutex<Option<CloseInfo>>,
	closed_notify: Notify,
	on_closed: Event<CloseInfo>,
	message_timeout: Mutex<Duration>,
	/// Wakes the pump to recompute plugin timers.
	pump_wakeup: Notify,
}

impl Shared {
	/// Hands a frame to the first pending waiter, or queues it.
	fn deliver(&self, frame: Frame) {
		let mut inbox = self.inbox.lock().expect("poisoned");
		while let Some(waiter) = inbox.waiters.pop_front() {
			match waiter.tx.send(Ok(frame)) {
				Ok(()) => return,
				// Waiter timed out and dropped its receiver; its Ok
				// payload comes back to us and goes to the next one.
				Err(Ok(frame_back)) => {
					return self.requeue_or_next(&mut inbox, frame_back);
				}
				Err(Err(_)) => unreachable!("we only send Ok here"),
			}
		}
		inbox.queue.push_back(frame);
	}

	fn requeue_or_next(&self, inbox: &mut Inbox, frame: Frame) {
		while let Some(waiter) = inbox.waiters.pop_front() {
			match waiter.tx.send(Ok(frame.clone())) {
				Ok(()) => return,
				Err(_) => continue,
			}
		}
		inbox.queue.push_back(frame);
	}

	/// Records the close exactly once: rejects waiters, notifies observers.
	fn finalize(&self, reason: String, origin: CloseOrigin) {
		let info = {
			let mut closed = self.closed.lock().expect("poisoned");
			if closed.is_some() {
				return;
			}
			let info = CloseInfo { reason, origin };
			*closed = Some(info.clone());
			info
		};
		debug!(conn = self.id, reason = %info.reason, origin = ?info.origin, "connection closed");

		let waiters: Vec<Waiter> = {
			let mut inbox = self.inbox.lock().expect("poisoned");
			inbox.waiters.drain(..).collect()
		};
		for waiter in waiters {
			let _ = waiter.tx.send(Err(ConnectionError::closed(&info)));
		}

		self.closed_notify.notify_waiters();
		self.on_closed.emit(&info);
	}

	fn terminate(&self, reason: &str) {
		let reason = truncate_reason(reason);
		self.sender.close(&reason);
		self.finalize(reason, CloseOrigin::Local);
	}
}

/// Handle to one connection. Cheap to clone; all clones share the receive
/// queue and the close state.
#[derive(Clone)]
pub struct Connection {
	shared: Arc<Shared>,
}

impl Connection {
	/// Wraps `pipe` with the given plugin chain and starts the pump.
	pub fn with_chain(pipe: Pipe, chain: Chain) -> Self {
		let shared = Arc::new(Shared {
			id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
			sender: pipe.sender(),
			chain: Mutex::new(chain),
			inbox: Mutex::default(),
			closed: Mutex::new(None),
			closed_notify: Notify::new(),
			on_closed: Event::new(),
			message_timeout: Mutex::new(DEFAULT_MESSAGE_TIMEOUT),
			pump_wakeup: Notify::new(),
		});
		tokio::spawn(pump(pipe, Arc::clone(&shared)));
		Self { shared }
	}

	pub fn new(pipe: Pipe) -> Self {
		Self::with_chain(pipe, Chain::new())
	}

	pub fn id(&self) -> u64 {
		self.shared.id
	}

	/// Installs `plugin` nearest the wire (encryption goes here).
	pub fn add_plugin_wire_side(&self, plugin: Box<dyn Plugin>) {
		self.shared
			.chain
			.lock()
			.expect("poisoned")
			.push_wire_side(plugin);
		self.shared.pump_wakeup.notify_waiters();
	}

	/// Installs `plugin` on the application side of the chain.
	pub fn add_plugin(&self, plugin: Box<dyn Plugin>) {
		self.shared.chain.lock().expect("poisoned").push(plugin);
		self.shared.pump_wakeup.notify_waiters();
	}

	pub fn set_message_timeout(&self, timeout: Duration) {
		*self.shared.message_timeout.lock().expect("poisoned") = timeout;
	}

	pub fn message_timeout(&self) -> Duration {
		*self.shared.message_timeout.lock().expect("poisoned")
	}

	/// Enqueues one outbound frame through the plugin chain.
	pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
		if let Some(info) = &*self.shared.closed.lock().expect("poisoned") {
			return Err(ConnectionError::closed(info));
		}
		let folded = self
			.shared
			.chain
			.lock()
			.expect("poisoned")
			.outbound(OutboundEvent::Message(frame));
		match folded {
			Ok(Some(OutboundEvent::Message(frame))) => {
				trace!(conn = self.shared.id, "send frame");
				if self.shared.sender.send(frame).is_err() {
					self.shared.finalize(
						"transport gone".to_owned(),
						CloseOrigin::Local,
					);
					let info = self.shared.closed.lock().expect("poisoned");
					return Err(ConnectionError::closed(
						info.as_ref().expect("just finalized"),
					));
				}
				Ok(())
			}
			Ok(Some(OutboundEvent::Close { reason })) => {
				self.close(&reason);
				Ok(())
			}
			Ok(None) => Ok(()),
			Err(e) => {
				self.shared.terminate(&e.to_string());
				Err(ConnectionError::Violation(e.to_string()))
			}
		}
	}

	/// The next inbound frame of any kind.
	pub async fn wait_for_message(&self) -> Result<Frame, ConnectionError> {
		self.wait_frame("message").await
	}

	/// The next inbound frame, which must be binary.
	pub async fn wait_for_binary_message(&self) -> Result<Bytes, ConnectionError> {
		match self.wait_frame("binary message").await? {
			Frame::Binary(bytes) => Ok(bytes),
			Frame::Text(_) => Err(ConnectionError::Violation(
				"expected a binary frame, got text".to_owned(),
			)),
		}
	}

	/// The next inbound frame, which must be a JSON text frame whose
	/// `command` field equals `command`.
	pub async fn wait_for_json_with_command(
		&self,
		command: &str,
	) -> Result<serde_json::Value, ConnectionError> {
		let frame = self.wait_frame(command).await?;
		let Frame::Text(text) = frame else {
			return Err(ConnectionError::Violation(format!(
				"expected a '{command}' message, got a binary frame"
			)));
		};
		let value: serde_json::Value = serde_json::from_str(&text)?;
		let actual = value.get("command").and_then(|c| c.as_str());
		if actual != Some(command) {
			return Err(ConnectionError::Violation(format!(
				"expected command '{command}', got {actual:?}"
			)));
		}
		Ok(value)
	}

	async fn wait_frame(&self, what: &str) -> Result<Frame, ConnectionError> {
		let (waiter_id, rx) = {
			let mut inbox = self.shared.inbox.lock().expect("poisoned");
			if let Some(frame) = inbox.queue.pop_front() {
				return Ok(frame);
			}
			if let Some(info) = &*self.shared.closed.lock().expect("poisoned") {
				return Err(ConnectionError::closed(info));
			}
			let (tx, rx) = oneshot::channel();
			let id = inbox.next_waiter_id;
			inbox.next_waiter_id += 1;
			inbox.waiters.push_back(Waiter { id, tx });
			(id, rx)
		};

		let bound = self.message_timeout();
		match timeout(bound, rx).await {
			Ok(Ok(result)) => result,
			// Pump vanished without finalizing; treat as closed.
			Ok(Err(_)) => Err(ConnectionError::Closed {
				reason: "connection dropped".to_owned(),
				origin: CloseOrigin::Local,
			}),
			Err(_elapsed) => {
				{
					let mut inbox = self.shared.inbox.lock().expect("poisoned");
					inbox.waiters.retain(|w| w.id != waiter_id);
				}
				self.close(&format!("timeout waiting for {what}"));
				Err(ConnectionError::WaitTimeout {
					what: what.to_owned(),
				})
			}
		}
	}

	/// Graceful close: the close event runs through the plugin chain, then
	/// the transport is told to close with `reason`.
	pub fn close(&self, reason: &str) {
		let reason = truncate_reason(reason);
		let folded = self
			.shared
			.chain
			.lock()
			.expect("poisoned")
			.outbound(OutboundEvent::Close {
				reason: reason.clone(),
			});
		let reason = match folded {
			Ok(Some(OutboundEvent::Close { reason })) => truncate_reason(&reason),
			_ => reason,
		};
		self.shared.sender.close(&reason);
		self.shared.finalize(reason, CloseOrigin::Local);
	}

	/// Immediate local teardown; plugins are not consulted.
	pub fn terminate(&self, reason: &str) {
		self.shared.terminate(reason);
	}

	pub fn is_closed(&self) -> bool {
		self.shared.closed.lock().expect("poisoned").is_some()
	}

	pub fn closed_info(&self) -> Option<CloseInfo> {
		self.shared.closed.lock().expect("poisoned").clone()
	}

	/// Observable close notification; fires exactly once.
	pub fn on_closed(&self) -> &Event<CloseInfo> {
		&self.shared.on_closed
	}

	/// Resolves once the connection is closed.
	pub async fn wait_closed(&self) -> CloseInfo {
		loop {
			let notified = self.shared.closed_notify.notified();
			if let Some(info) = self.closed_info() {
				return info;
			}
			notified.await;
		}
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.shared.id)
			.field("closed", &self.closed_info())
			.finish()
	}
}

async fn pump(mut pipe: Pipe, shared: Arc<Shared>) {
	{
		let folded = shared.chain.lock().expect("poisoned").inbound(InboundEvent::Opened);
		if let Err(e) = folded {
			shared.terminate(&e.to_string());
			return;
		}
	}

	loop {
		if shared.closed.lock().expect("poisoned").is_some() {
			return;
		}
		let deadline = shared
			.chain
			.lock()
			.expect("poisoned")
			.next_wakeup();

		tokio::select! {
			_ = shared.closed_notify.notified() => {
				// Closed locally; nothing further to pump.
				return;
			}
			event = pipe.recv() => match event {
				None => return, // closed locally; finalize already ran
				Some(PipeEvent::Frame(frame)) => {
					let folded = shared
						.chain
						.lock()
						.expect("poisoned")
						.inbound(InboundEvent::Message(frame));
					match folded {
						Ok(Some(InboundEvent::Message(frame))) => {
							shared.deliver(frame)
						}
						Ok(_) => {}
						Err(e) => {
							shared.terminate(&e.to_string());
							return;
						}
					}
				}
				Some(PipeEvent::Closed { reason }) => {
					let _ = shared
						.chain
						.lock()
						.expect("poisoned")
						.inbound(InboundEvent::Closed {
							reason: reason.clone(),
							origin: CloseOrigin::Remote,
						});
					shared.finalize(reason, CloseOrigin::Remote);
					return;
				}
			},
			_ = shared.pump_wakeup.notified() => {
				// Plugin set changed; recompute timers.
			}
			_ = sleep_until_wakeup(deadline.map(|(_, at)| at)), if deadline.is_some() => {
				let (index, _) = deadline.expect("guarded by if");
				let events = {
					let mut chain = shared.chain.lock().expect("poisoned");
					chain.on_wakeup(index, Instant::now())
				};
				for event in events {
					let folded = shared
						.chain
						.lock()
						.expect("poisoned")
						.outbound_below(index, event);
					match folded {
						Ok(Some(OutboundEvent::Message(frame))) => {
							let _ = shared.sender.send(frame);
						}
						Ok(Some(OutboundEvent::Close { reason })) => {
							shared.terminate(&reason);
							return;
						}
						Ok(None) => {}
						Err(e) => {
							shared.terminate(&e.to_string());
							return;
						}
					}
				}
			}
		}
	}
}

async fn sleep_until_wakeup(deadline: Option<Instant>) {
	match deadline {
		Some(at) => sleep_until(at).await,
		None => std::future::pending().await,
	}
}
