//! The byte pipe the runtime builds connections on.
//!
//! A [`Pipe`] is one end of an ordered full-duplex frame stream with a close
//! reason, exactly the surface a websocket offers. Transport adapters pump
//! the real socket into a pipe; [`pipe_pair`] wires two ends directly for
//! in-memory transports.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One frame on the wire: a UTF-8 text frame or a binary frame. No further
/// framing is imposed on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Text(String),
	Binary(Bytes),
}

/// What the reading side of a pipe observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
	Frame(Frame),
	/// The peer closed (or vanished). Delivered at most once, as the final
	/// event.
	Closed { reason: String },
}

#[derive(Debug)]
enum Signal {
	Frame(Frame),
	Close { reason: String },
}

/// The pipe was closed; the frame was not delivered.
#[derive(thiserror::Error, Debug)]
#[error("pipe closed")]
pub struct PipeClosed;

/// The cloneable sending half of a pipe end. [`Pipe`] derefs its operations
/// to one of these; the connection pump keeps the receiving half.
#[derive(Debug, Clone)]
pub struct PipeSender {
	tx: mpsc::UnboundedSender<Signal>,
	/// Set once this side closed.
	local_closed: Arc<Mutex<bool>>,
}

impl PipeSender {
	pub fn send(&self, frame: Frame) -> Result<(), PipeClosed> {
		if *self.local_closed.lock().expect("poisoned") {
			return Err(PipeClosed);
		}
		self.tx.send(Signal::Frame(frame)).map_err(|_| PipeClosed)
	}

	/// Closes this end, notifying the peer with `reason`. Idempotent.
	pub fn close(&self, reason: &str) {
		let mut closed = self.local_closed.lock().expect("poisoned");
		if *closed {
			return;
		}
		*closed = true;
		// Peer may be gone already; that is fine.
		let _ = self.tx.send(Signal::Close {
			reason: reason.to_owned(),
		});
	}

	pub fn is_closed(&self) -> bool {
		*self.local_closed.lock().expect("poisoned")
	}
}

/// One end of a frame pipe.
#[derive(Debug)]
pub struct Pipe {
	sender: PipeSender,
	rx: mpsc::UnboundedReceiver<Signal>,
	/// Set once the remote close (or loss) was observed.
	remote_closed: bool,
}

/// Two directly wired pipe ends.
pub fn pipe_pair() -> (Pipe, Pipe) {
	let (tx_a, rx_b) = mpsc::unbounded_channel();
	let (tx_b, rx_a) = mpsc::unbounded_channel();
	let a = Pipe {
		sender: PipeSender {
			tx: tx_a,
			local_closed: Arc::new(Mutex::new(false)),
		},
		rx: rx_a,
		remote_closed: false,
	};
	let b = Pipe {
		sender: PipeSender {
			tx: tx_b,
			local_closed: Arc::new(Mutex::new(false)),
		},
		rx: rx_b,
		remote_closed: false,
	};
	(a, b)
}

impl Pipe {
	pub fn send(&self, frame: Frame) -> Result<(), PipeClosed> {
		self.sender.send(frame)
	}

	/// Closes this end, notifying the peer with `reason`. Idempotent.
	pub fn close(&self, reason: &str) {
		self.sender.close(reason)
	}

	pub fn sender(&self) -> PipeSender {
		self.sender.clone()
	}

	/// Next inbound event. After `Closed` was returned (or after the local
	/// side closed), returns `None`.
	pub async fn recv(&mut self) -> Option<PipeEvent> {
		if self.remote_closed || self.sender.is_closed() {
			return None;
		}
		match self.rx.recv().await {
			Some(Signal::Frame(frame)) => Some(PipeEvent::Frame(frame)),
			Some(Signal::Close { reason }) => {
				self.remote_closed = true;
				Some(PipeEvent::Closed { reason })
			}
			// Sender dropped without a close frame: the transport died.
			None => {
				self.remote_closed = true;
				Some(PipeEvent::Closed {
					reason: "connection lost".to_owned(),
				})
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn test_frames_flow_both_ways() {
		let (a, mut b) = pipe_pair();
		a.send(Frame::Text("hi".into())).unwrap();
		assert_eq!(
			b.recv().await,
			Some(PipeEvent::Frame(Frame::Text("hi".into())))
		);

		b.send(Frame::Binary(Bytes::from_static(&[1, 2]))).unwrap();
		// Use the moved halves.
		let mut a = a;
		assert_eq!(
			a.recv().await,
			Some(PipeEvent::Frame(Frame::Binary(Bytes::from_static(&[1, 2]))))
		);
	}

	#[tokio::test]
	async fn test_close_reaches_peer_once() {
		let (a, mut b) = pipe_pair();
		a.close("done");
		a.close("done again");
		assert_eq!(
			b.recv().await,
			Some(PipeEvent::Closed {
				reason: "done".into()
			})
		);
		assert_eq!(b.recv().await, None);
		assert!(a.send(Frame::Text("late".into())).is_err());
	}

	#[tokio::test]
	async fn test_dropped_peer_reads_as_connection_lost() {
		let (a, mut b) = pipe_pair();
		drop(a);
		assert_eq!(
			b.recv().await,
			Some(PipeEvent::Closed {
				reason: "connection lost".into()
			})
		);
	}
}
