//! Request/response pairing plugin.
//!
//! Outbound JSON requests carry a numeric `id`; the plugin resolves the
//! matching inbound response to the registered waiter and consumes it, so
//! responses never interleave with the ordinary receive queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::{InboundEvent, Plugin, PluginError};
use crate::pipe::Frame;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

/// Wire-side half: matches inbound responses.
pub struct RequestPlugin {
	pending: Pending,
}

/// Application-side half: assigns ids and hands out response futures.
#[derive(Clone)]
pub struct RequestTracker {
	pending: Pending,
	next_id: Arc<AtomicU64>,
}

pub fn request_pair() -> (RequestPlugin, RequestTracker) {
	let pending: Pending = Arc::default();
	(
		RequestPlugin {
			pending: Arc::clone(&pending),
		},
		RequestTracker {
			pending,
			next_id: Arc::new(AtomicU64::new(0)),
		},
	)
}

impl RequestTracker {
	/// Stamps `request` with a fresh id and returns it together with the
	/// response future. Send the returned value, then await the receiver.
	pub fn prepare(
		&self,
		mut request: serde_json::Value,
	) -> (serde_json::Value, oneshot::Receiver<serde_json::Value>) {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		request["id"] = serde_json::Value::from(id);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().expect("poisoned").insert(id, tx);
		(request, rx)
	}

	/// Rejects every pending request (connection closed).
	pub fn abort_all(&self) {
		self.pending.lock().expect("poisoned").clear();
	}
}

impl Plugin for RequestPlugin {
	fn name(&self) -> &'static str {
		"request"
	}

	fn transform_inbound(
		&mut self,
		event: InboundEvent,
	) -> Result<Option<InboundEvent>, PluginError> {
		if let InboundEvent::Message(Frame::Text(text)) = &event {
			if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
				if let Some(id) = value.get("id").and_then(|id| id.as_u64()) {
					if let Some(waiter) =
						self.pending.lock().expect("poisoned").remove(&id)
					{
						// Waiter may have been dropped; then the
						// response is simply discarded.
						let _ = waiter.send(value);
						return Ok(None);
					}
				}
			}
		}
		Ok(Some(event))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn test_response_resolves_waiter_and_is_consumed() {
		let (mut plugin, tracker) = request_pair();
		let (request, rx) = tracker.prepare(serde_json::json!({"command": "echo"}));
		let id = request["id"].as_u64().unwrap();

		let response = serde_json::json!({"command": "echo_response", "id": id, "ok": true});
		let consumed = plugin
			.transform_inbound(InboundEvent::Message(Frame::Text(response.to_string())))
			.unwrap();
		assert_eq!(consumed, None);
		assert_eq!(rx.await.unwrap()["ok"], true);
	}

	#[tokio::test]
	async fn test_unrelated_messages_pass_through() {
		let (mut plugin, tracker) = request_pair();
		let (_request, _rx) = tracker.prepare(serde_json::json!({"command": "echo"}));

		// Unknown id and no id at all both pass.
		for text in [
			r#"{"command":"other","id":999}"#.to_owned(),
			r#"{"command":"other"}"#.to_owned(),
			"not json".to_owned(),
		] {
			let passed = plugin
				.transform_inbound(InboundEvent::Message(Frame::Text(text)))
				.unwrap();
			assert!(passed.is_some());
		}
	}

	#[tokio::test]
	async fn test_abort_all_drops_waiters() {
		let (_plugin, tracker) = request_pair();
		let (_request, rx) = tracker.prepare(serde_json::json!({"command": "echo"}));
		tracker.abort_all();
		assert!(rx.await.is_err());
	}
}
