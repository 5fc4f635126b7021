//! Keep-alive plugin: sends a ping frame whenever no outbound traffic
//! happened within the configured interval. Inbound pings are consumed
//! before they reach the application.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::{InboundEvent, OutboundEvent, Plugin, PluginError};
use crate::pipe::Frame;

/// The ping frame. Text on purpose: it survives the encryption plugin like
/// any other frame and is cheap to match on the receiving side.
pub(crate) const PING: &str = "{\"command\":\"keepalive\"}";

struct Config {
	interval: Duration,
	/// Timer restart point; bumped on reconfiguration.
	epoch: Instant,
}

pub struct KeepAlive {
	config: Arc<Mutex<Config>>,
	last_send: Instant,
}

/// Reconfigures a running keep-alive plugin.
#[derive(Clone)]
pub struct KeepAliveHandle {
	config: Arc<Mutex<Config>>,
}

impl KeepAliveHandle {
	/// Changes the interval and restarts the timer.
	pub fn set_interval(&self, interval: Duration) {
		let mut config = self.config.lock().expect("poisoned");
		config.interval = interval;
		config.epoch = Instant::now();
	}
}

impl KeepAlive {
	pub fn new(interval: Duration) -> (Self, KeepAliveHandle) {
		let config = Arc::new(Mutex::new(Config {
			interval,
			epoch: Instant::now(),
		}));
		(
			Self {
				config: Arc::clone(&config),
				last_send: Instant::now(),
			},
			KeepAliveHandle { config },
		)
	}

	fn deadline(&self) -> Instant {
		let config = self.config.lock().expect("poisoned");
		self.last_send.max(config.epoch) + config.interval
	}
}

impl Plugin for KeepAlive {
	fn name(&self) -> &'static str {
		"keepalive"
	}

	fn transform_inbound(
		&mut self,
		event: InboundEvent,
	) -> Result<Option<InboundEvent>, PluginError> {
		if let InboundEvent::Message(Frame::Text(text)) = &event {
			if text == PING {
				return Ok(None);
			}
		}
		Ok(Some(event))
	}

	fn transform_outbound(
		&mut self,
		event: OutboundEvent,
	) -> Result<Option<OutboundEvent>, PluginError> {
		if matches!(event, OutboundEvent::Message(_)) {
			self.last_send = Instant::now();
		}
		Ok(Some(event))
	}

	fn next_wakeup(&self) -> Option<Instant> {
		Some(self.deadline())
	}

	fn on_wakeup(&mut self, now: Instant) -> Vec<OutboundEvent> {
		if now < self.deadline() {
			return Vec::new();
		}
		self.last_send = now;
		vec![OutboundEvent::Message(Frame::Text(PING.to_owned()))]
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn test_ping_after_idle_interval() {
		let (mut plugin, _handle) = KeepAlive::new(Duration::from_secs(5));
		assert!(plugin.on_wakeup(Instant::now()).is_empty());

		tokio::time::advance(Duration::from_secs(6)).await;
		let events = plugin.on_wakeup(Instant::now());
		assert_eq!(
			events,
			vec![OutboundEvent::Message(Frame::Text(PING.to_owned()))]
		);
		// Ping counted as traffic; no immediate second ping.
		assert!(plugin.on_wakeup(Instant::now()).is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_outbound_traffic_defers_ping() {
		let (mut plugin, _handle) = KeepAlive::new(Duration::from_secs(5));
		tokio::time::advance(Duration::from_secs(4)).await;
		plugin
			.transform_outbound(OutboundEvent::Message(Frame::Text("data".into())))
			.unwrap();
		tokio::time::advance(Duration::from_secs(2)).await;
		// Only 2s since the last send.
		assert!(plugin.on_wakeup(Instant::now()).is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_reconfiguration_restarts_timer() {
		let (mut plugin, handle) = KeepAlive::new(Duration::from_secs(5));
		tokio::time::advance(Duration::from_secs(4)).await;
		handle.set_interval(Duration::from_secs(10));
		tokio::time::advance(Duration::from_secs(6)).await;
		// 10s interval restarted 6s ago.
		assert!(plugin.on_wakeup(Instant::now()).is_empty());
		tokio::time::advance(Duration::from_secs(5)).await;
		assert_eq!(plugin.on_wakeup(Instant::now()).len(), 1);
	}

	#[test]
	fn test_inbound_ping_is_consumed() {
		let (mut plugin, _handle) = KeepAlive::new(Duration::from_secs(5));
		let consumed = plugin
			.transform_inbound(InboundEvent::Message(Frame::Text(PING.to_owned())))
			.unwrap();
		assert_eq!(consumed, None);

		let passed = plugin
			.transform_inbound(InboundEvent::Message(Frame::Text("data".into())))
			.unwrap();
		assert!(passed.is_some());
	}
}
