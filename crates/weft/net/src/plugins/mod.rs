//! The ordered transformation chain every connection runs its events
//! through.
//!
//! Index 0 is nearest the wire: inbound events fold front to back, outbound
//! events back to front. A plugin may consume an event by returning `None`
//! (a keep-alive ping, a paired response). Any plugin error terminates the
//! connection with local origin.
//!
//! Time-driven plugins implement [`Plugin::next_wakeup`]; the connection
//! pump sleeps until the earliest wakeup and routes the produced outbound
//! events through the plugins *below* the producer only, so a keep-alive
//! ping still passes encryption.

mod encryption;
mod keepalive;
mod request;

pub use self::encryption::Encryption;
pub use self::keepalive::{KeepAlive, KeepAliveHandle};
pub use self::request::{request_pair, RequestPlugin, RequestTracker};

use tokio::time::Instant;

use crate::connection::CloseOrigin;
use crate::pipe::Frame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
	Opened,
	Message(Frame),
	Closed { reason: String, origin: CloseOrigin },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
	Message(Frame),
	Close { reason: String },
}

#[derive(thiserror::Error, Debug)]
#[error("plugin {plugin}: {message}")]
pub struct PluginError {
	pub plugin: &'static str,
	pub message: String,
}

impl PluginError {
	pub fn new(plugin: &'static str, message: impl Into<String>) -> Self {
		Self {
			plugin,
			message: message.into(),
		}
	}
}

pub trait Plugin: Send {
	fn name(&self) -> &'static str;

	fn transform_inbound(
		&mut self,
		event: InboundEvent,
	) -> Result<Option<InboundEvent>, PluginError> {
		Ok(Some(event))
	}

	fn transform_outbound(
		&mut self,
		event: OutboundEvent,
	) -> Result<Option<OutboundEvent>, PluginError> {
		Ok(Some(event))
	}

	/// Earliest instant this plugin wants [`Plugin::on_wakeup`] called.
	fn next_wakeup(&self) -> Option<Instant> {
		None
	}

	/// Timer callback; returned events are sent wire-wards.
	fn on_wakeup(&mut self, _now: Instant) -> Vec<OutboundEvent> {
		Vec::new()
	}
}

/// The plugin list of one connection.
#[derive(Default)]
pub struct Chain {
	plugins: Vec<Box<dyn Plugin>>,
}

impl Chain {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends `plugin` on the application side of the chain.
	pub fn push(&mut self, plugin: Box<dyn Plugin>) {
		self.plugins.push(plugin);
	}

	/// Inserts `plugin` nearest the wire.
	pub fn push_wire_side(&mut self, plugin: Box<dyn Plugin>) {
		self.plugins.insert(0, plugin);
	}

	pub fn is_empty(&self) -> bool {
		self.plugins.is_empty()
	}

	/// Folds an inbound event wire→application.
	pub fn inbound(
		&mut self,
		event: InboundEvent,
	) -> Result<Option<InboundEvent>, PluginError> {
		let mut event = event;
		for plugin in self.plugins.iter_mut() {
			match plugin.transform_inbound(event)? {
				Some(next) => event = next,
				None => return Ok(None),
			}
		}
		Ok(Some(event))
	}

	/// Folds an outbound event application→wire.
	pub fn outbound(
		&mut self,
		event: OutboundEvent,
	) -> Result<Option<OutboundEvent>, PluginError> {
		self.outbound_below(self.plugins.len(), event)
	}

	/// Folds an outbound event through the plugins below `index` only. Used
	/// for events a plugin produced itself.
	pub fn outbound_below(
		&mut self,
		index: usize,
		event: OutboundEvent,
	) -> Result<Option<OutboundEvent>, PluginError> {
		let mut event = event;
		for plugin in self.plugins[..index].iter_mut().rev() {
			match plugin.transform_outbound(event)? {
				Some(next) => event = next,
				None => return Ok(None),
			}
		}
		Ok(Some(event))
	}

	/// The earliest pending wakeup, with the index of its plugin.
	pub fn next_wakeup(&self) -> Option<(usize, Instant)> {
		self.plugins
			.iter()
			.enumerate()
			.filter_map(|(i, p)| p.next_wakeup().map(|at| (i, at)))
			.min_by_key(|(_, at)| *at)
	}

	pub fn on_wakeup(&mut self, index: usize, now: Instant) -> Vec<OutboundEvent> {
		self.plugins[index].on_wakeup(now)
	}
}

impl std::fmt::Debug for Chain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list()
			.entries(self.plugins.iter().map(|p| p.name()))
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	/// Tags frames so the fold order is observable.
	struct TagPlugin {
		tag: &'static str,
	}

	impl Plugin for TagPlugin {
		fn name(&self) -> &'static str {
			"tag"
		}

		fn transform_inbound(
			&mut self,
			event: InboundEvent,
		) -> Result<Option<InboundEvent>, PluginError> {
			Ok(Some(match event {
				InboundEvent::Message(Frame::Text(t)) => {
					InboundEvent::Message(Frame::Text(format!("{t}<{}", self.tag)))
				}
				other => other,
			}))
		}

		fn transform_outbound(
			&mut self,
			event: OutboundEvent,
		) -> Result<Option<OutboundEvent>, PluginError> {
			Ok(Some(match event {
				OutboundEvent::Message(Frame::Text(t)) => {
					OutboundEvent::Message(Frame::Text(format!("{t}>{}", self.tag)))
				}
				other => other,
			}))
		}
	}

	struct DropAll;

	impl Plugin for DropAll {
		fn name(&self) -> &'static str {
			"drop-all"
		}

		fn transform_inbound(
			&mut self,
			_event: InboundEvent,
		) -> Result<Option<InboundEvent>, PluginError> {
			Ok(None)
		}
	}

	#[test]
	fn test_fold_order() {
		let mut chain = Chain::new();
		chain.push(Box::new(TagPlugin { tag: "wire" }));
		chain.push(Box::new(TagPlugin { tag: "app" }));

		let inbound = chain
			.inbound(InboundEvent::Message(Frame::Text("m".into())))
			.unwrap()
			.unwrap();
		assert_eq!(
			inbound,
			InboundEvent::Message(Frame::Text("m<wire<app".into()))
		);

		let outbound = chain
			.outbound(OutboundEvent::Message(Frame::Text("m".into())))
			.unwrap()
			.unwrap();
		assert_eq!(
			outbound,
			OutboundEvent::Message(Frame::Text("m>app>wire".into()))
		);
	}

	#[test]
	fn test_consume_stops_the_fold() {
		let mut chain = Chain::new();
		chain.push(Box::new(DropAll));
		chain.push(Box::new(TagPlugin { tag: "app" }));
		let result = chain
			.inbound(InboundEvent::Message(Frame::Text("m".into())))
			.unwrap();
		assert_eq!(result, None);
	}
}
