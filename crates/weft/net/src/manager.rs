//! The connection route manager.
//!
//! Keeps a durable logical link alive per `(local key, remote key, group)`
//! by trying every configured route until one yields an authenticated
//! encrypted connection. Each enabled route runs a supervisor task:
//! outgoing routes dial and reconnect with a constant delay plus jitter,
//! incoming routes hold a registration and accept. Whichever route
//! handshakes first wins the link; later arrivals are closed with a
//! `duplicate connection` reason. Exactly one upstream event is emitted per
//! adopted connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use weft_common::{now_ms, Event, KeyedLocks, Lifecycle};
use weft_crypto::{CryptoApi, PublicEncryptionKey};

use crate::connection::Connection;
use crate::handshake::{self, HandshakeError};
use crate::hub::{TransportError, TransportProvider};
use crate::pipe::Pipe;
use crate::plugins::KeepAlive;
use crate::route::{Route, RouteId, RouteKind, RouteState};

#[derive(Debug, Clone)]
pub struct RouteManagerConfig {
	pub reconnect_delay: Duration,
	pub keepalive_interval: Duration,
	pub message_timeout: Duration,
}

impl Default for RouteManagerConfig {
	fn default() -> Self {
		Self {
			reconnect_delay: Duration::from_millis(5000),
			keepalive_interval: Duration::from_secs(20),
			message_timeout: Duration::from_secs(30),
		}
	}
}

/// An authenticated encrypted connection handed upstream.
#[derive(Debug, Clone)]
pub struct EstablishedConnection {
	pub connection: Connection,
	pub local_key: PublicEncryptionKey,
	pub remote_key: PublicEncryptionKey,
	pub group: String,
	pub initiated_locally: bool,
}

type LinkKey = (PublicEncryptionKey, PublicEncryptionKey, String);

#[derive(thiserror::Error, Debug)]
enum AttemptError {
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Handshake(#[from] HandshakeError),
	#[error("no keys registered for the route's local key")]
	MissingCrypto,
}

struct ActiveLink {
	route_id: RouteId,
	connection: Connection,
}

struct RouteSlot {
	route: Route,
	stop: Option<watch::Sender<bool>>,
	task: Option<JoinHandle<()>>,
}

struct Inner {
	config: RouteManagerConfig,
	provider: Arc<dyn TransportProvider>,
	crypto: Mutex<HashMap<PublicEncryptionKey, CryptoApi>>,
	routes: Mutex<Vec<RouteSlot>>,
	active: Mutex<HashMap<LinkKey, ActiveLink>>,
	/// Pinged whenever a link becomes free.
	active_changed: Notify,
	dup_locks: KeyedLocks<LinkKey>,
	on_connection: Event<EstablishedConnection>,
	on_connection_via_catch_all: Event<EstablishedConnection>,
	online: watch::Sender<bool>,
	/// Live commserver registrations by route.
	registered: Mutex<HashMap<RouteId, bool>>,
	lifecycle: Lifecycle,
}

pub struct ConnectionRouteManager {
	inner: Arc<Inner>,
}

impl ConnectionRouteManager {
	pub fn new(provider: Arc<dyn TransportProvider>, config: RouteManagerConfig) -> Self {
		let (online, _) = watch::channel(true);
		let inner = Arc::new(Inner {
			config,
			provider,
			crypto: Mutex::new(HashMap::new()),
			routes: Mutex::new(Vec::new()),
			active: Mutex::new(HashMap::new()),
			active_changed: Notify::new(),
			dup_locks: KeyedLocks::new(),
			on_connection: Event::new(),
			on_connection_via_catch_all: Event::new(),
			online,
			registered: Mutex::new(HashMap::new()),
			lifecycle: Lifecycle::new(),
		});
		inner.lifecycle.init().expect("fresh lifecycle");
		Self { inner }
	}

	/// Dial the peer registered at `url`.
	pub fn add_outgoing(
		&self,
		crypto: CryptoApi,
		remote_key: PublicEncryptionKey,
		url: Url,
		group: &str,
	) -> RouteId {
		self.add_route(crypto, RouteKind::Outgoing { url }, Some(remote_key), group)
	}

	/// Register with the relay at `url` and accept connections from
	/// `remote_key` only.
	pub fn add_incoming_commserver(
		&self,
		crypto: CryptoApi,
		remote_key: PublicEncryptionKey,
		url: Url,
		group: &str,
	) -> RouteId {
		self.add_route(
			crypto,
			RouteKind::IncomingCommserver { url },
			Some(remote_key),
			group,
		)
	}

	/// Register with the relay at `url` and accept connections from any
	/// remote key.
	pub fn add_incoming_commserver_catch_all(
		&self,
		crypto: CryptoApi,
		url: Url,
		group: &str,
	) -> RouteId {
		self.add_route(crypto, RouteKind::IncomingCommserver { url }, None, group)
	}

	/// Bind a local socket and accept connections from `remote_key` only.
	pub fn add_incoming_direct(
		&self,
		crypto: CryptoApi,
		remote_key: PublicEncryptionKey,
		host: &str,
		port: u16,
		group: &str,
	) -> RouteId {
		self.add_route(
			crypto,
			RouteKind::IncomingDirect {
				host: host.to_owned(),
				port,
			},
			Some(remote_key),
			group,
		)
	}

	pub fn add_incoming_direct_catch_all(
		&self,
		crypto: CryptoApi,
		host: &str,
		port: u16,
		group: &str,
	) -> RouteId {
		self.add_route(
			crypto,
			RouteKind::IncomingDirect {
				host: host.to_owned(),
				port,
			},
			None,
			group,
		)
	}

	fn add_route(
		&self,
		crypto: CryptoApi,
		kind: RouteKind,
		remote_key: Option<PublicEncryptionKey>,
		group: &str,
	) -> RouteId {
		let local_key = crypto.public_encryption_key();
		self.inner
			.crypto
			.lock()
			.expect("poisoned")
			.insert(local_key, crypto);

		let route = Route::new(kind, local_key, remote_key, group);
		let mut routes = self.inner.routes.lock().expect("poisoned");
		if let Some(existing) = routes.iter().find(|s| s.route.same_recipe(&route)) {
			return existing.route.id;
		}
		let id = route.id;
		debug!(route = %id, group, "route added");
		routes.push(RouteSlot {
			route,
			stop: None,
			task: None,
		});
		id
	}

	/// Enables every configured route.
	pub fn enable_all(&self) {
		let ids: Vec<RouteId> = self
			.inner
			.routes
			.lock()
			.expect("poisoned")
			.iter()
			.map(|s| s.route.id)
			.collect();
		for id in ids {
			self.enable_route(id);
		}
	}

	/// Enables the routes serving `(local_key, remote_key)`; `None` remote
	/// selects catch-all routes too.
	pub fn enable_routes_for(
		&self,
		local_key: &PublicEncryptionKey,
		remote_key: Option<&PublicEncryptionKey>,
	) {
		let ids: Vec<RouteId> = self
			.inner
			.routes
			.lock()
			.expect("poisoned")
			.iter()
			.filter(|s| {
				s.route.local_key == *local_key
					&& match remote_key {
						Some(remote) => {
							s.route.remote_key.is_none()
								|| s.route.remote_key == Some(*remote)
						}
						None => true,
					}
			})
			.map(|s| s.route.id)
			.collect();
		for id in ids {
			self.enable_route(id);
		}
	}

	pub fn enable_route(&self, id: RouteId) {
		if self.inner.lifecycle.assert_initialised().is_err() {
			return;
		}
		let stop_rx = {
			let mut routes = self.inner.routes.lock().expect("poisoned");
			let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) else {
				return;
			};
			// "Running" means a supervisor with a live stop channel; a
			// supervisor still draining after disable_route is respawned.
			let running = slot.task.as_ref().is_some_and(|t| !t.is_finished())
				&& slot.stop.is_some();
			slot.route.disabled = false;
			if running {
				return;
			}
			slot.route.state = RouteState::Idle;
			let (stop_tx, stop_rx) = watch::channel(false);
			slot.stop = Some(stop_tx);
			stop_rx
		};
		self.inner.update_online();

		let inner = Arc::clone(&self.inner);
		let task = tokio::spawn(async move {
			let incoming = {
				let routes = inner.routes.lock().expect("poisoned");
				let Some(slot) = routes.iter().find(|s| s.route.id == id) else {
					return;
				};
				slot.route.kind.is_incoming()
			};
			if incoming {
				run_incoming(inner, id, stop_rx).await;
			} else {
				run_outgoing(inner, id, stop_rx).await;
			}
		});
		let mut routes = self.inner.routes.lock().expect("poisoned");
		if let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) {
			slot.task = Some(task);
		}
	}

	pub fn disable_route(&self, id: RouteId) {
		let close_connection = {
			let mut routes = self.inner.routes.lock().expect("poisoned");
			let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) else {
				return;
			};
			slot.route.disabled = true;
			if let Some(stop) = slot.stop.take() {
				let _ = stop.send(true);
			}
			slot.route.state = RouteState::Disabled;
			true
		};
		if close_connection {
			let connections: Vec<Connection> = {
				let active = self.inner.active.lock().expect("poisoned");
				active
					.values()
					.filter(|link| link.route_id == id)
					.map(|link| link.connection.clone())
					.collect()
			};
			for connection in connections {
				connection.close("route disabled");
			}
		}
		self.inner.set_registered(id, false);
		self.inner.update_online();
	}

	pub fn disable_all(&self) {
		let ids: Vec<RouteId> = self
			.inner
			.routes
			.lock()
			.expect("poisoned")
			.iter()
			.map(|s| s.route.id)
			.collect();
		for id in ids {
			self.disable_route(id);
		}
	}

	pub fn route_state(&self, id: RouteId) -> Option<RouteState> {
		self.inner
			.routes
			.lock()
			.expect("poisoned")
			.iter()
			.find(|s| s.route.id == id)
			.map(|s| s.route.state)
	}

	pub fn route_count(&self) -> usize {
		self.inner.routes.lock().expect("poisoned").len()
	}

	/// `(failure count, last attempt in ms since the epoch)` of a route.
	pub fn route_attempt_stats(&self, id: RouteId) -> Option<(u32, u64)> {
		self.inner
			.routes
			.lock()
			.expect("poisoned")
			.iter()
			.find(|s| s.route.id == id)
			.map(|s| (s.route.failure_count, s.route.last_connect_attempt_ms))
	}

	/// Fired once per adopted connection on a peer-bound route.
	pub fn on_connection(&self) -> &Event<EstablishedConnection> {
		&self.inner.on_connection
	}

	/// Fired once per adopted connection on a catch-all route.
	pub fn on_connection_via_catch_all(&self) -> &Event<EstablishedConnection> {
		&self.inner.on_connection_via_catch_all
	}

	/// `true` when no commserver routes are enabled, otherwise `true` iff at
	/// least one of them holds a live registration.
	pub fn online_state(&self) -> watch::Receiver<bool> {
		self.inner.online.subscribe()
	}

	/// Idempotent: disables every route and closes every connection.
	pub fn shutdown(&self) {
		if !self.inner.lifecycle.shutdown() {
			return;
		}
		info!("route manager shutting down");
		let ids: Vec<RouteId> = self
			.inner
			.routes
			.lock()
			.expect("poisoned")
			.iter()
			.map(|s| s.route.id)
			.collect();
		for id in ids {
			self.disable_route(id);
		}
		let connections: Vec<Connection> = {
			let mut active = self.inner.active.lock().expect("poisoned");
			active.drain().map(|(_, link)| link.connection).collect()
		};
		for connection in connections {
			connection.close("shutting down");
		}
	}
}

impl Drop for ConnectionRouteManager {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl std::fmt::Debug for ConnectionRouteManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionRouteManager")
			.field("routes", &self.route_count())
			.finish()
	}
}

impl Inner {
	fn new_connection(&self, pipe: Pipe) -> Connection {
		let conn = Connection::new(pipe);
		conn.set_message_timeout(self.config.message_timeout);
		let (keepalive, _handle) = KeepAlive::new(self.config.keepalive_interval);
		conn.add_plugin(Box::new(keepalive));
		conn
	}

	fn crypto_for(&self, key: &PublicEncryptionKey) -> Option<CryptoApi> {
		self.crypto.lock().expect("poisoned").get(key).cloned()
	}

	fn link_is_active(&self, link: &LinkKey) -> bool {
		self.active
			.lock()
			.expect("poisoned")
			.get(link)
			.is_some_and(|l| !l.connection.is_closed())
	}

	fn set_state(&self, id: RouteId, state: RouteState) {
		let mut routes = self.routes.lock().expect("poisoned");
		if let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) {
			// Disabled is terminal until re-enabled.
			if slot.route.state != RouteState::Disabled || state == RouteState::Disabled
			{
				slot.route.state = state;
			}
		}
	}

	fn mark_attempt(&self, id: RouteId) {
		let mut routes = self.routes.lock().expect("poisoned");
		if let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) {
			slot.route.last_connect_attempt_ms = now_ms();
		}
	}

	fn bump_failures(&self, id: RouteId) {
		let mut routes = self.routes.lock().expect("poisoned");
		if let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) {
			slot.route.failure_count += 1;
		}
	}

	fn reset_failures(&self, id: RouteId) {
		let mut routes = self.routes.lock().expect("poisoned");
		if let Some(slot) = routes.iter_mut().find(|s| s.route.id == id) {
			slot.route.failure_count = 0;
		}
	}

	fn route_snapshot(&self, id: RouteId) -> Option<Route> {
		self.routes
			.lock()
			.expect("poisoned")
			.iter()
			.find(|s| s.route.id == id)
			.map(|s| s.route.clone())
	}

	fn set_registered(&self, id: RouteId, registered: bool) {
		self.registered
			.lock()
			.expect("poisoned")
			.insert(id, registered);
		self.update_online();
	}

	fn update_online(&self) {
		let commserver_ids: Vec<RouteId> = {
			let routes = self.routes.lock().expect("poisoned");
			routes
				.iter()
				.filter(|s| s.route.kind.is_commserver())
				.map(|s| s.route.id)
				.collect()
		};
		let online = if commserver_ids.is_empty() {
			true
		} else {
			let registered = self.registered.lock().expect("poisoned");
			commserver_ids
				.iter()
				.any(|id| registered.get(id).copied().unwrap_or(false))
		};
		self.online.send_if_modified(|current| {
			if *current != online {
				*current = online;
				true
			} else {
				false
			}
		});
	}

	/// Elects this connection as the link's single active one, or closes it
	/// as a duplicate. Emits exactly one upstream event on success.
	async fn adopt(
		self: &Arc<Self>,
		route_id: RouteId,
		link: LinkKey,
		conn: Connection,
		initiated_locally: bool,
		via_catch_all: bool,
	) -> bool {
		let _guard = self.dup_locks.lock(&link).await;
		{
			let mut active = self.active.lock().expect("poisoned");
			if let Some(existing) = active.get(&link) {
				if !existing.connection.is_closed() {
					drop(active);
					debug!(
						route = %route_id,
						group = %link.2,
						"lost duplicate election, closing"
					);
					conn.close("duplicate connection");
					return false;
				}
			}
			active.insert(
				link.clone(),
				ActiveLink {
					route_id,
					connection: conn.clone(),
				},
			);
		}

		// Free the link again once the connection dies.
		let inner = Arc::clone(self);
		let watch_link = link.clone();
		let watch_conn = conn.clone();
		tokio::spawn(async move {
			watch_conn.wait_closed().await;
			{
				let mut active = inner.active.lock().expect("poisoned");
				if let Some(entry) = active.get(&watch_link) {
					if entry.connection.id() == watch_conn.id() {
						active.remove(&watch_link);
					}
				}
			}
			inner.active_changed.notify_waiters();
			if !initiated_locally {
				inner.set_state(route_id, RouteState::Idle);
			}
		});

		if !initiated_locally && !via_catch_all {
			self.set_state(route_id, RouteState::Active);
		}

		let established = EstablishedConnection {
			connection: conn,
			local_key: link.0,
			remote_key: link.1,
			group: link.2,
			initiated_locally,
		};
		info!(
			conn = established.connection.id(),
			group = %established.group,
			initiated_locally,
			via_catch_all,
			"connection established"
		);
		if via_catch_all {
			self.on_connection_via_catch_all.emit(&established);
		} else {
			self.on_connection.emit(&established);
		}
		true
	}
}

async fn wait_reconnect_delay(inner: &Inner, stop: &mut watch::Receiver<bool>) {
	let base = inner.config.reconnect_delay;
	let jitter_cap = (base.as_millis() / 10).max(1) as u64;
	let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
	tokio::select! {
		_ = sleep(base + jitter) => {}
		_ = stop.changed() => {}
	}
}

async fn run_outgoing(inner: Arc<Inner>, id: RouteId, mut stop: watch::Receiver<bool>) {
	let Some(route) = inner.route_snapshot(id) else {
		return;
	};
	let remote_key = route
		.remote_key
		.expect("outgoing routes always bind a remote key");
	let address = route.address();
	let link: LinkKey = (route.local_key, remote_key, route.group.clone());

	loop {
		if *stop.borrow() {
			break;
		}
		if inner.link_is_active(&link) {
			// Another route carries this link; pause until it frees up.
			inner.set_state(id, RouteState::Idle);
			tokio::select! {
				_ = inner.active_changed.notified() => continue,
				_ = stop.changed() => continue,
			}
		}

		inner.set_state(id, RouteState::Connecting);
		inner.mark_attempt(id);
		match attempt_outgoing(&inner, &address, &route.local_key, &remote_key).await {
			Ok(conn) => {
				inner.reset_failures(id);
				if inner.adopt(id, link.clone(), conn.clone(), true, false).await {
					inner.set_state(id, RouteState::Active);
					tokio::select! {
						_ = conn.wait_closed() => {}
						_ = stop.changed() => {
							if *stop.borrow() {
								conn.close("route disabled");
							}
						}
					}
				}
				inner.set_state(id, RouteState::Idle);
				wait_reconnect_delay(&inner, &mut stop).await;
			}
			Err(e) => {
				debug!(route = %id, error = %e, "connect attempt failed");
				inner.bump_failures(id);
				inner.set_state(id, RouteState::Failed);
				wait_reconnect_delay(&inner, &mut stop).await;
				inner.set_state(id, RouteState::Idle);
			}
		}
	}
	inner.set_state(id, RouteState::Disabled);
}

async fn attempt_outgoing(
	inner: &Arc<Inner>,
	address: &str,
	local_key: &PublicEncryptionKey,
	remote_key: &PublicEncryptionKey,
) -> Result<Connection, AttemptError> {
	let crypto = inner.crypto_for(local_key).ok_or(AttemptError::MissingCrypto)?;
	let pipe = inner.provider.dial(address).await?;
	let conn = inner.new_connection(pipe);
	if let Err(e) = handshake::connect_encrypted(&conn, &crypto, remote_key).await {
		conn.close("handshake failed");
		return Err(e.into());
	}
	Ok(conn)
}

async fn run_incoming(inner: Arc<Inner>, id: RouteId, mut stop: watch::Receiver<bool>) {
	let Some(route) = inner.route_snapshot(id) else {
		return;
	};
	let address = route.address();
	let is_commserver = route.kind.is_commserver();

	loop {
		if *stop.borrow() {
			break;
		}
		match inner.provider.listen(&address).await {
			Ok(mut listener) => {
				inner.set_state(id, RouteState::Idle);
				if is_commserver {
					inner.set_registered(id, true);
				}
				loop {
					tokio::select! {
						_ = stop.changed() => {
							if *stop.borrow() {
								break;
							}
						}
						accepted = listener.accept() => match accepted {
							Some(pipe) => {
								tokio::spawn(handle_incoming(
									Arc::clone(&inner),
									id,
									pipe,
								));
							}
							None => break,
						}
					}
				}
				if is_commserver {
					inner.set_registered(id, false);
				}
			}
			Err(e) => {
				debug!(route = %id, error = %e, "listen failed");
				inner.bump_failures(id);
				inner.set_state(id, RouteState::Failed);
			}
		}
		if *stop.borrow() {
			break;
		}
		wait_reconnect_delay(&inner, &mut stop).await;
	}
	inner.set_state(id, RouteState::Disabled);
}

async fn handle_incoming(inner: Arc<Inner>, route_id: RouteId, pipe: Pipe) {
	let Some(route) = inner.route_snapshot(route_id) else {
		return;
	};
	if route.disabled {
		return;
	}
	let conn = inner.new_connection(pipe);
	let request = match handshake::read_communication_request(&conn).await {
		Ok(request) => request,
		Err(e) => {
			debug!(route = %route_id, error = %e, "bad communication request");
			conn.close("malformed communication request");
			return;
		}
	};
	if request.target != route.local_key {
		conn.close("target key does not match this listener");
		return;
	}
	if let Some(bound) = route.remote_key {
		if bound != request.source {
			warn!(route = %route_id, "rejected connection from unexpected remote key");
			conn.close("remote key is not bound to this route");
			return;
		}
	}
	let Some(crypto) = inner.crypto_for(&route.local_key) else {
		conn.close("no local keys for this listener");
		return;
	};
	if let Err(e) = handshake::accept_encrypted(&conn, &crypto, &request.source).await {
		debug!(route = %route_id, error = %e, "accept handshake failed");
		conn.close("handshake failed");
		return;
	}
	let link: LinkKey = (route.local_key, request.source, route.group.clone());
	inner
		.adopt(route_id, link, conn, false, route.remote_key.is_none())
		.await;
}
