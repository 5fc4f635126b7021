//! Wiring: routes, authentication and protocol dispatch for one
//! installation.
//!
//! The runtime owns the route manager and the pairing manager. At
//! construction it registers a catch-all listener with the relay (when
//! incoming connections are accepted) and an outgoing route per known peer
//! endpoint; every adopted connection then runs the common preamble and
//! the selected protocol.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use weft_common::event::SubscriptionGuard;
use weft_common::{Event, IdOf, Lifecycle};
use weft_net::plugins::KeepAlive;
use weft_net::{
	commserver_address, connect_encrypted, Connection, ConnectionRouteManager,
	EstablishedConnection, RouteManagerConfig, TransportProvider,
};
use weft_objects::{Instance, Person};
use weft_trust::LeuteModel;

use crate::auth::{
	exchange_instance_ids, select_protocol, verify_and_exchange_person_id,
	wait_protocol_start, PersonAuth,
};
use crate::chum::{ChumPeerInfo, ChumSync};
use crate::messages::Protocol;
use crate::pairing::{Invitation, PairingManager};
use crate::{group, ProtoError};

/// Recognized configuration options.
#[derive(Debug, Clone)]
pub struct ConnectionsConfig {
	pub commserver_url: Option<Url>,
	pub accept_incoming_connections: bool,
	/// Accept known persons connecting from instances we have no endpoint
	/// for yet.
	pub accept_unknown_instances: bool,
	/// Accept chum requests from persons we have never seen.
	pub accept_unknown_persons: bool,
	pub allow_pairing: bool,
	pub pairing_token_ttl_ms: u64,
	/// `Some(group name)` enables the `accessGroup_set` protocol.
	pub allow_set_auth_group: Option<String>,
	pub establish_outgoing_connections: bool,
	pub reconnect_delay_ms: u64,
	pub message_timeout_ms: u64,
}

impl Default for ConnectionsConfig {
	fn default() -> Self {
		Self {
			commserver_url: None,
			accept_incoming_connections: true,
			accept_unknown_instances: true,
			accept_unknown_persons: false,
			allow_pairing: true,
			pairing_token_ttl_ms: 60_000,
			allow_set_auth_group: None,
			establish_outgoing_connections: true,
			reconnect_delay_ms: 5_000,
			message_timeout_ms: 30_000,
		}
	}
}

/// Group name of the links the runtime maintains to known peers.
const CHUM_GROUP: &str = "chum";
/// Group name of the catch-all listener.
const INCOMING_GROUP: &str = "incoming";

/// Emitted after a connection finished the preamble.
#[derive(Debug, Clone)]
pub struct PeerEvent {
	pub remote_person: IdOf<Person>,
	pub remote_instance: IdOf<Instance>,
	pub initiated_locally: bool,
}

struct RuntimeInner {
	config: ConnectionsConfig,
	leute: LeuteModel,
	provider: Arc<dyn TransportProvider>,
	route_manager: ConnectionRouteManager,
	pairing: PairingManager,
	chum: Arc<dyn ChumSync>,
	on_known_connection: Event<PeerEvent>,
	on_unknown_connection: Event<PeerEvent>,
	lifecycle: Lifecycle,
	subscriptions: Mutex<Vec<SubscriptionGuard>>,
}

pub struct ConnectionsRuntime {
	inner: Arc<RuntimeInner>,
}

impl ConnectionsRuntime {
	pub fn new(
		leute: LeuteModel,
		provider: Arc<dyn TransportProvider>,
		chum: Arc<dyn ChumSync>,
		config: ConnectionsConfig,
	) -> Result<Self, ProtoError> {
		let instance_crypto = leute.my_instance_crypto()?;
		let route_manager = ConnectionRouteManager::new(
			Arc::clone(&provider),
			RouteManagerConfig {
				reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
				message_timeout: Duration::from_millis(config.message_timeout_ms),
				..Default::default()
			},
		);

		// The address peers dial us at; embedded into invitations.
		let own_address = config
			.commserver_url
			.as_ref()
			.map(|url| commserver_address(url, &instance_crypto.public_encryption_key()))
			.unwrap_or_default();
		let pairing = PairingManager::new(
			leute.clone(),
			own_address,
			Duration::from_millis(config.pairing_token_ttl_ms),
		);

		if config.accept_incoming_connections {
			if let Some(url) = &config.commserver_url {
				route_manager.add_incoming_commserver_catch_all(
					instance_crypto.clone(),
					url.clone(),
					INCOMING_GROUP,
				);
			}
		}
		if config.establish_outgoing_connections {
			for someone in leute.someones()? {
				for person in someone.persons() {
					if person == leute.my_person_id() {
						continue;
					}
					for endpoint in leute.endpoints_for_person(person)? {
						let Some(url) = &endpoint.url else {
							continue;
						};
						let Ok(url) = Url::parse(url) else {
							warn!(%person, %url, "skipping unparsable endpoint url");
							continue;
						};
						route_manager.add_outgoing(
							instance_crypto.clone(),
							endpoint.instance_keys.public_encryption_key,
							url,
							CHUM_GROUP,
						);
					}
				}
			}
		}

		let inner = Arc::new(RuntimeInner {
			config,
			leute,
			provider,
			route_manager,
			pairing,
			chum,
			on_known_connection: Event::new(),
			on_unknown_connection: Event::new(),
			lifecycle: Lifecycle::new(),
			subscriptions: Mutex::new(Vec::new()),
		});
		inner.lifecycle.init().expect("fresh lifecycle");

		let weak = Arc::downgrade(&inner);
		let known = inner.route_manager.on_connection().subscribe(move |established| {
			dispatch(&weak, established.clone(), false);
		});
		let weak = Arc::downgrade(&inner);
		let catch_all = inner
			.route_manager
			.on_connection_via_catch_all()
			.subscribe(move |established| {
				dispatch(&weak, established.clone(), true);
			});
		{
			let mut subscriptions = inner.subscriptions.lock().expect("poisoned");
			subscriptions.push(known);
			subscriptions.push(catch_all);
		}
		inner.route_manager.enable_all();
		info!("connections runtime started");

		Ok(Self { inner })
	}

	pub fn pairing(&self) -> &PairingManager {
		&self.inner.pairing
	}

	pub fn route_manager(&self) -> &ConnectionRouteManager {
		&self.inner.route_manager
	}

	pub fn on_known_connection(&self) -> &Event<PeerEvent> {
		&self.inner.on_known_connection
	}

	/// Connections from peers no local record exists for (catch-all only).
	pub fn on_unknown_connection(&self) -> &Event<PeerEvent> {
		&self.inner.on_unknown_connection
	}

	pub fn online_state(&self) -> tokio::sync::watch::Receiver<bool> {
		self.inner.route_manager.online_state()
	}

	pub fn create_invitation(&self) -> Result<Invitation, ProtoError> {
		if !self.inner.config.allow_pairing {
			return Err(ProtoError::Violation("pairing is disabled".to_owned()));
		}
		self.inner.pairing.create_invitation()
	}

	/// Dials the inviter and runs the pairing protocol as initiator.
	pub async fn connect_using_invitation(
		&self,
		invitation: &Invitation,
	) -> Result<(), ProtoError> {
		self.inner
			.lifecycle
			.assert_initialised()
			.map_err(|_| ProtoError::Violation("runtime is shut down".to_owned()))?;
		let conn = self.open_pairing_connection(invitation).await?;
		let result = self.run_pairing_initiator(&conn, invitation).await;
		if let Err(e) = &result {
			conn.close(&e.to_string());
		}
		result
	}

	async fn open_pairing_connection(
		&self,
		invitation: &Invitation,
	) -> Result<Connection, ProtoError> {
		let instance_crypto = self.inner.leute.my_instance_crypto()?;
		let pipe = self.inner.provider.dial(&invitation.url).await?;
		let conn = Connection::new(pipe);
		conn.set_message_timeout(Duration::from_millis(
			self.inner.config.message_timeout_ms,
		));
		let (keepalive, _handle) = KeepAlive::new(Duration::from_secs(20));
		conn.add_plugin(Box::new(keepalive));
		connect_encrypted(&conn, &instance_crypto, &invitation.public_key).await?;
		Ok(conn)
	}

	async fn run_pairing_initiator(
		&self,
		conn: &Connection,
		invitation: &Invitation,
	) -> Result<(), ProtoError> {
		let leute = &self.inner.leute;
		let outcome = verify_and_exchange_person_id(
			conn,
			PersonAuth {
				crypto: &leute.my_person_crypto()?,
				my_person: leute.my_person_id(),
				leute,
				initiated_locally: true,
				expected_remote: None,
				skip_local_key_compare: true,
			},
		)
		.await?;
		let my_instance = leute.my_instance_object()?;
		exchange_instance_ids(conn, &my_instance, true, None).await?;
		select_protocol(conn, Protocol::Pairing)?;
		self.inner
			.pairing
			.run_initiator(conn, &invitation.token, &outcome)
			.await
	}

	/// Idempotent: tears down routes, listeners and invitations.
	pub fn shutdown(&self) {
		if !self.inner.lifecycle.shutdown() {
			return;
		}
		info!("connections runtime shutting down");
		self.inner.subscriptions.lock().expect("poisoned").clear();
		self.inner.route_manager.shutdown();
		self.inner.pairing.shutdown();
	}
}

impl Drop for ConnectionsRuntime {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl std::fmt::Debug for ConnectionsRuntime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionsRuntime")
			.field("leute", &self.inner.leute)
			.finish()
	}
}

/// The `(person, instance)` an instance encryption key is bound to, if the
/// key appears in any stored endpoint.
fn bound_endpoint_for_key(
	leute: &LeuteModel,
	key: &weft_crypto::PublicEncryptionKey,
) -> Result<Option<(IdOf<Person>, IdOf<Instance>)>, ProtoError> {
	for someone in leute.someones()? {
		for person in someone.persons() {
			for endpoint in leute.endpoints_for_person(person)? {
				if endpoint.instance_keys.public_encryption_key == *key {
					return Ok(Some((person, endpoint.instance_id)));
				}
			}
		}
	}
	Ok(None)
}

fn dispatch(inner: &Weak<RuntimeInner>, established: EstablishedConnection, via_catch_all: bool) {
	let Some(inner) = inner.upgrade() else {
		established.connection.close("shutting down");
		return;
	};
	tokio::spawn(async move {
		let conn = established.connection.clone();
		if let Err(e) = drive_connection(&inner, &established, via_catch_all).await {
			warn!(conn = conn.id(), error = %e, "protocol failed");
			conn.close(&e.to_string());
		}
	});
}

/// The common preamble and protocol dispatch for one adopted connection.
async fn drive_connection(
	inner: &Arc<RuntimeInner>,
	established: &EstablishedConnection,
	via_catch_all: bool,
) -> Result<(), ProtoError> {
	let leute = &inner.leute;
	let conn = &established.connection;

	// On a peer-bound route the remote key already names a person; the peer
	// must claim exactly that identity.
	let bound = bound_endpoint_for_key(leute, &established.remote_key)?;
	let outcome = verify_and_exchange_person_id(
		conn,
		PersonAuth {
			crypto: &leute.my_person_crypto()?,
			my_person: leute.my_person_id(),
			leute,
			initiated_locally: established.initiated_locally,
			expected_remote: if via_catch_all {
				None
			} else {
				bound.map(|(person, _)| person)
			},
			skip_local_key_compare: via_catch_all,
		},
	)
	.await?;

	let bound_instance = bound.and_then(|(person, instance)| {
		(person == outcome.person_id).then_some(instance)
	});
	let my_instance = leute.my_instance_object()?;
	let remote_instance =
		exchange_instance_ids(conn, &my_instance, established.initiated_locally, bound_instance)
			.await?;
	if !inner.config.accept_unknown_instances && bound_instance.is_none() && !outcome.is_new {
		return Err(ProtoError::AuthenticationFailed(
			"known person connected from an unknown instance".to_owned(),
		));
	}

	let peer_event = PeerEvent {
		remote_person: outcome.person_id,
		remote_instance,
		initiated_locally: established.initiated_locally,
	};
	let peer_info = ChumPeerInfo {
		local_person: leute.my_person_id(),
		remote_person: outcome.person_id,
		remote_instance,
		initiated_locally: established.initiated_locally,
	};

	if established.initiated_locally {
		// Links the runtime establishes itself exist for syncing.
		select_protocol(conn, Protocol::Chum)?;
		inner.on_known_connection.emit(&peer_event);
		return inner.chum.run(conn, peer_info, true).await;
	}

	match wait_protocol_start(conn).await? {
		protocol @ (Protocol::Chum | Protocol::ChumOneTime) => {
			if outcome.is_new && !inner.config.accept_unknown_persons {
				return Err(ProtoError::AuthenticationFailed(
					"unknown person".to_owned(),
				));
			}
			if outcome.is_new {
				debug!(person = %outcome.person_id, "unknown peer accepted via catch-all");
				inner.on_unknown_connection.emit(&peer_event);
			} else {
				inner.on_known_connection.emit(&peer_event);
			}
			let keep_running = protocol == Protocol::Chum;
			inner.chum.run(conn, peer_info, keep_running).await?;
			if !keep_running {
				conn.close("one-time sync complete");
			}
			Ok(())
		}
		Protocol::Pairing => {
			if !inner.config.allow_pairing {
				return Err(ProtoError::Violation("pairing is disabled".to_owned()));
			}
			inner.pairing.run_responder(conn, &outcome).await
		}
		Protocol::AccessGroupSet => {
			let Some(group_name) = &inner.config.allow_set_auth_group else {
				return Err(ProtoError::Violation(
					"accessGroup_set is disabled".to_owned(),
				));
			};
			group::serve(conn, leute, group_name).await
		}
	}
}
