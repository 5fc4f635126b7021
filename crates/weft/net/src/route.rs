//! Route descriptions: one connection recipe per
//! `(local key, remote key, group)` pair.

use url::Url;
use uuid::Uuid;
use weft_crypto::PublicEncryptionKey;

/// Runtime-unique route identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(Uuid);

impl RouteId {
	pub fn random() -> Self {
		Self(Uuid::new_v4())
	}
}

impl std::fmt::Display for RouteId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// How a route produces connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
	/// Dial the peer's registration address.
	Outgoing { url: Url },
	/// Register with a relay and wait for peers to dial in.
	IncomingCommserver { url: Url },
	/// Bind a local socket.
	IncomingDirect { host: String, port: u16 },
}

impl RouteKind {
	pub fn is_incoming(&self) -> bool {
		!matches!(self, RouteKind::Outgoing { .. })
	}

	pub fn is_commserver(&self) -> bool {
		matches!(self, RouteKind::IncomingCommserver { .. })
	}
}

/// The provider address a commserver registration for `key` lives at. The
/// same address is what the peer dials, so invitations embed it.
pub fn commserver_address(url: &Url, key: &PublicEncryptionKey) -> String {
	format!("{}/{}", url.as_str().trim_end_matches('/'), key.to_hex())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
	Disabled,
	Idle,
	Connecting,
	Active,
	Failed,
}

/// One configured route and its runtime state.
#[derive(Debug, Clone)]
pub(crate) struct Route {
	pub id: RouteId,
	pub kind: RouteKind,
	pub local_key: PublicEncryptionKey,
	/// `None` on catch-all routes.
	pub remote_key: Option<PublicEncryptionKey>,
	pub group: String,
	pub disabled: bool,
	pub state: RouteState,
	pub failure_count: u32,
	pub last_connect_attempt_ms: u64,
}

impl Route {
	pub fn new(
		kind: RouteKind,
		local_key: PublicEncryptionKey,
		remote_key: Option<PublicEncryptionKey>,
		group: &str,
	) -> Self {
		Self {
			id: RouteId::random(),
			kind,
			local_key,
			remote_key,
			group: group.to_owned(),
			disabled: true,
			state: RouteState::Disabled,
			failure_count: 0,
			last_connect_attempt_ms: 0,
		}
	}

	/// The provider address this route dials or listens on.
	pub fn address(&self) -> String {
		match &self.kind {
			RouteKind::Outgoing { url } => url.as_str().to_owned(),
			RouteKind::IncomingCommserver { url } => {
				commserver_address(url, &self.local_key)
			}
			RouteKind::IncomingDirect { host, port } => {
				format!("direct://{host}:{port}")
			}
		}
	}

	/// Whether this recipe duplicates `other` (ignoring runtime state).
	pub fn same_recipe(&self, other: &Route) -> bool {
		self.kind == other.kind
			&& self.local_key == other.local_key
			&& self.remote_key == other.remote_key
			&& self.group == other.group
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use weft_crypto::EncryptionKeyPair;

	#[test]
	fn test_commserver_address_embeds_key() {
		let key = EncryptionKeyPair::generate().public();
		let url = Url::parse("memory://relay").unwrap();
		let address = commserver_address(&url, &key);
		assert!(address.ends_with(&key.to_hex()));
		// Trailing slashes don't double up.
		let url = Url::parse("memory://relay/").unwrap();
		assert_eq!(commserver_address(&url, &key), address);
	}

	#[test]
	fn test_same_recipe_ignores_runtime_state() {
		let local = EncryptionKeyPair::generate().public();
		let remote = EncryptionKeyPair::generate().public();
		let url = Url::parse("memory://relay").unwrap();
		let a = Route::new(
			RouteKind::IncomingCommserver { url: url.clone() },
			local,
			Some(remote),
			"chum",
		);
		let mut b = Route::new(
			RouteKind::IncomingCommserver { url },
			local,
			Some(remote),
			"chum",
		);
		b.state = RouteState::Active;
		b.failure_count = 3;
		assert!(a.same_recipe(&b));
		assert_ne!(a.id, b.id);
	}
}
