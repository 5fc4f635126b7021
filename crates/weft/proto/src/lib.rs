//! The pairing and authentication protocol engine.
//!
//! Runs on an already-encrypted [`weft_net::Connection`]. Every exchange is
//! a JSON message tagged by a `command` field, except the binary
//! challenge/response frames. The flow on every connection:
//!
//! 1. mutual person authentication (identity claim plus an encrypted
//!    bit-flip challenge in both directions),
//! 2. instance-id exchange,
//! 3. protocol selection by the initiator (`chum`, `chum_one_time`,
//!    `pairing`, `accessGroup_set`),
//! 4. the selected protocol's body.
//!
//! Any protocol error closes just the connection; authentication tokens are
//! consumed only by a successful pairing, so a retry is possible until the
//! token expires.

pub mod auth;
pub mod chum;
pub mod group;
pub mod messages;
pub mod pairing;
pub mod runtime;

pub use self::auth::{
	exchange_instance_ids, select_protocol, verify_and_exchange_person_id,
	wait_protocol_start, PersonAuth, PersonExchangeOutcome, PROTOCOL_VERSION,
};
pub use self::chum::{ChumPeerInfo, ChumSync, NullChum};
pub use self::messages::{IdentityExport, Protocol, ProtocolMessage};
pub use self::pairing::{Invitation, PairingManager, PairingSuccess};
pub use self::runtime::{ConnectionsConfig, ConnectionsRuntime, PeerEvent};

use weft_common::IdOf;
use weft_net::ConnectionError;
use weft_objects::{Instance, Person};
use weft_trust::TrustError;

#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
	#[error(transparent)]
	Connection(#[from] ConnectionError),
	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),
	#[error("person mismatch: expected {expected}, got {actual}")]
	PersonMismatch {
		expected: IdOf<Person>,
		actual: IdOf<Person>,
	},
	#[error("key mismatch: person {0} presented an unknown key")]
	KeyMismatch(IdOf<Person>),
	#[error("instance mismatch: expected {expected}, got {actual}")]
	InstanceMismatch {
		expected: IdOf<Instance>,
		actual: IdOf<Instance>,
	},
	#[error("protocol violation: {0}")]
	Violation(String),
	#[error("peer requested unsupported protocol version {0}")]
	UnsupportedVersion(String),
	#[error(transparent)]
	Trust(#[from] TrustError),
	#[error(transparent)]
	Store(#[from] weft_store::StoreError),
	#[error(transparent)]
	Transport(#[from] weft_net::TransportError),
	#[error(transparent)]
	Handshake(#[from] weft_net::HandshakeError),
}
