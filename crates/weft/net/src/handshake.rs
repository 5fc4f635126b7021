//! Encrypted-link establishment.
//!
//! Before any protocol runs, both sides agree on which key pair the link is
//! for and switch to symmetric encryption:
//!
//! 1. the initiator sends `communication_request{source_public_key,
//!    target_public_key}` in the clear,
//! 2. the acceptor matches an enabled route (exact remote key or catch-all)
//!    and answers `communication_ready`,
//! 3. both derive the static-static shared key and install the encryption
//!    plugin.
//!
//! After step 3 the acceptor must not send until it received the
//! initiator's first encrypted frame; every protocol in this codebase opens
//! with an initiator-sent message, which guarantees that ordering.

use serde::{Deserialize, Serialize};
use weft_crypto::{CryptoApi, PublicEncryptionKey};

use crate::codec;
use crate::connection::{Connection, ConnectionError};
use crate::plugins::Encryption;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum HandshakeMessage {
	CommunicationRequest {
		source_public_key: PublicEncryptionKey,
		target_public_key: PublicEncryptionKey,
	},
	CommunicationReady,
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
	#[error(transparent)]
	Connection(#[from] ConnectionError),
	#[error("peer requested target key {requested}, this route serves {serving}")]
	TargetKeyMismatch {
		requested: PublicEncryptionKey,
		serving: PublicEncryptionKey,
	},
	#[error("source key {0} is not the peer bound to this route")]
	UnknownSourceKey(PublicEncryptionKey),
}

/// The keys named in a `communication_request`.
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest {
	pub source: PublicEncryptionKey,
	pub target: PublicEncryptionKey,
}

/// Initiator side: requests an encrypted link to `remote_key` and installs
/// the encryption plugin once the peer confirmed.
pub async fn connect_encrypted(
	conn: &Connection,
	crypto: &CryptoApi,
	remote_key: &PublicEncryptionKey,
) -> Result<(), HandshakeError> {
	codec::send_message(
		conn,
		&HandshakeMessage::CommunicationRequest {
			source_public_key: crypto.public_encryption_key(),
			target_public_key: *remote_key,
		},
	)?;
	conn.wait_for_json_with_command("communication_ready").await?;
	conn.add_plugin_wire_side(Box::new(Encryption::new(
		crypto.derive_shared_key(remote_key),
	)));
	Ok(())
}

/// Acceptor side, step 1: reads the request so the caller can match it
/// against its routes.
pub async fn read_communication_request(
	conn: &Connection,
) -> Result<IncomingRequest, HandshakeError> {
	let value = conn.wait_for_json_with_command("communication_request").await?;
	let message: HandshakeMessage = serde_json::from_value(value).map_err(ConnectionError::from)?;
	let HandshakeMessage::CommunicationRequest {
		source_public_key,
		target_public_key,
	} = message
	else {
		unreachable!("wait_for_json_with_command checked the command tag");
	};
	Ok(IncomingRequest {
		source: source_public_key,
		target: target_public_key,
	})
}

/// Acceptor side, step 2: confirms the request and installs encryption for
/// `source_key`.
pub async fn accept_encrypted(
	conn: &Connection,
	crypto: &CryptoApi,
	source_key: &PublicEncryptionKey,
) -> Result<(), HandshakeError> {
	codec::send_message(conn, &HandshakeMessage::CommunicationReady)?;
	conn.add_plugin_wire_side(Box::new(Encryption::new(
		crypto.derive_shared_key(source_key),
	)));
	Ok(())
}
