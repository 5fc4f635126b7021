//! Pairing: learning a new peer via a shared secret.
//!
//! The inviting side creates a random single-use token with an expiry and
//! hands the `{token, publicKey, url}` payload out of band (QR code, link).
//! The invited side dials the URL, authenticates and presents the token;
//! both sides then exchange identity objects and persist each other as a
//! new profile. A token is consumed only by a successful pairing, so a
//! failed attempt can retry until the token expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_common::{now_ms, Event, IdOf};
use weft_crypto::PublicEncryptionKey;
use weft_net::{codec, Connection};
use weft_objects::{
	CommunicationEndpoint, Keys, Person, PersonDescription, Profile, VersionedObject,
};
use weft_trust::LeuteModel;

use crate::auth::PersonExchangeOutcome;
use crate::messages::{commands, IdentityExport, ProtocolMessage};
use crate::ProtoError;

/// Out-of-band pairing payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
	pub token: String,
	/// The inviter's instance encryption key (the dial target).
	pub public_key: PublicEncryptionKey,
	/// Where the inviter listens.
	pub url: String,
}

impl Invitation {
	/// Compact form for QR codes and links.
	pub fn encode(&self) -> String {
		let json = serde_json::to_vec(self).expect("invitation serialization cannot fail");
		BASE64_URL_SAFE_NO_PAD.encode(json)
	}

	pub fn decode(encoded: &str) -> Result<Self, ProtoError> {
		let bytes = BASE64_URL_SAFE_NO_PAD
			.decode(encoded)
			.map_err(|e| ProtoError::Violation(format!("invalid invitation: {e}")))?;
		serde_json::from_slice(&bytes)
			.map_err(|e| ProtoError::Violation(format!("invalid invitation: {e}")))
	}
}

/// Emitted on both sides after a pairing completed.
#[derive(Debug, Clone)]
pub struct PairingSuccess {
	pub initiated_locally: bool,
	pub local_person: IdOf<Person>,
	pub remote_person: IdOf<Person>,
	pub token: String,
}

struct ActiveInvitation {
	local_person: IdOf<Person>,
	expires_at_ms: u64,
	expiry_timer: JoinHandle<()>,
}

struct PairingInner {
	leute: LeuteModel,
	/// Registration address peers dial; embedded into invitations.
	url: String,
	token_ttl: Duration,
	active: Mutex<HashMap<String, ActiveInvitation>>,
	on_pairing_success: Event<PairingSuccess>,
}

/// Manages active invitations and drives both pairing roles.
#[derive(Clone)]
pub struct PairingManager {
	inner: Arc<PairingInner>,
}

impl PairingManager {
	pub fn new(leute: LeuteModel, url: String, token_ttl: Duration) -> Self {
		Self {
			inner: Arc::new(PairingInner {
				leute,
				url,
				token_ttl,
				active: Mutex::new(HashMap::new()),
				on_pairing_success: Event::new(),
			}),
		}
	}

	pub fn on_pairing_success(&self) -> &Event<PairingSuccess> {
		&self.inner.on_pairing_success
	}

	/// Creates a single-use invitation bound to the local person, valid for
	/// the configured ttl.
	pub fn create_invitation(&self) -> Result<Invitation, ProtoError> {
		// 32 random bytes: comfortably past the 128-bit floor.
		let token = hex::encode(weft_crypto::random_bytes(32));
		let public_key = self
			.inner
			.leute
			.my_instance_crypto()?
			.public_encryption_key();

		let expiry_timer = tokio::spawn({
			let inner = Arc::clone(&self.inner);
			let token = token.clone();
			let ttl = self.inner.token_ttl;
			async move {
				tokio::time::sleep(ttl).await;
				if inner.active.lock().expect("poisoned").remove(&token).is_some() {
					debug!("invitation expired");
				}
			}
		});

		self.inner.active.lock().expect("poisoned").insert(
			token.clone(),
			ActiveInvitation {
				local_person: self.inner.leute.my_person_id(),
				expires_at_ms: now_ms() + self.inner.token_ttl.as_millis() as u64,
				expiry_timer,
			},
		);
		info!("created pairing invitation");
		Ok(Invitation {
			token,
			public_key,
			url: self.inner.url.clone(),
		})
	}

	pub fn active_invitation_count(&self) -> usize {
		self.inner.active.lock().expect("poisoned").len()
	}

	pub fn has_active_token(&self, token: &str) -> bool {
		self.inner.active.lock().expect("poisoned").contains_key(token)
	}

	/// Checks a presented token without consuming it.
	fn validate_token(&self, token: &str) -> Result<IdOf<Person>, ProtoError> {
		let active = self.inner.active.lock().expect("poisoned");
		let Some(invitation) = active.get(token) else {
			return Err(ProtoError::AuthenticationFailed(
				"Authentication token is not existing".to_owned(),
			));
		};
		if invitation.expires_at_ms <= now_ms() {
			return Err(ProtoError::AuthenticationFailed(
				"Authentication token is not existing".to_owned(),
			));
		}
		Ok(invitation.local_person)
	}

	/// Consumes a token; only called after the pairing succeeded.
	fn consume_token(&self, token: &str) {
		let mut active = self.inner.active.lock().expect("poisoned");
		if let Some(invitation) = active.remove(token) {
			invitation.expiry_timer.abort();
		}
	}

	/// The sender's identity description for the exchange.
	fn my_identity_export(&self) -> Result<IdentityExport, ProtoError> {
		let leute = &self.inner.leute;
		let person: Person = leute
			.store()
			.current_version(leute.my_person_id())
			.map_err(ProtoError::Store)?;
		let instance = leute.my_instance_object()?;
		let person_api = leute.my_person_crypto()?;
		let instance_api = leute.my_instance_crypto()?;
		Ok(IdentityExport {
			person,
			instance,
			person_keys: Keys {
				owner: weft_objects::KeysOwner::Person(leute.my_person_id()),
				public_sign_key: person_api.public_sign_key(),
				public_encryption_key: person_api.public_encryption_key(),
			},
			instance_keys: Keys {
				owner: weft_objects::KeysOwner::Instance(leute.my_instance_id()),
				public_sign_key: instance_api.public_sign_key(),
				public_encryption_key: instance_api.public_encryption_key(),
			},
			url: Some(self.inner.url.clone()),
		})
	}

	/// Persists a received identity as a profile about the remote person.
	fn persist_remote_identity(&self, identity: &IdentityExport) -> Result<(), ProtoError> {
		let leute = &self.inner.leute;
		let store = leute.store();
		let person_id = identity.person.id_hash();
		store.put_versioned(&identity.instance);
		let person_keys = store.put_unversioned(&identity.person_keys);
		let instance_keys = store.put_unversioned(&identity.instance_keys);

		let mut profile =
			Profile::new(person_id, leute.my_person_id(), Profile::DEFAULT);
		profile.add_description(PersonDescription::SignKey {
			key: identity.person_keys.public_sign_key,
		});
		profile.add_endpoint(CommunicationEndpoint::InstanceEndpoint {
			person_id,
			instance_id: identity.instance.id_hash(),
			person_keys,
			instance_keys,
			url: identity.url.clone(),
		});
		leute.add_peer(&identity.person, profile)?;
		Ok(())
	}

	/// Initiator role, after authentication and protocol selection: present
	/// the token, exchange identities, persist, report success.
	pub async fn run_initiator(
		&self,
		conn: &Connection,
		token: &str,
		remote: &PersonExchangeOutcome,
	) -> Result<(), ProtoError> {
		codec::send_message(
			conn,
			&ProtocolMessage::AuthenticationToken {
				token: token.to_owned(),
			},
		)?;
		codec::send_message(
			conn,
			&ProtocolMessage::Identity {
				obj: self.my_identity_export()?,
			},
		)?;
		let message: ProtocolMessage =
			codec::wait_for_message(conn, commands::IDENTITY).await?;
		let ProtocolMessage::Identity { obj } = message else {
			unreachable!("the codec checked the command tag");
		};
		self.persist_remote_identity(&obj)?;

		let success = PairingSuccess {
			initiated_locally: true,
			local_person: self.inner.leute.my_person_id(),
			remote_person: remote.person_id,
			token: token.to_owned(),
		};
		info!(remote = %success.remote_person, "pairing succeeded (initiator)");
		self.inner.on_pairing_success.emit(&success);
		conn.close("pairing complete");
		Ok(())
	}

	/// Responder role: validate the presented token, exchange identities,
	/// persist, consume the token, report success.
	pub async fn run_responder(
		&self,
		conn: &Connection,
		remote: &PersonExchangeOutcome,
	) -> Result<(), ProtoError> {
		let message: ProtocolMessage =
			codec::wait_for_message(conn, commands::AUTHENTICATION_TOKEN).await?;
		let ProtocolMessage::AuthenticationToken { token } = message else {
			unreachable!("the codec checked the command tag");
		};
		let bound_person = self.validate_token(&token)?;
		if bound_person != self.inner.leute.my_person_id() {
			warn!("invitation was issued for another local person");
			return Err(ProtoError::AuthenticationFailed(
				"Authentication token is bound to another person".to_owned(),
			));
		}

		let message: ProtocolMessage =
			codec::wait_for_message(conn, commands::IDENTITY).await?;
		let ProtocolMessage::Identity { obj } = message else {
			unreachable!("the codec checked the command tag");
		};
		codec::send_message(
			conn,
			&ProtocolMessage::Identity {
				obj: self.my_identity_export()?,
			},
		)?;
		self.persist_remote_identity(&obj)?;

		// Single use, consumed only on success.
		self.consume_token(&token);
		let success = PairingSuccess {
			initiated_locally: false,
			local_person: self.inner.leute.my_person_id(),
			remote_person: remote.person_id,
			token,
		};
		info!(remote = %success.remote_person, "pairing succeeded (responder)");
		self.inner.on_pairing_success.emit(&success);
		conn.close("pairing complete");
		Ok(())
	}

	/// Drops all invitations and their timers.
	pub fn shutdown(&self) {
		let mut active = self.inner.active.lock().expect("poisoned");
		for (_, invitation) in active.drain() {
			invitation.expiry_timer.abort();
		}
	}
}

impl std::fmt::Debug for PairingManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PairingManager")
			.field("active", &self.active_invitation_count())
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::Arc;
	use weft_crypto::Keychain;
	use weft_store::Store;

	fn manager(ttl: Duration) -> PairingManager {
		let leute = LeuteModel::create(
			Store::new(),
			Arc::new(Keychain::new()),
			"inviter@example.com",
			"device",
		)
		.unwrap();
		PairingManager::new(leute, "memory://relay/inviter".into(), ttl)
	}

	#[tokio::test]
	async fn test_invitation_round_trip() {
		let manager = manager(Duration::from_secs(60));
		let invitation = manager.create_invitation().unwrap();
		assert_eq!(invitation.token.len(), 64); // 32 bytes hex
		assert_eq!(invitation.url, "memory://relay/inviter");

		let decoded = Invitation::decode(&invitation.encode()).unwrap();
		assert_eq!(decoded, invitation);
		assert!(Invitation::decode("not base64!").is_err());
	}

	#[tokio::test]
	async fn test_tokens_are_unique_and_tracked() {
		let manager = manager(Duration::from_secs(60));
		let a = manager.create_invitation().unwrap();
		let b = manager.create_invitation().unwrap();
		assert_ne!(a.token, b.token);
		assert_eq!(manager.active_invitation_count(), 2);
		assert!(manager.has_active_token(&a.token));

		manager.consume_token(&a.token);
		assert!(!manager.has_active_token(&a.token));
		assert_eq!(manager.active_invitation_count(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_tokens_expire() {
		let manager = manager(Duration::from_millis(10));
		let invitation = manager.create_invitation().unwrap();
		assert!(manager.validate_token(&invitation.token).is_ok());

		tokio::time::sleep(Duration::from_millis(50)).await;
		let err = manager.validate_token(&invitation.token).unwrap_err();
		assert!(err
			.to_string()
			.contains("Authentication token is not existing"));
		assert_eq!(manager.active_invitation_count(), 0);
	}

	#[tokio::test]
	async fn test_unknown_token_is_rejected() {
		let manager = manager(Duration::from_secs(60));
		let err = manager.validate_token("no-such-token").unwrap_err();
		assert!(err
			.to_string()
			.contains("Authentication token is not existing"));
	}
}
