//! The common preamble of every protocol: mutual person authentication and
//! instance-id exchange, then protocol selection.
//!
//! The challenge proves possession of the claimed person's private
//! encryption key: 64 random bytes, sealed to the claimed key; the answer
//! is the bitwise complement, sealed back to the challenger. Both
//! directions must succeed.

use tracing::debug;
use weft_common::IdOf;
use weft_crypto::{CryptoApi, PublicEncryptionKey};
use weft_net::codec;
use weft_net::{Connection, Frame};
use weft_objects::{Instance, Person, VersionedObject};
use weft_trust::LeuteModel;

use crate::messages::{commands, Protocol, ProtocolMessage};
use crate::ProtoError;

/// The protocol version both sides must speak.
pub const PROTOCOL_VERSION: &str = "1.0";

const CHALLENGE_LEN: usize = 64;

/// Inputs of [`verify_and_exchange_person_id`].
pub struct PersonAuth<'a> {
	pub crypto: &'a CryptoApi,
	pub my_person: IdOf<Person>,
	pub leute: &'a LeuteModel,
	pub initiated_locally: bool,
	/// Fail with `PersonMismatch` unless the peer claims this identity.
	pub expected_remote: Option<IdOf<Person>>,
	/// Accept a key that differs from the locally stored ones.
	pub skip_local_key_compare: bool,
}

#[derive(Debug, Clone)]
pub struct PersonExchangeOutcome {
	pub person_id: IdOf<Person>,
	pub public_key: PublicEncryptionKey,
	/// The peer's person was not known locally before.
	pub is_new: bool,
}

/// Mutual person authentication. The initiator sends its identity claim
/// first and challenges first; then the roles swap.
pub async fn verify_and_exchange_person_id(
	conn: &Connection,
	params: PersonAuth<'_>,
) -> Result<PersonExchangeOutcome, ProtoError> {
	let my_info = ProtocolMessage::PersonInformation {
		person_id: params.my_person,
		person_public_key: params.crypto.public_encryption_key(),
	};
	let (remote_person, remote_key) = if params.initiated_locally {
		codec::send_message(conn, &my_info)?;
		receive_person_information(conn).await?
	} else {
		let received = receive_person_information(conn).await?;
		codec::send_message(conn, &my_info)?;
		received
	};

	if params.initiated_locally {
		challenge_peer(conn, params.crypto, &remote_key).await?;
		answer_challenge(conn, params.crypto, &remote_key).await?;
	} else {
		answer_challenge(conn, params.crypto, &remote_key).await?;
		challenge_peer(conn, params.crypto, &remote_key).await?;
	}
	debug!(remote = %remote_person, "person authentication succeeded");

	if let Some(expected) = params.expected_remote {
		if expected != remote_person {
			return Err(ProtoError::PersonMismatch {
				expected,
				actual: remote_person,
			});
		}
	}

	let known_keys = params.leute.known_person_encryption_keys(remote_person)?;
	let is_new = if known_keys.contains(&remote_key) {
		false
	} else if !params.leute.is_known_person(remote_person) {
		true
	} else if known_keys.is_empty() || params.skip_local_key_compare {
		false
	} else {
		return Err(ProtoError::KeyMismatch(remote_person));
	};

	Ok(PersonExchangeOutcome {
		person_id: remote_person,
		public_key: remote_key,
		is_new,
	})
}

async fn receive_person_information(
	conn: &Connection,
) -> Result<(IdOf<Person>, PublicEncryptionKey), ProtoError> {
	let message: ProtocolMessage =
		codec::wait_for_message(conn, commands::PERSON_INFORMATION).await?;
	let ProtocolMessage::PersonInformation {
		person_id,
		person_public_key,
	} = message
	else {
		unreachable!("the codec checked the command tag");
	};
	Ok((person_id, person_public_key))
}

async fn challenge_peer(
	conn: &Connection,
	crypto: &CryptoApi,
	remote_key: &PublicEncryptionKey,
) -> Result<(), ProtoError> {
	let challenge = weft_crypto::random_bytes(CHALLENGE_LEN);
	let sealed = crypto.encrypt_and_embed_nonce(&challenge, remote_key);
	conn.send(Frame::Binary(sealed.into()))?;

	let response = conn.wait_for_binary_message().await?;
	let opened = crypto
		.decrypt_with_embedded_nonce(&response, remote_key)
		.map_err(|_| {
			ProtoError::AuthenticationFailed(
				"challenge response could not be decrypted".to_owned(),
			)
		})?;
	let expected: Vec<u8> = challenge.iter().map(|byte| !byte).collect();
	if !constant_time_eq(&opened, &expected) {
		return Err(ProtoError::AuthenticationFailed(
			"challenge response mismatch".to_owned(),
		));
	}
	Ok(())
}

async fn answer_challenge(
	conn: &Connection,
	crypto: &CryptoApi,
	remote_key: &PublicEncryptionKey,
) -> Result<(), ProtoError> {
	let sealed = conn.wait_for_binary_message().await?;
	let challenge = crypto
		.decrypt_with_embedded_nonce(&sealed, remote_key)
		.map_err(|_| {
			ProtoError::AuthenticationFailed(
				"challenge could not be decrypted".to_owned(),
			)
		})?;
	if challenge.len() != CHALLENGE_LEN {
		return Err(ProtoError::AuthenticationFailed(format!(
			"challenge has {} bytes instead of {CHALLENGE_LEN}",
			challenge.len()
		)));
	}
	let response: Vec<u8> = challenge.iter().map(|byte| !byte).collect();
	conn.send(Frame::Binary(
		crypto.encrypt_and_embed_nonce(&response, remote_key).into(),
	))?;
	Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b) {
		diff |= x ^ y;
	}
	diff == 0
}

/// Symmetric instance-id exchange. Fails with `InstanceMismatch` when a
/// remote instance is already bound for this link and the peer claims
/// another one.
pub async fn exchange_instance_ids(
	conn: &Connection,
	my_instance: &Instance,
	initiated_locally: bool,
	bound_remote: Option<IdOf<Instance>>,
) -> Result<IdOf<Instance>, ProtoError> {
	let my_message = ProtocolMessage::InstanceIdObject {
		obj: my_instance.clone(),
	};
	let received = if initiated_locally {
		codec::send_message(conn, &my_message)?;
		receive_instance(conn).await?
	} else {
		let received = receive_instance(conn).await?;
		codec::send_message(conn, &my_message)?;
		received
	};
	let remote_id = received.id_hash();
	if let Some(bound) = bound_remote {
		if bound != remote_id {
			return Err(ProtoError::InstanceMismatch {
				expected: bound,
				actual: remote_id,
			});
		}
	}
	Ok(remote_id)
}

async fn receive_instance(conn: &Connection) -> Result<Instance, ProtoError> {
	let message: ProtocolMessage =
		codec::wait_for_message(conn, commands::INSTANCE_ID_OBJECT).await?;
	let ProtocolMessage::InstanceIdObject { obj } = message else {
		unreachable!("the codec checked the command tag");
	};
	Ok(obj)
}

/// Initiator side of protocol selection.
pub fn select_protocol(conn: &Connection, protocol: Protocol) -> Result<(), ProtoError> {
	codec::send_message(
		conn,
		&ProtocolMessage::StartProtocol {
			protocol,
			version: PROTOCOL_VERSION.to_owned(),
		},
	)?;
	Ok(())
}

/// Responder side of protocol selection, with version check.
pub async fn wait_protocol_start(conn: &Connection) -> Result<Protocol, ProtoError> {
	let message: ProtocolMessage =
		codec::wait_for_message(conn, commands::START_PROTOCOL).await?;
	let ProtocolMessage::StartProtocol { protocol, version } = message else {
		unreachable!("the codec checked the command tag");
	};
	if version != PROTOCOL_VERSION {
		return Err(ProtoError::UnsupportedVersion(version));
	}
	Ok(protocol)
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::Arc;
	use weft_crypto::Keychain;
	use weft_net::pipe_pair;
	use weft_store::Store;

	fn leute(email: &str) -> LeuteModel {
		LeuteModel::create(
			Store::new(),
			Arc::new(Keychain::new()),
			email,
			"device",
		)
		.unwrap()
	}

	fn conn_pair() -> (Connection, Connection) {
		let (a, b) = pipe_pair();
		(Connection::new(a), Connection::new(b))
	}

	async fn run_both(
		a: impl std::future::Future<Output = Result<PersonExchangeOutcome, ProtoError>>,
		b: impl std::future::Future<Output = Result<PersonExchangeOutcome, ProtoError>>,
	) -> (
		Result<PersonExchangeOutcome, ProtoError>,
		Result<PersonExchangeOutcome, ProtoError>,
	) {
		tokio::join!(a, b)
	}

	#[tokio::test]
	async fn test_mutual_authentication_succeeds() {
		let alice = leute("alice@example.com");
		let bob = leute("bob@example.com");
		let (conn_a, conn_b) = conn_pair();

		let (result_a, result_b) = run_both(
			verify_and_exchange_person_id(
				&conn_a,
				PersonAuth {
					crypto: &alice.my_person_crypto().unwrap(),
					my_person: alice.my_person_id(),
					leute: &alice,
					initiated_locally: true,
					expected_remote: None,
					skip_local_key_compare: false,
				},
			),
			verify_and_exchange_person_id(
				&conn_b,
				PersonAuth {
					crypto: &bob.my_person_crypto().unwrap(),
					my_person: bob.my_person_id(),
					leute: &bob,
					initiated_locally: false,
					expected_remote: None,
					skip_local_key_compare: false,
				},
			),
		)
		.await;

		let outcome_a = result_a.unwrap();
		let outcome_b = result_b.unwrap();
		assert_eq!(outcome_a.person_id, bob.my_person_id());
		assert_eq!(outcome_b.person_id, alice.my_person_id());
		// Neither side knew the other yet.
		assert!(outcome_a.is_new);
		assert!(outcome_b.is_new);
	}

	#[tokio::test]
	async fn test_wrong_key_fails_the_challenge() {
		let alice = leute("alice@example.com");
		let bob = leute("bob@example.com");
		let (conn_a, conn_b) = conn_pair();

		// Bob claims his identity but answers with an unrelated key: only
		// the holder of the claimed private key can pass the bit-flip
		// challenge.
		let mallory_crypto = CryptoApi::generate();
		let claimed = ProtocolMessage::PersonInformation {
			person_id: bob.my_person_id(),
			person_public_key: bob
				.my_person_crypto()
				.unwrap()
				.public_encryption_key(),
		};

		let attacker = tokio::spawn({
			let conn_b = conn_b.clone();
			async move {
				codec::wait_for_message::<ProtocolMessage>(
					&conn_b,
					commands::PERSON_INFORMATION,
				)
				.await
				.unwrap();
				codec::send_message(&conn_b, &claimed).unwrap();
				// Answer the challenge with the wrong key.
				let sealed = conn_b.wait_for_binary_message().await.unwrap();
				let _ = mallory_crypto.decrypt_with_embedded_nonce(
					&sealed,
					&CryptoApi::generate().public_encryption_key(),
				);
				conn_b
					.send(Frame::Binary(vec![0u8; 80].into()))
					.unwrap();
			}
		});

		let result = verify_and_exchange_person_id(
			&conn_a,
			PersonAuth {
				crypto: &alice.my_person_crypto().unwrap(),
				my_person: alice.my_person_id(),
				leute: &alice,
				initiated_locally: true,
				expected_remote: None,
				skip_local_key_compare: false,
			},
		)
		.await;
		assert!(matches!(result, Err(ProtoError::AuthenticationFailed(_))));
		attacker.await.unwrap();
	}

	#[tokio::test]
	async fn test_expected_remote_mismatch() {
		let alice = leute("alice@example.com");
		let bob = leute("bob@example.com");
		let (conn_a, conn_b) = conn_pair();

		let expected = weft_objects::Person::id_hash_for("somebody-else@example.com");
		let bob_task = tokio::spawn({
			let bob = bob.clone();
			async move {
				verify_and_exchange_person_id(
					&conn_b,
					PersonAuth {
						crypto: &bob.my_person_crypto().unwrap(),
						my_person: bob.my_person_id(),
						leute: &bob,
						initiated_locally: false,
						expected_remote: None,
						skip_local_key_compare: false,
					},
				)
				.await
			}
		});

		let result = verify_and_exchange_person_id(
			&conn_a,
			PersonAuth {
				crypto: &alice.my_person_crypto().unwrap(),
				my_person: alice.my_person_id(),
				leute: &alice,
				initiated_locally: true,
				expected_remote: Some(expected),
				skip_local_key_compare: false,
			},
		)
		.await;
		assert!(matches!(result, Err(ProtoError::PersonMismatch { .. })));
		// Bob's side completed its exchange before Alice noticed.
		let _ = bob_task.await.unwrap();
	}

	#[tokio::test]
	async fn test_instance_exchange_and_binding() {
		let (conn_a, conn_b) = conn_pair();
		let owner_a = Person::id_hash_for("a@example.com");
		let owner_b = Person::id_hash_for("b@example.com");
		let instance_a = Instance {
			name: "laptop".into(),
			owner: owner_a,
		};
		let instance_b = Instance {
			name: "phone".into(),
			owner: owner_b,
		};

		let b_task = tokio::spawn({
			let instance_b = instance_b.clone();
			async move {
				exchange_instance_ids(&conn_b, &instance_b, false, None).await
			}
		});
		let got_b = exchange_instance_ids(&conn_a, &instance_a, true, None)
			.await
			.unwrap();
		assert_eq!(got_b, instance_b.id_hash());
		assert_eq!(b_task.await.unwrap().unwrap(), instance_a.id_hash());

		// A bound, different instance id is a hard failure.
		let (conn_a, conn_b) = conn_pair();
		let b_task = tokio::spawn({
			let instance_b = instance_b.clone();
			async move {
				exchange_instance_ids(&conn_b, &instance_b, false, None).await
			}
		});
		let bound = Instance {
			name: "other-device".into(),
			owner: owner_b,
		}
		.id_hash();
		let result =
			exchange_instance_ids(&conn_a, &instance_a, true, Some(bound)).await;
		assert!(matches!(result, Err(ProtoError::InstanceMismatch { .. })));
		let _ = b_task.await.unwrap();
	}

	#[tokio::test]
	async fn test_protocol_selection_checks_version() {
		let (conn_a, conn_b) = conn_pair();
		select_protocol(&conn_a, Protocol::Chum).unwrap();
		assert_eq!(wait_protocol_start(&conn_b).await.unwrap(), Protocol::Chum);

		codec::send_message(
			&conn_a,
			&ProtocolMessage::StartProtocol {
				protocol: Protocol::Pairing,
				version: "0.9".into(),
			},
		)
		.unwrap();
		assert!(matches!(
			wait_protocol_start(&conn_b).await,
			Err(ProtoError::UnsupportedVersion(_))
		));
	}
}
