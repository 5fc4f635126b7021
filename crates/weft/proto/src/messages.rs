//! The wire message catalog.
//!
//! One internally-tagged enum: the `command` field selects the variant, so
//! the serialized form is exactly the JSON objects the protocol specifies.
//! Wire field names are camelCase.

use serde::{Deserialize, Serialize};
use weft_common::IdOf;
use weft_crypto::PublicEncryptionKey;
use weft_objects::{Instance, Keys, Person};

/// Command strings, for `wait_for_message` calls.
pub mod commands {
	pub const PERSON_INFORMATION: &str = "person_information";
	pub const INSTANCE_ID_OBJECT: &str = "instance_id_object";
	pub const AUTHENTICATION_TOKEN: &str = "authentication_token";
	pub const IDENTITY: &str = "identity";
	pub const START_PROTOCOL: &str = "start_protocol";
	pub const ACCESS_GROUP_MEMBERS: &str = "access_group_members";
	pub const SUCCESS: &str = "success";
	pub const PERSON_OBJECT: &str = "person_object";
	pub const SYNCHRONISATION: &str = "synchronisation";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ProtocolMessage {
	#[serde(rename_all = "camelCase")]
	PersonInformation {
		person_id: IdOf<Person>,
		person_public_key: PublicEncryptionKey,
	},
	InstanceIdObject {
		obj: Instance,
	},
	AuthenticationToken {
		token: String,
	},
	Identity {
		obj: IdentityExport,
	},
	StartProtocol {
		protocol: Protocol,
		version: String,
	},
	AccessGroupMembers {
		persons: Vec<String>,
	},
	Success,
	/// Legacy: exchanged by old peers during `chum_one_time`.
	PersonObject {
		obj: Person,
	},
	/// Barrier before handing the connection to the sync engine.
	Synchronisation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Chum,
	ChumOneTime,
	Pairing,
	#[serde(rename = "accessGroup_set")]
	AccessGroupSet,
}

/// A self-contained identity description, exchanged during pairing and
/// persisted by the receiver as a profile about the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityExport {
	pub person: Person,
	pub instance: Instance,
	pub person_keys: Keys,
	pub instance_keys: Keys,
	/// Where the sender's instance can be dialed.
	pub url: Option<String>,
}

#[cfg(test)]
mod test {
	use super::*;
	use weft_objects::VersionedObject;

	#[test]
	fn test_command_tags_match_the_wire_catalog() {
		let person = Person {
			email: "a@example.com".into(),
		};
		let message = ProtocolMessage::PersonInformation {
			person_id: person.id_hash(),
			person_public_key: weft_crypto::EncryptionKeyPair::generate().public(),
		};
		let value = serde_json::to_value(&message).unwrap();
		assert_eq!(value["command"], "person_information");
		assert!(value.get("personId").is_some());
		assert!(value.get("personPublicKey").is_some());

		let value = serde_json::to_value(ProtocolMessage::Success).unwrap();
		assert_eq!(value["command"], "success");

		let value = serde_json::to_value(ProtocolMessage::StartProtocol {
			protocol: Protocol::AccessGroupSet,
			version: "1.0".into(),
		})
		.unwrap();
		assert_eq!(value["command"], "start_protocol");
		assert_eq!(value["protocol"], "accessGroup_set");

		let value = serde_json::to_value(ProtocolMessage::StartProtocol {
			protocol: Protocol::ChumOneTime,
			version: "1.0".into(),
		})
		.unwrap();
		assert_eq!(value["protocol"], "chum_one_time");
	}

	#[test]
	fn test_round_trip() {
		let message = ProtocolMessage::AuthenticationToken {
			token: "deadbeef".into(),
		};
		let text = serde_json::to_string(&message).unwrap();
		let back: ProtocolMessage = serde_json::from_str(&text).unwrap();
		assert_eq!(back, message);
	}
}
