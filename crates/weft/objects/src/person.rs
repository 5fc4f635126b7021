//! Persons, instances (devices) and their published keys.

use serde::{Deserialize, Serialize};
use weft_common::IdOf;
use weft_crypto::{PublicEncryptionKey, PublicSignKey};

use crate::{digest_id_fields, Storable, VersionedObject};

/// A real-world identity, identified by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
	pub email: String,
}

impl VersionedObject for Person {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "email": self.email })
	}
}

impl Person {
	/// Id hash a `Person` with this email would have, without building one.
	pub fn id_hash_for(email: &str) -> IdOf<Person> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({ "email": email }),
		))
	}
}

/// One device of a person. Created at first boot, immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
	pub name: String,
	pub owner: IdOf<Person>,
}

impl VersionedObject for Instance {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "name": self.name, "owner": self.owner })
	}
}

/// Who a [`Keys`] object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner_type", content = "id", rename_all = "snake_case")]
pub enum KeysOwner {
	Person(IdOf<Person>),
	Instance(IdOf<Instance>),
}

/// A published keypair set. Content-addressed; key rotation writes a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
	pub owner: KeysOwner,
	pub public_sign_key: PublicSignKey,
	pub public_encryption_key: PublicEncryptionKey,
}

/// An arbitrary user payload, mostly posted into channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
	pub content: String,
}
