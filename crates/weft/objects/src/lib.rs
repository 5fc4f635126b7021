//! The stored object model.
//!
//! Every persisted entity is a variant of [`Object`], a sum type tagged with
//! a `type` field. Objects are identified either by **content hash**
//! ([`content_hash`]: sha256 of the canonical JSON of the tagged value) or,
//! for versioned objects, by **id hash** ([`id_hash`]: sha256 over the type
//! tag and the type-declared id fields only, shared by all versions).
//!
//! Canonical JSON here means serialization through [`serde_json::Value`],
//! whose maps are ordered, so field order never influences a hash.

mod access;
mod channel;
mod person;
mod profile;
mod sign;
mod someone;

pub use self::access::IdAccess;
pub use self::channel::{
	ChannelEntry, ChannelInfo, ChannelRegistry, ChannelRegistryEntry, CreationTime,
};
pub use self::person::{Document, Instance, Keys, KeysOwner, Person};
pub use self::profile::{CommunicationEndpoint, PersonDescription, Profile};
pub use self::sign::{
	AccessUnversionedObjectCertificate, AccessVersionedObjectCertificate,
	AffirmationCertificate, CertificateType, RelationCertificate,
	RightToDeclareTrustedKeysForEverybodyCertificate,
	RightToDeclareTrustedKeysForSelfCertificate, Signature, TrustKeysCertificate,
};
pub use self::someone::{Group, Leute, Someone};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use weft_common::{HashOf, IdOf, RawHash};

macro_rules! object_model {
	{$( $ident:ident, )*} => {
		/// Every object the store can hold.
		#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
		#[serde(tag = "type")]
		pub enum Object {
			$( $ident($ident), )*
		}

		/// The type tag of an [`Object`], as a plain enum.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
		pub enum ObjectType {
			$( $ident, )*
		}

		impl Object {
			pub fn object_type(&self) -> ObjectType {
				match self {
					$( Object::$ident(_) => ObjectType::$ident, )*
				}
			}
		}

		impl ObjectType {
			/// The `type` tag used in serialized form.
			pub fn tag(&self) -> &'static str {
				match self {
					$( ObjectType::$ident => stringify!($ident), )*
				}
			}
		}

		$(
			impl Storable for $ident {
				const TYPE: ObjectType = ObjectType::$ident;

				fn into_object(self) -> Object {
					Object::$ident(self)
				}

				fn from_object(obj: Object) -> Option<Self> {
					match obj {
						Object::$ident(v) => Some(v),
						_ => None,
					}
				}
			}
		)*
	}
}

object_model! {
	Person,
	Instance,
	Keys,
	Profile,
	Someone,
	Leute,
	Group,
	IdAccess,
	Document,
	Signature,
	AffirmationCertificate,
	TrustKeysCertificate,
	AccessUnversionedObjectCertificate,
	AccessVersionedObjectCertificate,
	RelationCertificate,
	RightToDeclareTrustedKeysForSelfCertificate,
	RightToDeclareTrustedKeysForEverybodyCertificate,
	ChannelInfo,
	ChannelEntry,
	CreationTime,
	ChannelRegistry,
}

impl std::fmt::Display for ObjectType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.tag())
	}
}

/// A type that can live in the store.
pub trait Storable: Clone + Serialize + DeserializeOwned {
	const TYPE: ObjectType;

	fn into_object(self) -> Object;
	fn from_object(obj: Object) -> Option<Self>;
}

/// A storable type with declared id fields; instances with equal id fields
/// are versions of the same logical object.
pub trait VersionedObject: Storable {
	/// The id-declaring fields as a JSON object (without the type tag).
	fn id_fields(&self) -> serde_json::Value;

	fn id_hash(&self) -> IdOf<Self> {
		IdOf::from_raw(digest_id_fields(Self::TYPE, self.id_fields()))
	}
}

/// Canonical serialization of an [`Object`].
pub fn canonical_bytes(obj: &Object) -> Vec<u8> {
	let value = serde_json::to_value(obj).expect("object serialization cannot fail");
	serde_json::to_vec(&value).expect("value serialization cannot fail")
}

/// Content hash of a storable value.
pub fn content_hash<T: Storable>(obj: &T) -> HashOf<T> {
	HashOf::from_raw(content_hash_raw(&obj.clone().into_object()))
}

pub fn content_hash_raw(obj: &Object) -> RawHash {
	RawHash::digest(&canonical_bytes(obj))
}

/// Id hash of a versioned value.
pub fn id_hash<T: VersionedObject>(obj: &T) -> IdOf<T> {
	obj.id_hash()
}

pub(crate) fn digest_id_fields(ty: ObjectType, fields: serde_json::Value) -> RawHash {
	let mut fields = match fields {
		serde_json::Value::Object(map) => map,
		other => panic!("id fields must be a JSON object, got {other:?}"),
	};
	fields.insert("type".to_owned(), serde_json::Value::from(ty.tag()));
	let bytes = serde_json::to_vec(&serde_json::Value::Object(fields))
		.expect("value serialization cannot fail");
	RawHash::digest(&bytes)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_content_hash_is_stable_and_type_tagged() {
		let person = Person {
			email: "a@example.com".into(),
		};
		assert_eq!(content_hash(&person), content_hash(&person.clone()));

		// Same field layout under a different tag must hash differently.
		let document = Document {
			content: "a@example.com".into(),
		};
		assert_ne!(content_hash(&person).raw(), content_hash(&document).raw());
	}

	#[test]
	fn test_id_hash_ignores_non_id_fields() {
		let owner = Person {
			email: "o@example.com".into(),
		}
		.id_hash();
		let a = ChannelInfo {
			id: "measurements".into(),
			owner,
			head: None,
		};
		let entry = ChannelEntry {
			previous: None,
			data: HashOf::from_raw(RawHash::digest(b"ct")),
		};
		let b = ChannelInfo {
			id: "measurements".into(),
			owner,
			head: Some(content_hash(&entry)),
		};
		assert_eq!(a.id_hash(), b.id_hash());
		assert_ne!(content_hash(&a), content_hash(&b));
	}

	#[test]
	fn test_object_round_trip() {
		let keys = Keys {
			owner: KeysOwner::Person(
				Person {
					email: "k@example.com".into(),
				}
				.id_hash(),
			),
			public_sign_key: weft_crypto::SignKeyPair::generate().public(),
			public_encryption_key: weft_crypto::EncryptionKeyPair::generate().public(),
		};
		let obj = keys.clone().into_object();
		let json = serde_json::to_string(&obj).unwrap();
		assert!(json.contains("\"type\":\"Keys\""));
		let back: Object = serde_json::from_str(&json).unwrap();
		assert_eq!(back, obj);
		assert_eq!(Keys::from_object(back).unwrap(), keys);
	}
}
