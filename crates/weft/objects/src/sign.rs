//! Signatures and certificate variants.
//!
//! A certificate is an unsigned assertion about an object; the accompanying
//! [`Signature`] object binds it to an issuer. The signed message is the raw
//! 32 bytes of the certificate's content hash.

use serde::{Deserialize, Serialize};
use weft_common::{HashOf, IdOf, RawHash};
use weft_crypto::{PublicSignKey, SignatureBytes};

use crate::person::Person;
use crate::profile::Profile;

/// Issuer's signature over an object's content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
	pub issuer: IdOf<Person>,
	/// Content hash of the signed object (usually a certificate).
	pub data: RawHash,
	pub signature: SignatureBytes,
}

impl Signature {
	/// The exact bytes `signature` covers.
	pub fn message(data: &RawHash) -> [u8; weft_common::HASH_LEN] {
		*data.as_bytes()
	}

	pub fn verify_with(&self, key: &PublicSignKey) -> bool {
		weft_crypto::verify_signature(key, &Self::message(&self.data), &self.signature)
	}
}

/// "I attest this object is correct."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffirmationCertificate {
	pub data: RawHash,
}

/// "The sign keys listed in this profile version belong to its subject."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustKeysCertificate {
	pub profile: HashOf<Profile>,
}

/// Grants read access to one unversioned object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUnversionedObjectCertificate {
	pub data: RawHash,
}

/// Grants read access to all versions of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessVersionedObjectCertificate {
	/// Id hash of the granted object.
	pub obj: RawHash,
}

/// Asserts a relation between two persons within an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationCertificate {
	pub person1: IdOf<Person>,
	pub person2: IdOf<Person>,
	pub relation: String,
	pub app: String,
}

/// Lets the beneficiary affirm their *own* keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightToDeclareTrustedKeysForSelfCertificate {
	pub beneficiary: IdOf<Person>,
}

/// Lets the beneficiary declare trusted keys for *anybody*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightToDeclareTrustedKeysForEverybodyCertificate {
	pub beneficiary: IdOf<Person>,
}

/// Discriminates certificate kinds in trust decisions and their reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateType {
	Affirmation,
	TrustKeys,
	AccessUnversionedObject,
	AccessVersionedObject,
	Relation,
	RightToDeclareTrustedKeysForSelf,
	RightToDeclareTrustedKeysForEverybody,
}

#[cfg(test)]
mod test {
	use super::*;
	use weft_crypto::SignKeyPair;

	#[test]
	fn test_signature_verifies_against_issuer_key() {
		let pair = SignKeyPair::generate();
		let data = RawHash::digest(b"certificate bytes");
		let sig = Signature {
			issuer: Person::id_hash_for("issuer@example.com"),
			data,
			signature: pair.sign(&Signature::message(&data)),
		};
		assert!(sig.verify_with(&pair.public()));
		assert!(!sig.verify_with(&SignKeyPair::generate().public()));
	}
}
