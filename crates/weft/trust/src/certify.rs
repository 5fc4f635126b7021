//! Certificate issuing helpers.
//!
//! A certificate object is stored as-is; the signature object binds it to
//! the issuer by signing the certificate's content hash.

use weft_common::{HashOf, IdOf};
use weft_crypto::SignKeyPair;
use weft_objects::{
	AffirmationCertificate, Person, Profile,
	RightToDeclareTrustedKeysForEverybodyCertificate,
	RightToDeclareTrustedKeysForSelfCertificate, Signature, Storable,
	TrustKeysCertificate,
};
use weft_store::Store;

/// Stores `certificate` and a signature over it by `issuer`.
pub fn sign_certificate<T: Storable>(
	store: &Store,
	issuer: IdOf<Person>,
	key: &SignKeyPair,
	certificate: &T,
) -> (HashOf<T>, HashOf<Signature>) {
	let certificate_hash = store.put_unversioned(certificate);
	let data = certificate_hash.raw();
	let signature = Signature {
		issuer,
		data,
		signature: key.sign(&Signature::message(&data)),
	};
	(certificate_hash, store.put_unversioned(&signature))
}

/// "The sign keys in this profile version belong to its subject."
pub fn certify_trust_keys(
	store: &Store,
	issuer: IdOf<Person>,
	key: &SignKeyPair,
	profile: HashOf<Profile>,
) -> HashOf<Signature> {
	sign_certificate(store, issuer, key, &TrustKeysCertificate { profile }).1
}

/// Affirms one profile version (self-declaration of own keys).
pub fn affirm_profile(
	store: &Store,
	issuer: IdOf<Person>,
	key: &SignKeyPair,
	profile: HashOf<Profile>,
) -> HashOf<Signature> {
	sign_certificate(
		store,
		issuer,
		key,
		&AffirmationCertificate {
			data: profile.raw(),
		},
	)
	.1
}

/// Grants `beneficiary` the right to declare trusted keys for everybody.
/// Only meaningful when signed with a root key.
pub fn grant_declare_for_everybody(
	store: &Store,
	issuer: IdOf<Person>,
	key: &SignKeyPair,
	beneficiary: IdOf<Person>,
) -> HashOf<Signature> {
	sign_certificate(
		store,
		issuer,
		key,
		&RightToDeclareTrustedKeysForEverybodyCertificate { beneficiary },
	)
	.1
}

/// Grants `beneficiary` the right to affirm their own keys.
pub fn grant_declare_for_self(
	store: &Store,
	issuer: IdOf<Person>,
	key: &SignKeyPair,
	beneficiary: IdOf<Person>,
) -> HashOf<Signature> {
	sign_certificate(
		store,
		issuer,
		key,
		&RightToDeclareTrustedKeysForSelfCertificate { beneficiary },
	)
	.1
}

#[cfg(test)]
mod test {
	use super::*;
	use weft_objects::{content_hash, VersionedObject};

	#[test]
	fn test_signature_binds_certificate_to_issuer() {
		let store = Store::new();
		let issuer = Person {
			email: "issuer@example.com".into(),
		}
		.id_hash();
		let pair = SignKeyPair::generate();
		let profile_hash: HashOf<Profile> =
			HashOf::from_raw(weft_common::RawHash::digest(b"profile"));

		let (cert_hash, sig_hash) = sign_certificate(
			&store,
			issuer,
			&pair,
			&TrustKeysCertificate {
				profile: profile_hash,
			},
		);
		let signature: Signature = store.get(sig_hash).unwrap();
		assert_eq!(signature.issuer, issuer);
		assert_eq!(signature.data, cert_hash.raw());
		assert!(signature.verify_with(&pair.public()));

		// The stored certificate hash matches the content hash.
		let cert: TrustKeysCertificate = store.get(cert_hash).unwrap();
		assert_eq!(content_hash(&cert), cert_hash);
	}
}
