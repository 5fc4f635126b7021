//! Local key storage.
//!
//! Keys here are "complete": the private half is present. The keychain is
//! keyed by the untyped id hash of the owning person or instance so that it
//! stays independent of the object model. The first keypair registered for an
//! owner is that owner's default.

use std::collections::HashMap;
use std::sync::Mutex;

use weft_common::RawHash;

use crate::keys::{EncryptionKeyPair, PublicSignKey, SignKeyPair};
use crate::CryptoApi;

#[derive(Default)]
struct KeychainInner {
	sign: HashMap<RawHash, Vec<SignKeyPair>>,
	encryption: HashMap<RawHash, Vec<EncryptionKeyPair>>,
}

#[derive(Default)]
pub struct Keychain {
	inner: Mutex<KeychainInner>,
}

impl Keychain {
	pub fn new() -> Self {
		Self::default()
	}

	/// Generates and registers a fresh keypair set for `owner`, returning a
	/// [`CryptoApi`] bound to it.
	pub fn create_keys(&self, owner: RawHash) -> CryptoApi {
		let sign = SignKeyPair::generate();
		let encryption = EncryptionKeyPair::generate();
		self.register_keys(owner, sign.clone(), encryption.clone());
		CryptoApi::new(encryption, sign)
	}

	pub fn register_keys(
		&self,
		owner: RawHash,
		sign: SignKeyPair,
		encryption: EncryptionKeyPair,
	) {
		let mut inner = self.inner.lock().expect("poisoned");
		inner.sign.entry(owner).or_default().push(sign);
		inner.encryption.entry(owner).or_default().push(encryption);
	}

	/// The default (first-registered) keypairs of `owner`, as a
	/// [`CryptoApi`].
	pub fn crypto_api(&self, owner: RawHash) -> Option<CryptoApi> {
		let inner = self.inner.lock().expect("poisoned");
		let sign = inner.sign.get(&owner)?.first()?.clone();
		let encryption = inner.encryption.get(&owner)?.first()?.clone();
		Some(CryptoApi::new(encryption, sign))
	}

	pub fn default_sign_key(&self, owner: RawHash) -> Option<SignKeyPair> {
		let inner = self.inner.lock().expect("poisoned");
		inner.sign.get(&owner)?.first().cloned()
	}

	/// Whether the private half of `key` is present, for any owner.
	pub fn has_complete_sign_key(&self, key: &PublicSignKey) -> bool {
		let inner = self.inner.lock().expect("poisoned");
		inner
			.sign
			.values()
			.flatten()
			.any(|pair| pair.public() == *key)
	}

	/// All public sign keys whose private halves are present.
	pub fn complete_sign_keys(&self) -> Vec<PublicSignKey> {
		let inner = self.inner.lock().expect("poisoned");
		inner
			.sign
			.values()
			.flatten()
			.map(|pair| pair.public())
			.collect()
	}
}

impl std::fmt::Debug for Keychain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.lock().expect("poisoned");
		f.debug_struct("Keychain")
			.field("owners", &inner.sign.len())
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_create_and_lookup() {
		let keychain = Keychain::new();
		let owner = RawHash::digest(b"owner");
		let api = keychain.create_keys(owner);

		let found = keychain.crypto_api(owner).unwrap();
		assert_eq!(found.public_sign_key(), api.public_sign_key());
		assert_eq!(found.public_encryption_key(), api.public_encryption_key());

		assert!(keychain.has_complete_sign_key(&api.public_sign_key()));
		assert!(!keychain.has_complete_sign_key(&SignKeyPair::generate().public()));
	}

	#[test]
	fn test_default_is_first_registered() {
		let keychain = Keychain::new();
		let owner = RawHash::digest(b"owner");
		let first = keychain.create_keys(owner);
		let _second = keychain.create_keys(owner);

		assert_eq!(
			keychain.crypto_api(owner).unwrap().public_sign_key(),
			first.public_sign_key()
		);
		assert_eq!(keychain.complete_sign_keys().len(), 2);
	}
}
