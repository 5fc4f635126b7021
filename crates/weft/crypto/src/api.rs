//! Sealed boxes with an embedded nonce.
//!
//! Wire layout: `nonce (12 bytes) || chacha20-poly1305 ciphertext`. The
//! symmetric key is derived from the X25519 shared secret by hashing it
//! together with a fixed domain separator, so the raw DH output never leaves
//! this module.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};

use crate::keys::{
	EncryptionKeyPair, PublicEncryptionKey, PublicSignKey, SignKeyPair, SignatureBytes,
	KEY_LEN,
};
use crate::CryptoError;

/// Nonce length of ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

const KEY_DOMAIN: &[u8] = b"weft.box.v1";

/// A derived symmetric key for one peer pair (or one connection).
#[derive(Clone, Copy)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self(bytes)
	}
}

impl std::fmt::Debug for SymmetricKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SymmetricKey").finish_non_exhaustive()
	}
}

/// Encrypts `plaintext` under `key`, prepending a random nonce.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Vec<u8> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
	let nonce_bytes = crate::random_bytes(NONCE_LEN);
	let nonce = Nonce::from_slice(&nonce_bytes);
	let ciphertext = cipher
		.encrypt(nonce, plaintext)
		.expect("chacha20-poly1305 encryption is infallible for in-memory buffers");

	let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
	out.extend_from_slice(&nonce_bytes);
	out.extend_from_slice(&ciphertext);
	out
}

/// Reverses [`seal`].
pub fn open(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
	if data.len() < NONCE_LEN {
		return Err(CryptoError::TruncatedCiphertext);
	}
	let (nonce, ciphertext) = data.split_at(NONCE_LEN);
	let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
	cipher
		.decrypt(Nonce::from_slice(nonce), ciphertext)
		.map_err(|_| CryptoError::DecryptionFailed)
}

/// One identity's view of the crypto primitives: an encryption keypair plus a
/// signing keypair, with all peer-directed operations taking the remote
/// public key explicitly.
#[derive(Clone, Debug)]
pub struct CryptoApi {
	encryption: EncryptionKeyPair,
	signing: SignKeyPair,
}

impl CryptoApi {
	pub fn new(encryption: EncryptionKeyPair, signing: SignKeyPair) -> Self {
		Self {
			encryption,
			signing,
		}
	}

	pub fn generate() -> Self {
		Self::new(EncryptionKeyPair::generate(), SignKeyPair::generate())
	}

	pub fn public_encryption_key(&self) -> PublicEncryptionKey {
		self.encryption.public()
	}

	pub fn public_sign_key(&self) -> PublicSignKey {
		self.signing.public()
	}

	/// The symmetric key shared with `remote`, usable for a whole connection.
	pub fn derive_shared_key(&self, remote: &PublicEncryptionKey) -> SymmetricKey {
		let shared = self.encryption.diffie_hellman(remote);
		let mut hasher = Sha256::new();
		hasher.update(KEY_DOMAIN);
		hasher.update(shared);
		SymmetricKey(hasher.finalize().into())
	}

	pub fn encrypt_and_embed_nonce(
		&self,
		plaintext: &[u8],
		remote: &PublicEncryptionKey,
	) -> Vec<u8> {
		seal(&self.derive_shared_key(remote), plaintext)
	}

	pub fn decrypt_with_embedded_nonce(
		&self,
		data: &[u8],
		remote: &PublicEncryptionKey,
	) -> Result<Vec<u8>, CryptoError> {
		open(&self.derive_shared_key(remote), data)
	}

	pub fn sign(&self, message: &[u8]) -> SignatureBytes {
		self.signing.sign(message)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_box_round_trip() {
		let alice = CryptoApi::generate();
		let bob = CryptoApi::generate();

		let sealed =
			alice.encrypt_and_embed_nonce(b"hello bob", &bob.public_encryption_key());
		let opened = bob
			.decrypt_with_embedded_nonce(&sealed, &alice.public_encryption_key())
			.unwrap();
		assert_eq!(opened, b"hello bob");
	}

	#[test]
	fn test_wrong_recipient_fails() {
		let alice = CryptoApi::generate();
		let bob = CryptoApi::generate();
		let eve = CryptoApi::generate();

		let sealed = alice.encrypt_and_embed_nonce(b"secret", &bob.public_encryption_key());
		assert!(matches!(
			eve.decrypt_with_embedded_nonce(&sealed, &alice.public_encryption_key()),
			Err(CryptoError::DecryptionFailed)
		));
	}

	#[test]
	fn test_truncated_ciphertext() {
		let alice = CryptoApi::generate();
		let bob = CryptoApi::generate();
		assert!(matches!(
			bob.decrypt_with_embedded_nonce(&[0u8; 4], &alice.public_encryption_key()),
			Err(CryptoError::TruncatedCiphertext)
		));
	}

	#[test]
	fn test_distinct_nonces() {
		let key = SymmetricKey::from_bytes([7u8; KEY_LEN]);
		let a = seal(&key, b"same plaintext");
		let b = seal(&key, b"same plaintext");
		assert_ne!(a, b);
		assert_eq!(open(&key, &a).unwrap(), open(&key, &b).unwrap());
	}
}
