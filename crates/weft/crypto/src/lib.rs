//! Thin facade over the crypto primitives the runtime needs: Ed25519
//! signatures, X25519 + ChaCha20-Poly1305 sealed boxes with an embedded
//! nonce, and a keychain for the locally held private halves.
//!
//! No primitive is defined here; this crate only pins down key
//! representations and the exact framing of sealed boxes so that every peer
//! agrees on them.

mod api;
mod keychain;
mod keys;

pub use self::api::{open, seal, CryptoApi, SymmetricKey, NONCE_LEN};
pub use self::keychain::Keychain;
pub use self::keys::{
	verify_signature, EncryptionKeyPair, ParseKeyError, PublicEncryptionKey,
	PublicSignKey, SignKeyPair, SignatureBytes, KEY_LEN, SIGNATURE_LEN,
};

use rand::RngCore;

/// An error during decryption or key handling.
#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
	#[error("ciphertext too short to carry an embedded nonce")]
	TruncatedCiphertext,
	#[error("decryption failed (wrong key or corrupted ciphertext)")]
	DecryptionFailed,
	#[error("signature verification failed")]
	BadSignature,
}

/// `n` bytes from the OS random number generator.
pub fn random_bytes(n: usize) -> Vec<u8> {
	let mut bytes = vec![0u8; n];
	rand::rngs::OsRng.fill_bytes(&mut bytes);
	bytes
}
