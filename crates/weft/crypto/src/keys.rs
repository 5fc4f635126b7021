//! Key representations.
//!
//! Public keys are plain 32-byte values with hex serde, so they can appear
//! verbatim in stored objects and wire messages. Keypairs wrap the dalek
//! types and never expose the private half.

use std::fmt;

use rand::rngs::OsRng;

/// Length in bytes of every public key.
pub const KEY_LEN: usize = 32;

/// Length in bytes of a detached Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

macro_rules! public_key {
	{$(
		$(#[$meta:meta])*
		pub struct $ident:ident;
	)*} => {$(
		$(#[$meta])*
		#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
		pub struct $ident([u8; KEY_LEN]);

		impl $ident {
			pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
				Self(bytes)
			}

			pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
				&self.0
			}

			pub fn to_hex(&self) -> String {
				hex::encode(self.0)
			}

			pub fn from_hex(s: &str) -> Result<Self, ParseKeyError> {
				let bytes = hex::decode(s)?;
				let bytes: [u8; KEY_LEN] = bytes
					.try_into()
					.map_err(|b: Vec<u8>| ParseKeyError::InvalidLen(b.len()))?;
				Ok(Self(bytes))
			}
		}

		impl fmt::Display for $ident {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.to_hex())
			}
		}

		impl fmt::Debug for $ident {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($ident), self.to_hex())
			}
		}

		impl serde::Serialize for $ident {
			fn serialize<S: serde::Serializer>(
				&self,
				serializer: S,
			) -> Result<S::Ok, S::Error> {
				serializer.serialize_str(&self.to_hex())
			}
		}

		impl<'de> serde::Deserialize<'de> for $ident {
			fn deserialize<D: serde::Deserializer<'de>>(
				deserializer: D,
			) -> Result<Self, D::Error> {
				let s = String::deserialize(deserializer)?;
				Self::from_hex(&s).map_err(serde::de::Error::custom)
			}
		}
	)*}
}

public_key! {
	/// An Ed25519 verifying key.
	pub struct PublicSignKey;

	/// An X25519 public key.
	pub struct PublicEncryptionKey;
}

/// An error when parsing a hex-encoded key.
#[derive(thiserror::Error, Debug)]
pub enum ParseKeyError {
	#[error("expected hex encoding")]
	InvalidHex(#[from] hex::FromHexError),
	#[error("expected length of {KEY_LEN}, got length of {0}")]
	InvalidLen(usize),
}

/// A detached Ed25519 signature, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes([u8; SIGNATURE_LEN]);

impl SignatureBytes {
	pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn from_hex(s: &str) -> Result<Self, ParseKeyError> {
		let bytes = hex::decode(s)?;
		let bytes: [u8; SIGNATURE_LEN] = bytes
			.try_into()
			.map_err(|b: Vec<u8>| ParseKeyError::InvalidLen(b.len()))?;
		Ok(Self(bytes))
	}
}

impl fmt::Debug for SignatureBytes {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "SignatureBytes({})", self.to_hex())
	}
}

impl serde::Serialize for SignatureBytes {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> serde::Deserialize<'de> for SignatureBytes {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

/// An Ed25519 keypair. Signing side of a device or person identity.
#[derive(Clone)]
pub struct SignKeyPair {
	secret: ed25519_dalek::SigningKey,
}

impl SignKeyPair {
	pub fn generate() -> Self {
		Self {
			secret: ed25519_dalek::SigningKey::generate(&mut OsRng),
		}
	}

	pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
		Self {
			secret: ed25519_dalek::SigningKey::from_bytes(&seed),
		}
	}

	pub fn public(&self) -> PublicSignKey {
		PublicSignKey::from_bytes(self.secret.verifying_key().to_bytes())
	}

	pub fn sign(&self, message: &[u8]) -> SignatureBytes {
		use ed25519_dalek::Signer;
		SignatureBytes::from_bytes(self.secret.sign(message).to_bytes())
	}
}

impl fmt::Debug for SignKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Never print the private half.
		f.debug_struct("SignKeyPair")
			.field("public", &self.public())
			.finish()
	}
}

/// Verifies a detached signature. Returns `false` for malformed keys as well
/// as for mismatching signatures.
pub fn verify_signature(
	key: &PublicSignKey,
	message: &[u8],
	signature: &SignatureBytes,
) -> bool {
	let Ok(verifying) = ed25519_dalek::VerifyingKey::from_bytes(key.as_bytes()) else {
		return false;
	};
	let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
	verifying.verify_strict(message, &signature).is_ok()
}

/// An X25519 keypair. Encryption side of a device or person identity.
#[derive(Clone)]
pub struct EncryptionKeyPair {
	secret: x25519_dalek::StaticSecret,
}

impl EncryptionKeyPair {
	pub fn generate() -> Self {
		Self {
			secret: x25519_dalek::StaticSecret::random_from_rng(OsRng),
		}
	}

	pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
		Self {
			secret: x25519_dalek::StaticSecret::from(seed),
		}
	}

	pub fn public(&self) -> PublicEncryptionKey {
		PublicEncryptionKey::from_bytes(
			x25519_dalek::PublicKey::from(&self.secret).to_bytes(),
		)
	}

	pub(crate) fn diffie_hellman(&self, remote: &PublicEncryptionKey) -> [u8; KEY_LEN] {
		let remote = x25519_dalek::PublicKey::from(*remote.as_bytes());
		self.secret.diffie_hellman(&remote).to_bytes()
	}
}

impl fmt::Debug for EncryptionKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EncryptionKeyPair")
			.field("public", &self.public())
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_sign_and_verify() {
		let pair = SignKeyPair::generate();
		let sig = pair.sign(b"payload");
		assert!(verify_signature(&pair.public(), b"payload", &sig));
		assert!(!verify_signature(&pair.public(), b"other", &sig));

		let other = SignKeyPair::generate();
		assert!(!verify_signature(&other.public(), b"payload", &sig));
	}

	#[test]
	fn test_key_hex_round_trip() {
		let pair = EncryptionKeyPair::generate();
		let public = pair.public();
		assert_eq!(
			PublicEncryptionKey::from_hex(&public.to_hex()).unwrap(),
			public
		);
	}

	#[test]
	fn test_signature_hex_round_trip() {
		let sig = SignKeyPair::generate().sign(b"x");
		assert_eq!(SignatureBytes::from_hex(&sig.to_hex()).unwrap(), sig);
	}
}
