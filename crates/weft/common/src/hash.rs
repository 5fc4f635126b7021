//! Opaque 256-bit references into the content-addressed store.
//!
//! Two flavors exist: [`HashOf<T>`] identifies one immutable object by the
//! hash of its full content, [`IdOf<T>`] identifies a *versioned* object by
//! the hash of its type-declared id fields only. Both carry the referenced
//! type as a phantom parameter so the store API can hand back the right
//! variant without runtime casts.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use sha2::{Digest, Sha256};

/// Length in bytes of every hash in the system.
pub const HASH_LEN: usize = 32;

/// An untyped 256-bit hash. The typed wrappers below deref to this for
/// comparisons that cross type boundaries (e.g. merge tie-breaks).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawHash([u8; HASH_LEN]);

impl RawHash {
	pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
		Self(bytes)
	}

	/// Sha256 of `data`.
	pub fn digest(data: &[u8]) -> Self {
		let digest = Sha256::digest(data);
		Self(digest.into())
	}

	pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn from_hex(s: &str) -> Result<Self, ParseHashError> {
		let bytes = hex::decode(s)?;
		let bytes: [u8; HASH_LEN] = bytes
			.try_into()
			.map_err(|b: Vec<u8>| ParseHashError::InvalidLen(b.len()))?;
		Ok(Self(bytes))
	}
}

impl fmt::Display for RawHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl fmt::Debug for RawHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "RawHash({})", self.to_hex())
	}
}

impl serde::Serialize for RawHash {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> serde::Deserialize<'de> for RawHash {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

/// An error when parsing a hex-encoded hash.
#[derive(thiserror::Error, Debug)]
pub enum ParseHashError {
	#[error("expected hex encoding")]
	InvalidHex(#[from] hex::FromHexError),
	#[error("expected length of {HASH_LEN}, got length of {0}")]
	InvalidLen(usize),
}

macro_rules! typed_hash {
	{$(
		$(#[$meta:meta])*
		$vis:vis struct $ident:ident;
	)*} => {$(
		$(#[$meta])*
		$vis struct $ident<T: ?Sized>(RawHash, PhantomData<fn() -> T>);

		impl<T: ?Sized> $ident<T> {
			pub fn from_raw(raw: RawHash) -> Self {
				Self(raw, PhantomData)
			}

			pub fn raw(&self) -> RawHash {
				self.0
			}

			pub fn to_hex(&self) -> String {
				self.0.to_hex()
			}

			pub fn from_hex(s: &str) -> Result<Self, ParseHashError> {
				RawHash::from_hex(s).map(Self::from_raw)
			}
		}

		// Manual impls: derives would bound `T` even though only
		// `PhantomData` mentions it.
		impl<T: ?Sized> Clone for $ident<T> {
			fn clone(&self) -> Self {
				*self
			}
		}

		impl<T: ?Sized> Copy for $ident<T> {}

		impl<T: ?Sized> PartialEq for $ident<T> {
			fn eq(&self, other: &Self) -> bool {
				self.0 == other.0
			}
		}

		impl<T: ?Sized> Eq for $ident<T> {}

		impl<T: ?Sized> PartialOrd for $ident<T> {
			fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
				Some(self.cmp(other))
			}
		}

		impl<T: ?Sized> Ord for $ident<T> {
			fn cmp(&self, other: &Self) -> Ordering {
				self.0.cmp(&other.0)
			}
		}

		impl<T: ?Sized> Hash for $ident<T> {
			fn hash<H: Hasher>(&self, state: &mut H) {
				self.0.hash(state);
			}
		}

		impl<T: ?Sized> fmt::Display for $ident<T> {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				self.0.fmt(f)
			}
		}

		impl<T: ?Sized> fmt::Debug for $ident<T> {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($ident), self.0.to_hex())
			}
		}

		impl<T: ?Sized> serde::Serialize for $ident<T> {
			fn serialize<S: serde::Serializer>(
				&self,
				serializer: S,
			) -> Result<S::Ok, S::Error> {
				self.0.serialize(serializer)
			}
		}

		impl<'de, T: ?Sized> serde::Deserialize<'de> for $ident<T> {
			fn deserialize<D: serde::Deserializer<'de>>(
				deserializer: D,
			) -> Result<Self, D::Error> {
				RawHash::deserialize(deserializer).map(Self::from_raw)
			}
		}
	)*}
}

typed_hash! {
	/// Content hash of a `T`: sha256 over the canonicalized object.
	pub struct HashOf;

	/// Id hash of a versioned `T`: sha256 over the type tag and the
	/// type-declared id fields only. All versions of one object share it.
	pub struct IdOf;
}

#[cfg(test)]
mod test {
	use super::*;

	struct Marker;

	#[test]
	fn test_digest_round_trip() {
		let h = RawHash::digest(b"hello");
		let parsed = RawHash::from_hex(&h.to_hex()).unwrap();
		assert_eq!(h, parsed);
	}

	#[test]
	fn test_rejects_wrong_length() {
		assert!(matches!(
			RawHash::from_hex("abcd"),
			Err(ParseHashError::InvalidLen(2))
		));
		assert!(matches!(
			RawHash::from_hex("zz"),
			Err(ParseHashError::InvalidHex(_))
		));
	}

	#[test]
	fn test_typed_hash_is_transparent() {
		let raw = RawHash::digest(b"x");
		let typed: HashOf<Marker> = HashOf::from_raw(raw);
		assert_eq!(typed.raw(), raw);
		assert_eq!(typed.to_hex(), raw.to_hex());

		let json = serde_json::to_string(&typed).unwrap();
		assert_eq!(json, format!("\"{}\"", raw.to_hex()));
		let back: HashOf<Marker> = serde_json::from_str(&json).unwrap();
		assert_eq!(back, typed);
	}

	#[test]
	fn test_ordering_matches_raw_bytes() {
		let a = RawHash::from_bytes([0u8; HASH_LEN]);
		let b = RawHash::from_bytes([1u8; HASH_LEN]);
		assert!(a < b);
		assert!(HashOf::<Marker>::from_raw(a) < HashOf::<Marker>::from_raw(b));
	}
}
