//! The identity layer: who do we know, how do we reach them, and which of
//! their keys do we trust.
//!
//! [`LeuteModel`] manages the leute root object, someones and profiles on
//! top of the store. [`TrustedKeysResolver`] decides whether a public sign
//! key is trusted by recursively verifying certificates issued by keys
//! whose trust was already established, seeded by the local root keys.

pub mod certify;
mod leute;
mod resolver;

pub use self::leute::{InstanceEndpointInfo, LeuteModel};
pub use self::resolver::{
	KeyTrustInfo, RootKeyMode, TrustSource, TrustedKeysResolver,
};

use weft_store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum TrustError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("no leute root object exists yet")]
	NoLeuteRoot,
	#[error("someone {0} is not known")]
	UnknownSomeone(String),
	#[error("no local keys for {0}")]
	MissingKeys(String),
}
