//! Access grants on versioned objects.

use serde::{Deserialize, Serialize};
use weft_common::{IdOf, RawHash};

use crate::person::Person;
use crate::someone::Group;

/// Grants persons and groups access to the versioned object identified by
/// `object` (an id hash). The store indexes these by target so the grants on
/// an object can be listed without a full scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAccess {
	pub object: RawHash,
	#[serde(default)]
	pub persons: Vec<IdOf<Person>>,
	#[serde(default)]
	pub groups: Vec<IdOf<Group>>,
}
