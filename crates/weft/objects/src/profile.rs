//! Profiles: what one observer knows about one person.
//!
//! The endpoint and description lists are bags: merging unions them by
//! content equality, each element appearing at most once. This makes
//! concurrent profile versions mergeable without CRDT metadata, because the
//! only operations are additions.

use serde::{Deserialize, Serialize};
use weft_common::{HashOf, IdOf};

use crate::person::{Instance, Keys, Person};
use crate::{digest_id_fields, Storable, VersionedObject};

/// A way to reach a person's instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommunicationEndpoint {
	/// A reachable device, with its published keys and (optionally) the
	/// relay or socket URL it listens on.
	InstanceEndpoint {
		person_id: IdOf<Person>,
		instance_id: IdOf<Instance>,
		person_keys: HashOf<Keys>,
		instance_keys: HashOf<Keys>,
		url: Option<String>,
	},
}

/// A statement about the person the profile describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PersonDescription {
	PersonName { name: String },
	/// A signing key attributed to the person. Trust decisions attach here.
	SignKey { key: weft_crypto::PublicSignKey },
}

/// A bag of endpoints and descriptions about `person_id`, as written by
/// `owner`. One logical profile exists per (subject, observer, label).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
	pub person_id: IdOf<Person>,
	pub owner: IdOf<Person>,
	pub profile_id: String,
	#[serde(default)]
	pub communication_endpoints: Vec<CommunicationEndpoint>,
	#[serde(default)]
	pub person_descriptions: Vec<PersonDescription>,
}

impl VersionedObject for Profile {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({
			"person_id": self.person_id,
			"owner": self.owner,
			"profile_id": self.profile_id,
		})
	}
}

impl Profile {
	/// The label of the profile every identity writes about itself.
	pub const DEFAULT: &'static str = "default";

	pub fn new(person_id: IdOf<Person>, owner: IdOf<Person>, profile_id: &str) -> Self {
		Self {
			person_id,
			owner,
			profile_id: profile_id.to_owned(),
			communication_endpoints: Vec::new(),
			person_descriptions: Vec::new(),
		}
	}

	pub fn id_hash_for(
		person_id: IdOf<Person>,
		owner: IdOf<Person>,
		profile_id: &str,
	) -> IdOf<Profile> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({
				"person_id": person_id,
				"owner": owner,
				"profile_id": profile_id,
			}),
		))
	}

	/// Adds `endpoint` unless an equal one is already present.
	pub fn add_endpoint(&mut self, endpoint: CommunicationEndpoint) -> bool {
		if self.communication_endpoints.contains(&endpoint) {
			return false;
		}
		self.communication_endpoints.push(endpoint);
		true
	}

	/// Adds `description` unless an equal one is already present.
	pub fn add_description(&mut self, description: PersonDescription) -> bool {
		if self.person_descriptions.contains(&description) {
			return false;
		}
		self.person_descriptions.push(description);
		true
	}

	/// Bag-union of another version of the same profile.
	///
	/// Returns `true` if anything was absorbed. Panics if `other` belongs to
	/// a different logical profile; versions of distinct profiles must never
	/// be merged.
	pub fn merge_from(&mut self, other: &Profile) -> bool {
		assert_eq!(
			self.id_hash(),
			other.id_hash(),
			"merge of unrelated profiles"
		);
		let mut changed = false;
		for endpoint in &other.communication_endpoints {
			changed |= self.add_endpoint(endpoint.clone());
		}
		for description in &other.person_descriptions {
			changed |= self.add_description(description.clone());
		}
		changed
	}

	/// The sign keys this profile attributes to its subject.
	pub fn sign_keys(&self) -> impl Iterator<Item = &weft_crypto::PublicSignKey> {
		self.person_descriptions.iter().filter_map(|d| match d {
			PersonDescription::SignKey { key } => Some(key),
			_ => None,
		})
	}
}
