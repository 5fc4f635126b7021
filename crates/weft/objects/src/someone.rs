//! Someones, groups and the leute root object.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use weft_common::IdOf;

use crate::person::Person;
use crate::profile::Profile;
use crate::{digest_id_fields, Storable, VersionedObject};

/// A container joining the person identities believed to belong to one
/// real-world person, with the profiles known for each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Someone {
	pub someone_id: String,
	pub main_profile: Option<IdOf<Profile>>,
	pub identities: BTreeMap<IdOf<Person>, BTreeSet<IdOf<Profile>>>,
}

impl VersionedObject for Someone {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "someone_id": self.someone_id })
	}
}

impl Someone {
	pub fn new(someone_id: &str) -> Self {
		Self {
			someone_id: someone_id.to_owned(),
			main_profile: None,
			identities: BTreeMap::new(),
		}
	}

	pub fn id_hash_for(someone_id: &str) -> IdOf<Someone> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({ "someone_id": someone_id }),
		))
	}

	pub fn attach_profile(&mut self, person: IdOf<Person>, profile: IdOf<Profile>) -> bool {
		self.identities.entry(person).or_default().insert(profile)
	}

	pub fn persons(&self) -> impl Iterator<Item = IdOf<Person>> + '_ {
		self.identities.keys().copied()
	}

	pub fn profiles(&self) -> impl Iterator<Item = IdOf<Profile>> + '_ {
		self.identities.values().flatten().copied()
	}

	/// Union with a concurrent version. `main_profile` keeps the local value
	/// unless it was unset.
	pub fn merge_from(&mut self, other: &Someone) -> bool {
		assert_eq!(self.someone_id, other.someone_id, "merge of unrelated someones");
		let mut changed = false;
		for (person, profiles) in &other.identities {
			for profile in profiles {
				changed |= self.attach_profile(*person, *profile);
			}
		}
		if self.main_profile.is_none() && other.main_profile.is_some() {
			self.main_profile = other.main_profile;
			changed = true;
		}
		changed
	}
}

/// A named set of persons, e.g. for bulk access grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
	pub name: String,
	pub members: Vec<IdOf<Person>>,
}

impl VersionedObject for Group {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "name": self.name })
	}
}

impl Group {
	pub fn id_hash_for(name: &str) -> IdOf<Group> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({ "name": name }),
		))
	}
}

/// The singleton index of all known someones and groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leute {
	pub app_id: String,
	pub me: IdOf<Someone>,
	pub other: Vec<IdOf<Someone>>,
	pub group: Vec<IdOf<Group>>,
}

impl VersionedObject for Leute {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "app_id": self.app_id })
	}
}

impl Leute {
	pub const APP_ID: &'static str = "one.leute";

	pub fn new(me: IdOf<Someone>) -> Self {
		Self {
			app_id: Self::APP_ID.to_owned(),
			me,
			other: Vec::new(),
			group: Vec::new(),
		}
	}

	pub fn singleton_id_hash() -> IdOf<Leute> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({ "app_id": Self::APP_ID }),
		))
	}

	pub fn add_other(&mut self, someone: IdOf<Someone>) -> bool {
		if self.other.contains(&someone) {
			return false;
		}
		self.other.push(someone);
		true
	}

	pub fn add_group(&mut self, group: IdOf<Group>) -> bool {
		if self.group.contains(&group) {
			return false;
		}
		self.group.push(group);
		true
	}

	/// All someones including `me`.
	pub fn someones(&self) -> impl Iterator<Item = IdOf<Someone>> + '_ {
		std::iter::once(self.me).chain(self.other.iter().copied())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_someone_merge() {
		let pa = Person::id_hash_for("a@example.com");
		let pb = Person::id_hash_for("b@example.com");
		let prof_a = Profile::id_hash_for(pa, pa, Profile::DEFAULT);
		let prof_b = Profile::id_hash_for(pb, pa, Profile::DEFAULT);

		let mut left = Someone::new("s1");
		left.attach_profile(pa, prof_a);
		let mut right = Someone::new("s1");
		right.attach_profile(pb, prof_b);
		right.main_profile = Some(prof_b);

		assert!(left.merge_from(&right));
		assert_eq!(left.persons().count(), 2);
		assert_eq!(left.main_profile, Some(prof_b));

		// Merge keeps an already-set main profile.
		let mut third = Someone::new("s1");
		third.main_profile = Some(prof_a);
		assert!(!left.merge_from(&third) || left.main_profile == Some(prof_b));
		assert_eq!(left.main_profile, Some(prof_b));
	}

	#[test]
	fn test_leute_membership_is_a_set() {
		let me = Someone::id_hash_for("me");
		let peer = Someone::id_hash_for("peer");
		let mut leute = Leute::new(me);
		assert!(leute.add_other(peer));
		assert!(!leute.add_other(peer));
		assert_eq!(leute.someones().count(), 2);
	}
}
