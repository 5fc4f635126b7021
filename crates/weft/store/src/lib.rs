//! The content-addressed versioned object store.
//!
//! The runtime treats the store as an external collaborator; this crate pins
//! down the API it programs against and ships the in-memory implementation
//! used by the tests and demos. Semantics that the rest of the system relies
//! on:
//!
//! - unversioned objects are immutable and keyed by content hash,
//! - versioned objects accumulate a per-id-hash version list; re-putting a
//!   value identical to the current head is a no-op (`created == false`),
//! - storing an [`IdAccess`] additionally indexes it by target id hash,
//! - every *new* version fires the global [`Store::on_versioned_object`]
//!   hook. Listeners run synchronously on the writing task and must not
//!   write back into the store; hand work to a task instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::trace;
use weft_common::{Event, HashOf, IdOf, RawHash};
use weft_objects::{
	content_hash_raw, IdAccess, Object, ObjectType, Storable, VersionedObject,
};

/// An error from the store. Operations fail, the process continues.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("object {0} not found")]
	NotFound(RawHash),
	#[error("no versions stored for id {0}")]
	IdNotFound(RawHash),
	#[error("version {index} of {id} does not exist")]
	NoSuchVersion { id: RawHash, index: u64 },
	#[error("expected a {expected}, found a {actual}")]
	TypeMismatch {
		expected: ObjectType,
		actual: ObjectType,
	},
}

/// Outcome of [`Store::put_versioned`].
#[derive(Debug, Clone, Copy)]
pub struct PutResult<T: ?Sized> {
	pub id_hash: IdOf<T>,
	pub hash: HashOf<T>,
	/// Index of this content in the version list.
	pub version_index: u64,
	/// False when the identical content was already the current head.
	pub created: bool,
}

/// Fired for every new version of a versioned object.
#[derive(Debug, Clone)]
pub struct VersionedObjectEvent {
	pub object_type: ObjectType,
	pub id_hash: RawHash,
	pub hash: RawHash,
	pub version_index: u64,
}

struct VersionList {
	object_type: ObjectType,
	versions: Vec<RawHash>,
}

#[derive(Default)]
struct StoreInner {
	objects: RwLock<HashMap<RawHash, Object>>,
	versions: RwLock<HashMap<RawHash, VersionList>>,
	access_index: RwLock<HashMap<RawHash, Vec<RawHash>>>,
	on_versioned_object: Event<VersionedObjectEvent>,
}

/// Handle to one store. Cheap to clone.
#[derive(Clone, Default)]
pub struct Store {
	inner: Arc<StoreInner>,
}

impl Store {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stores an immutable object, returning its content hash.
	pub fn put_unversioned<T: Storable>(&self, obj: &T) -> HashOf<T> {
		HashOf::from_raw(self.put_object(&obj.clone().into_object()))
	}

	/// Type-erased variant of [`Store::put_unversioned`], for payloads whose
	/// concrete type only the caller's caller knows (channel posts).
	pub fn put_object(&self, object: &Object) -> RawHash {
		let hash = content_hash_raw(object);

		if let Object::IdAccess(access) = object {
			let mut index = self.inner.access_index.write().expect("poisoned");
			let grants = index.entry(access.object).or_default();
			if !grants.contains(&hash) {
				grants.push(hash);
			}
		}

		self.inner
			.objects
			.write()
			.expect("poisoned")
			.insert(hash, object.clone());
		hash
	}

	/// Loads an object by content hash, checking its type tag.
	pub fn get<T: Storable>(&self, hash: HashOf<T>) -> Result<T, StoreError> {
		let object = self.get_object(hash.raw())?;
		let actual = object.object_type();
		T::from_object(object).ok_or(StoreError::TypeMismatch {
			expected: T::TYPE,
			actual,
		})
	}

	pub fn get_object(&self, hash: RawHash) -> Result<Object, StoreError> {
		self.inner
			.objects
			.read()
			.expect("poisoned")
			.get(&hash)
			.cloned()
			.ok_or(StoreError::NotFound(hash))
	}

	pub fn has(&self, hash: RawHash) -> bool {
		self.inner.objects.read().expect("poisoned").contains_key(&hash)
	}

	/// Stores a new version of a versioned object.
	///
	/// Appends to the id's version list unless the content hash equals the
	/// current head, and fires the versioned-object hook for every appended
	/// version.
	pub fn put_versioned<T: VersionedObject>(&self, obj: &T) -> PutResult<T> {
		let id_hash = obj.id_hash();
		let object = obj.clone().into_object();
		let hash = content_hash_raw(&object);

		let result = {
			let mut versions = self.inner.versions.write().expect("poisoned");
			let list = versions.entry(id_hash.raw()).or_insert_with(|| VersionList {
				object_type: T::TYPE,
				versions: Vec::new(),
			});
			if list.versions.last() == Some(&hash) {
				PutResult {
					id_hash,
					hash: HashOf::from_raw(hash),
					version_index: list.versions.len() as u64 - 1,
					created: false,
				}
			} else {
				self.inner
					.objects
					.write()
					.expect("poisoned")
					.insert(hash, object);
				list.versions.push(hash);
				PutResult {
					id_hash,
					hash: HashOf::from_raw(hash),
					version_index: list.versions.len() as u64 - 1,
					created: true,
				}
			}
		};

		if result.created {
			trace!(
				ty = %T::TYPE,
				id = %result.id_hash,
				index = result.version_index,
				"stored new object version"
			);
			self.inner.on_versioned_object.emit(&VersionedObjectEvent {
				object_type: T::TYPE,
				id_hash: id_hash.raw(),
				hash,
				version_index: result.version_index,
			});
		}
		result
	}

	/// The current (latest) version of `id`.
	pub fn current_version<T: VersionedObject>(&self, id: IdOf<T>) -> Result<T, StoreError> {
		self.get(self.current_version_hash(id)?)
	}

	pub fn current_version_hash<T: VersionedObject>(
		&self,
		id: IdOf<T>,
	) -> Result<HashOf<T>, StoreError> {
		let versions = self.inner.versions.read().expect("poisoned");
		let list = versions
			.get(&id.raw())
			.ok_or(StoreError::IdNotFound(id.raw()))?;
		let hash = list
			.versions
			.last()
			.expect("version lists are never empty");
		Ok(HashOf::from_raw(*hash))
	}

	/// Number of stored versions; zero when the id is unknown.
	pub fn version_count(&self, id: RawHash) -> u64 {
		self.inner
			.versions
			.read()
			.expect("poisoned")
			.get(&id)
			.map(|list| list.versions.len() as u64)
			.unwrap_or(0)
	}

	pub fn version_hash_at<T: VersionedObject>(
		&self,
		id: IdOf<T>,
		index: u64,
	) -> Result<HashOf<T>, StoreError> {
		let versions = self.inner.versions.read().expect("poisoned");
		let list = versions
			.get(&id.raw())
			.ok_or(StoreError::IdNotFound(id.raw()))?;
		list.versions
			.get(index as usize)
			.map(|hash| HashOf::from_raw(*hash))
			.ok_or(StoreError::NoSuchVersion {
				id: id.raw(),
				index,
			})
	}

	pub fn version_at<T: VersionedObject>(
		&self,
		id: IdOf<T>,
		index: u64,
	) -> Result<T, StoreError> {
		self.get(self.version_hash_at(id, index)?)
	}

	/// All version hashes of `id`, oldest first.
	pub fn version_hashes<T: VersionedObject>(&self, id: IdOf<T>) -> Vec<HashOf<T>> {
		let versions = self.inner.versions.read().expect("poisoned");
		versions
			.get(&id.raw())
			.map(|list| {
				list.versions
					.iter()
					.map(|hash| HashOf::from_raw(*hash))
					.collect()
			})
			.unwrap_or_default()
	}

	/// Id hashes of every versioned object of `ty`. Scan API for the cache
	/// builders (profiles, channels).
	pub fn ids_of_type(&self, ty: ObjectType) -> Vec<RawHash> {
		let versions = self.inner.versions.read().expect("poisoned");
		versions
			.iter()
			.filter(|(_, list)| list.object_type == ty)
			.map(|(id, _)| *id)
			.collect()
	}

	/// Every stored unversioned object of type `T` (signatures,
	/// certificates). Versioned objects are not returned here.
	pub fn all_of_type<T: Storable>(&self) -> Vec<(HashOf<T>, T)> {
		let objects = self.inner.objects.read().expect("poisoned");
		objects
			.iter()
			.filter_map(|(hash, object)| {
				T::from_object(object.clone())
					.map(|obj| (HashOf::from_raw(*hash), obj))
			})
			.collect()
	}

	/// Removes one unversioned object (garbage collection hook). Dangling
	/// references are the caller's responsibility.
	pub fn remove_object(&self, hash: RawHash) -> bool {
		let removed = self
			.inner
			.objects
			.write()
			.expect("poisoned")
			.remove(&hash);
		if let Some(Object::IdAccess(access)) = &removed {
			let mut index = self.inner.access_index.write().expect("poisoned");
			if let Some(grants) = index.get_mut(&access.object) {
				grants.retain(|grant| grant != &hash);
			}
		}
		removed.is_some()
	}

	/// All access grants pointing at `target` (an id hash).
	pub fn accessors_of(&self, target: RawHash) -> Vec<IdAccess> {
		let index = self.inner.access_index.read().expect("poisoned");
		let Some(grants) = index.get(&target) else {
			return Vec::new();
		};
		let objects = self.inner.objects.read().expect("poisoned");
		grants
			.iter()
			.filter_map(|hash| match objects.get(hash) {
				Some(Object::IdAccess(access)) => Some(access.clone()),
				_ => None,
			})
			.collect()
	}

	/// Hook fired once per new version, after the version list is updated.
	pub fn on_versioned_object(&self) -> &Event<VersionedObjectEvent> {
		&self.inner.on_versioned_object
	}
}

impl std::fmt::Debug for Store {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Store")
			.field(
				"objects",
				&self.inner.objects.read().expect("poisoned").len(),
			)
			.field(
				"versioned_ids",
				&self.inner.versions.read().expect("poisoned").len(),
			)
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicU64, Ordering};
	use weft_objects::{ChannelInfo, Person, Profile};

	fn person(email: &str) -> Person {
		Person {
			email: email.into(),
		}
	}

	#[test]
	fn test_unversioned_round_trip_and_type_check() {
		let store = Store::new();
		let p = person("a@example.com");
		let hash = store.put_unversioned(&p);
		assert_eq!(store.get(hash).unwrap(), p);

		// Reading it back as the wrong type must fail.
		let as_profile: HashOf<Profile> = HashOf::from_raw(hash.raw());
		assert!(matches!(
			store.get(as_profile),
			Err(StoreError::TypeMismatch { .. })
		));
	}

	#[test]
	fn test_versioned_put_is_idempotent_on_identical_head() {
		let store = Store::new();
		let owner = person("o@example.com").id_hash();
		let info = ChannelInfo {
			id: "ch".into(),
			owner,
			head: None,
		};

		let first = store.put_versioned(&info);
		assert!(first.created);
		assert_eq!(first.version_index, 0);

		let second = store.put_versioned(&info);
		assert!(!second.created);
		assert_eq!(second.version_index, 0);
		assert_eq!(store.version_count(first.id_hash.raw()), 1);
	}

	#[test]
	fn test_version_accumulation_and_access() {
		let store = Store::new();
		let mut profile = Profile::new(
			person("s@example.com").id_hash(),
			person("o@example.com").id_hash(),
			Profile::DEFAULT,
		);
		let first = store.put_versioned(&profile);

		profile.add_description(weft_objects::PersonDescription::PersonName {
			name: "Sam".into(),
		});
		let second = store.put_versioned(&profile);
		assert_eq!(second.version_index, 1);
		assert_eq!(first.id_hash, second.id_hash);

		assert_eq!(store.version_count(first.id_hash.raw()), 2);
		assert_eq!(
			store.version_at(first.id_hash, 0).unwrap().person_descriptions.len(),
			0
		);
		assert_eq!(store.current_version(first.id_hash).unwrap(), profile);
		assert!(matches!(
			store.version_at(first.id_hash, 7),
			Err(StoreError::NoSuchVersion { index: 7, .. })
		));
	}

	#[test]
	fn test_versioned_hook_fires_per_new_version() {
		let store = Store::new();
		let seen = std::sync::Arc::new(AtomicU64::new(0));
		let seen1 = std::sync::Arc::clone(&seen);
		let _guard = store.on_versioned_object().subscribe(move |ev| {
			assert_eq!(ev.object_type, ObjectType::ChannelInfo);
			seen1.fetch_add(1, Ordering::SeqCst);
		});

		let owner = person("o@example.com").id_hash();
		let info = ChannelInfo {
			id: "ch".into(),
			owner,
			head: None,
		};
		store.put_versioned(&info);
		store.put_versioned(&info); // identical head, no event
		assert_eq!(seen.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_access_index() {
		let store = Store::new();
		let channel = ChannelInfo::id_hash_for("ch", person("o@example.com").id_hash());
		let grant = IdAccess {
			object: channel.raw(),
			persons: vec![person("p@example.com").id_hash()],
			groups: vec![],
		};
		store.put_unversioned(&grant);
		store.put_unversioned(&grant); // same content, indexed once

		let grants = store.accessors_of(channel.raw());
		assert_eq!(grants.len(), 1);
		assert_eq!(grants[0].persons, grant.persons);
		assert!(store.accessors_of(RawHash::digest(b"other")).is_empty());
	}
}
