//! The leute model: someones, profiles and how to reach them.
//!
//! Profiles and someones are merged with bag semantics: reads fold every
//! stored version, writes persist the folded result, so concurrent versions
//! converge without CRDT metadata.

use std::sync::Arc;

use tracing::{debug, info};
use weft_common::{HashOf, IdOf};
use weft_crypto::{CryptoApi, Keychain, PublicEncryptionKey};
use weft_objects::{
	CommunicationEndpoint, Instance, Keys, KeysOwner, Leute, Person,
	PersonDescription, Profile, Someone, VersionedObject,
};
use weft_store::Store;

use crate::TrustError;

/// A resolved [`CommunicationEndpoint::InstanceEndpoint`], with the key
/// objects loaded.
#[derive(Debug, Clone)]
pub struct InstanceEndpointInfo {
	pub person_id: IdOf<Person>,
	pub instance_id: IdOf<Instance>,
	pub person_keys: Keys,
	pub instance_keys: Keys,
	pub url: Option<String>,
}

/// Handle to the local installation's identity graph.
#[derive(Clone)]
pub struct LeuteModel {
	store: Store,
	keychain: Arc<Keychain>,
	my_person: IdOf<Person>,
	my_instance: IdOf<Instance>,
}

impl LeuteModel {
	/// First-boot setup: creates the local person, instance, keys, default
	/// profile, someone and the leute root.
	pub fn create(
		store: Store,
		keychain: Arc<Keychain>,
		email: &str,
		instance_name: &str,
	) -> Result<Self, TrustError> {
		let person = Person {
			email: email.to_owned(),
		};
		let person_id = person.id_hash();
		store.put_versioned(&person);
		let instance = Instance {
			name: instance_name.to_owned(),
			owner: person_id,
		};
		let instance_id = instance.id_hash();
		store.put_versioned(&instance);

		let person_api = keychain.create_keys(person_id.raw());
		let instance_api = keychain.create_keys(instance_id.raw());
		let person_keys = store.put_unversioned(&Keys {
			owner: KeysOwner::Person(person_id),
			public_sign_key: person_api.public_sign_key(),
			public_encryption_key: person_api.public_encryption_key(),
		});
		let instance_keys = store.put_unversioned(&Keys {
			owner: KeysOwner::Instance(instance_id),
			public_sign_key: instance_api.public_sign_key(),
			public_encryption_key: instance_api.public_encryption_key(),
		});

		let mut profile = Profile::new(person_id, person_id, Profile::DEFAULT);
		profile.add_description(PersonDescription::SignKey {
			key: person_api.public_sign_key(),
		});
		profile.add_endpoint(CommunicationEndpoint::InstanceEndpoint {
			person_id,
			instance_id,
			person_keys,
			instance_keys,
			url: None,
		});
		let profile_id = profile.id_hash();
		store.put_versioned(&profile);

		let mut someone = Someone::new(&person_id.to_hex());
		someone.attach_profile(person_id, profile_id);
		someone.main_profile = Some(profile_id);
		let someone_id = someone.id_hash();
		store.put_versioned(&someone);

		store.put_versioned(&Leute::new(someone_id));
		info!(email, instance_name, "leute root created");

		Ok(Self {
			store,
			keychain,
			my_person: person_id,
			my_instance: instance_id,
		})
	}

	/// Attaches to an existing leute root.
	pub fn load(store: Store, keychain: Arc<Keychain>) -> Result<Self, TrustError> {
		let leute = store
			.current_version(Leute::singleton_id_hash())
			.map_err(|_| TrustError::NoLeuteRoot)?;
		let me: Someone = store.current_version(leute.me)?;
		let my_person = me
			.persons()
			.next()
			.ok_or_else(|| TrustError::UnknownSomeone(me.someone_id.clone()))?;
		// The instance is the one our keychain has keys for.
		let my_instance = store
			.ids_of_type(weft_objects::ObjectType::Instance)
			.into_iter()
			.map(IdOf::<Instance>::from_raw)
			.find(|id| keychain.crypto_api(id.raw()).is_some())
			.ok_or_else(|| TrustError::MissingKeys("local instance".to_owned()))?;
		Ok(Self {
			store,
			keychain,
			my_person,
			my_instance,
		})
	}

	pub fn store(&self) -> &Store {
		&self.store
	}

	pub fn keychain(&self) -> &Arc<Keychain> {
		&self.keychain
	}

	pub fn my_person_id(&self) -> IdOf<Person> {
		self.my_person
	}

	pub fn my_instance_id(&self) -> IdOf<Instance> {
		self.my_instance
	}

	pub fn my_person_crypto(&self) -> Result<CryptoApi, TrustError> {
		self.keychain
			.crypto_api(self.my_person.raw())
			.ok_or_else(|| TrustError::MissingKeys("local person".to_owned()))
	}

	pub fn my_instance_crypto(&self) -> Result<CryptoApi, TrustError> {
		self.keychain
			.crypto_api(self.my_instance.raw())
			.ok_or_else(|| TrustError::MissingKeys("local instance".to_owned()))
	}

	pub fn my_instance_object(&self) -> Result<Instance, TrustError> {
		Ok(self.store.current_version(self.my_instance)?)
	}

	pub fn leute(&self) -> Result<Leute, TrustError> {
		self.store
			.current_version(Leute::singleton_id_hash())
			.map_err(|_| TrustError::NoLeuteRoot)
	}

	/// The folded (all-versions bag union) view of a profile.
	pub fn profile(&self, id: IdOf<Profile>) -> Result<Profile, TrustError> {
		let versions = self.store.version_hashes(id);
		let mut folded: Option<Profile> = None;
		for hash in versions {
			let version: Profile = self.store.get(hash)?;
			match &mut folded {
				None => folded = Some(version),
				Some(profile) => {
					profile.merge_from(&version);
				}
			}
		}
		folded.ok_or(TrustError::Store(weft_store::StoreError::IdNotFound(
			id.raw(),
		)))
	}

	/// Persists `profile`, folding it with every stored version first.
	pub fn store_profile(&self, profile: Profile) -> Result<HashOf<Profile>, TrustError> {
		let id = profile.id_hash();
		let merged = match self.profile(id) {
			Ok(mut existing) => {
				existing.merge_from(&profile);
				existing
			}
			Err(_) => profile,
		};
		Ok(self.store.put_versioned(&merged).hash)
	}

	/// Records a newly learned peer identity: persists their person, the
	/// profile written about them, a someone and the leute membership.
	pub fn add_peer(
		&self,
		person: &Person,
		profile: Profile,
	) -> Result<IdOf<Someone>, TrustError> {
		let person_id = person.id_hash();
		assert_eq!(profile.person_id, person_id, "profile subject mismatch");
		self.store.put_versioned(person);
		let profile_id = profile.id_hash();
		self.store_profile(profile)?;

		let someone_id_str = person_id.to_hex();
		let someone_id = Someone::id_hash_for(&someone_id_str);
		let mut someone = match self.store.current_version(someone_id) {
			Ok(existing) => existing,
			Err(_) => Someone::new(&someone_id_str),
		};
		someone.attach_profile(person_id, profile_id);
		if someone.main_profile.is_none() {
			someone.main_profile = Some(profile_id);
		}
		self.store.put_versioned(&someone);

		let mut leute = self.leute()?;
		if leute.me != someone_id && leute.add_other(someone_id) {
			self.store.put_versioned(&leute);
			debug!(person = %person_id, "added someone to leute");
		}
		Ok(someone_id)
	}

	pub fn someones(&self) -> Result<Vec<Someone>, TrustError> {
		let leute = self.leute()?;
		let mut someones = Vec::new();
		for id in leute.someones() {
			someones.push(self.store.current_version(id)?);
		}
		Ok(someones)
	}

	pub fn me_someone(&self) -> Result<Someone, TrustError> {
		let leute = self.leute()?;
		Ok(self.store.current_version(leute.me)?)
	}

	pub fn someone_for_person(&self, person: IdOf<Person>) -> Option<Someone> {
		self.someones()
			.ok()?
			.into_iter()
			.find(|someone| someone.identities.contains_key(&person))
	}

	pub fn is_known_person(&self, person: IdOf<Person>) -> bool {
		self.someone_for_person(person).is_some()
	}

	/// The profile to show for a someone: the explicit main profile if set,
	/// otherwise the subject's own default profile, otherwise any.
	pub fn main_profile_for(&self, someone: &Someone) -> Option<Profile> {
		if let Some(main) = someone.main_profile {
			if let Ok(profile) = self.profile(main) {
				return Some(profile);
			}
		}
		let mut fallback = None;
		for (person, profiles) in &someone.identities {
			for id in profiles {
				let Ok(profile) = self.profile(*id) else {
					continue;
				};
				if profile.profile_id == Profile::DEFAULT && profile.owner == *person {
					return Some(profile);
				}
				fallback.get_or_insert(profile);
			}
		}
		fallback
	}

	/// Every resolved instance endpoint known for `person`, across all
	/// profiles of the someone that carries this identity.
	pub fn endpoints_for_person(
		&self,
		person: IdOf<Person>,
	) -> Result<Vec<InstanceEndpointInfo>, TrustError> {
		let Some(someone) = self.someone_for_person(person) else {
			return Ok(Vec::new());
		};
		let mut endpoints = Vec::new();
		for profile_id in someone.profiles() {
			let profile = self.profile(profile_id)?;
			for endpoint in &profile.communication_endpoints {
				let CommunicationEndpoint::InstanceEndpoint {
					person_id,
					instance_id,
					person_keys,
					instance_keys,
					url,
				} = endpoint;
				if *person_id != person {
					continue;
				}
				endpoints.push(InstanceEndpointInfo {
					person_id: *person_id,
					instance_id: *instance_id,
					person_keys: self.store.get(*person_keys)?,
					instance_keys: self.store.get(*instance_keys)?,
					url: url.clone(),
				});
			}
		}
		Ok(endpoints)
	}

	/// The person-level encryption keys stored for `person`.
	pub fn known_person_encryption_keys(
		&self,
		person: IdOf<Person>,
	) -> Result<Vec<PublicEncryptionKey>, TrustError> {
		Ok(self
			.endpoints_for_person(person)?
			.into_iter()
			.map(|endpoint| endpoint.person_keys.public_encryption_key)
			.collect())
	}
}

impl std::fmt::Debug for LeuteModel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LeuteModel")
			.field("my_person", &self.my_person)
			.field("my_instance", &self.my_instance)
			.finish()
	}
}
