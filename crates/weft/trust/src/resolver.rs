//! The trusted-keys resolver.
//!
//! Builds in-memory maps from the store (keys→profiles, person→keys,
//! person→rights) and decides key trust by a memoized depth-first search
//! over the certificate graph, seeded by the local root keys. An on-stack
//! visit set breaks certificate cycles.
//!
//! Three certificate kinds participate:
//!
//! - `TrustKeysCertificate` on a profile version, valid when the issuer
//!   holds the root-granted right to declare trusted keys for everybody,
//! - `AffirmationCertificate` on a profile version, valid when the issuer
//!   is the profile's subject and holds the right to declare for self,
//! - `RightToDeclare…Certificate` on a person id: grants the rights above
//!   and anchors the beneficiary's keys to whoever signed the grant.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;
use weft_common::{IdOf, RawHash};
use weft_crypto::{Keychain, PublicSignKey};
use weft_objects::{
	AffirmationCertificate, CertificateType, ObjectType, Person, Profile,
	RightToDeclareTrustedKeysForEverybodyCertificate,
	RightToDeclareTrustedKeysForSelfCertificate, Signature, TrustKeysCertificate,
};
use weft_store::Store;

use crate::{LeuteModel, TrustError};

/// Which local identities seed the root key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKeyMode {
	/// Keys of the main identity only.
	MainIdentity,
	/// Keys of every local identity.
	All,
}

/// One edge that contributed to a key being trusted.
#[derive(Debug, Clone)]
pub struct TrustSource {
	pub issuer: IdOf<Person>,
	pub certificate_type: CertificateType,
	pub issuer_key_info: Arc<KeyTrustInfo>,
}

/// The resolver's verdict for one key.
#[derive(Debug, Clone)]
pub struct KeyTrustInfo {
	pub key: PublicSignKey,
	pub trusted: bool,
	pub reason: String,
	pub sources: Vec<TrustSource>,
}

impl KeyTrustInfo {
	fn leaf(key: PublicSignKey, trusted: bool, reason: &str) -> Arc<Self> {
		Arc::new(Self {
			key,
			trusted,
			reason: reason.to_owned(),
			sources: Vec::new(),
		})
	}
}

struct CertificateOnProfile {
	certificate_type: CertificateType,
	signature: Signature,
}

struct ProfileData {
	person_id: IdOf<Person>,
	owner: IdOf<Person>,
	certificates: Vec<CertificateOnProfile>,
}

#[derive(Default, Clone, Copy)]
struct Rights {
	declare_for_everybody: bool,
	declare_for_self: bool,
}

#[derive(Default)]
struct ResolverState {
	/// key → profile version hash → profile data.
	keys_to_profile: HashMap<PublicSignKey, HashMap<RawHash, Arc<ProfileData>>>,
	keys_of_person: HashMap<IdOf<Person>, Vec<PublicSignKey>>,
	person_rights: HashMap<IdOf<Person>, Rights>,
	/// Right certificates by beneficiary; anchor edges of the graph.
	right_grants: HashMap<IdOf<Person>, Vec<CertificateOnProfile>>,
	root_keys: HashSet<PublicSignKey>,
	memo: HashMap<PublicSignKey, Arc<KeyTrustInfo>>,
}

pub struct TrustedKeysResolver {
	store: Store,
	keychain: Arc<Keychain>,
	leute: LeuteModel,
	mode: RootKeyMode,
	state: Mutex<ResolverState>,
}

impl TrustedKeysResolver {
	pub fn new(leute: LeuteModel, mode: RootKeyMode) -> Result<Self, TrustError> {
		let resolver = Self {
			store: leute.store().clone(),
			keychain: Arc::clone(leute.keychain()),
			leute,
			mode,
			state: Mutex::new(ResolverState::default()),
		};
		resolver.refresh_caches()?;
		Ok(resolver)
	}

	/// Rebuilds every map and drops the memo. Callers invoke this on
	/// relevant store events (new certificate, profile or right).
	pub fn refresh_caches(&self) -> Result<(), TrustError> {
		let state = self.build_state()?;
		debug!(
			keys = state.keys_to_profile.len(),
			roots = state.root_keys.len(),
			"trust caches rebuilt"
		);
		*self.state.lock().expect("poisoned") = state;
		Ok(())
	}

	/// The current root key set.
	pub fn root_keys(&self) -> Vec<PublicSignKey> {
		let state = self.state.lock().expect("poisoned");
		state.root_keys.iter().copied().collect()
	}

	/// The trust verdict for `key`, memoized.
	pub fn key_trust_info(&self, key: &PublicSignKey) -> Arc<KeyTrustInfo> {
		let mut state = self.state.lock().expect("poisoned");
		let mut stack = HashSet::new();
		trust_dfs(&mut state, *key, &mut stack)
	}

	pub fn is_key_trusted(&self, key: &PublicSignKey) -> bool {
		self.key_trust_info(key).trusted
	}

	/// Whether any *trusted* key of the signature's issuer verifies it.
	pub fn verify_signature_with_trusted_keys(&self, signature: &Signature) -> bool {
		let candidates: Vec<PublicSignKey> = {
			let state = self.state.lock().expect("poisoned");
			state
				.keys_of_person
				.get(&signature.issuer)
				.cloned()
				.unwrap_or_default()
		};
		// Verify against every candidate; no early exit inside the
		// verification loop.
		let mut verifying = Vec::new();
		for candidate in &candidates {
			if signature.verify_with(candidate) {
				verifying.push(*candidate);
			}
		}
		verifying.iter().any(|key| self.is_key_trusted(key))
	}

	fn build_state(&self) -> Result<ResolverState, TrustError> {
		let mut state = ResolverState::default();

		// Signatures indexed by the hash they sign.
		let mut signatures_by_data: HashMap<RawHash, Vec<Signature>> = HashMap::new();
		for (_, signature) in self.store.all_of_type::<Signature>() {
			signatures_by_data
				.entry(signature.data)
				.or_default()
				.push(signature);
		}

		let trust_keys_certs = self.store.all_of_type::<TrustKeysCertificate>();
		let affirmation_certs = self.store.all_of_type::<AffirmationCertificate>();

		// Profiles, one entry per stored version: certificates attach to
		// version hashes.
		for id in self.store.ids_of_type(ObjectType::Profile) {
			let id: IdOf<Profile> = IdOf::from_raw(id);
			for version_hash in self.store.version_hashes(id) {
				let profile: Profile = self.store.get(version_hash)?;
				let mut certificates = Vec::new();
				for (cert_hash, cert) in &trust_keys_certs {
					if cert.profile != version_hash {
						continue;
					}
					for signature in
						signatures_by_data.get(&cert_hash.raw()).into_iter().flatten()
					{
						certificates.push(CertificateOnProfile {
							certificate_type: CertificateType::TrustKeys,
							signature: signature.clone(),
						});
					}
				}
				for (cert_hash, cert) in &affirmation_certs {
					if cert.data != version_hash.raw() {
						continue;
					}
					for signature in
						signatures_by_data.get(&cert_hash.raw()).into_iter().flatten()
					{
						certificates.push(CertificateOnProfile {
							certificate_type: CertificateType::Affirmation,
							signature: signature.clone(),
						});
					}
				}

				let sign_keys: Vec<PublicSignKey> =
					profile.sign_keys().copied().collect();
				let data = Arc::new(ProfileData {
					person_id: profile.person_id,
					owner: profile.owner,
					certificates,
				});
				for key in &sign_keys {
					state
						.keys_to_profile
						.entry(*key)
						.or_default()
						.insert(version_hash.raw(), Arc::clone(&data));
					let person_keys =
						state.keys_of_person.entry(profile.person_id).or_default();
					if !person_keys.contains(key) {
						person_keys.push(*key);
					}
				}
			}
		}

		// Root keys: keychain-complete keys appearing in profiles owned by
		// the local identities.
		let local_persons: Vec<IdOf<Person>> = match self.mode {
			RootKeyMode::MainIdentity => vec![self.leute.my_person_id()],
			RootKeyMode::All => self.leute.me_someone()?.persons().collect(),
		};
		for key in self.keychain.complete_sign_keys() {
			let in_local_profile = state
				.keys_to_profile
				.get(&key)
				.is_some_and(|profiles| {
					profiles
						.values()
						.any(|data| local_persons.contains(&data.owner))
				});
			if in_local_profile {
				state.root_keys.insert(key);
			}
		}

		// Rights: a flag is set iff a corresponding Right certificate on
		// the person is signed by a current root key. The grants are also
		// kept as anchor edges for the DFS.
		let mut collect_rights = |data: RawHash,
		                          beneficiary: IdOf<Person>,
		                          certificate_type: CertificateType,
		                          state: &mut ResolverState| {
			for signature in signatures_by_data.get(&data).into_iter().flatten() {
				let mut root_signed = false;
				for root in &state.root_keys {
					if signature.verify_with(root) {
						root_signed = true;
					}
				}
				if root_signed {
					let rights = state.person_rights.entry(beneficiary).or_default();
					match certificate_type {
						CertificateType::RightToDeclareTrustedKeysForEverybody => {
							rights.declare_for_everybody = true
						}
						CertificateType::RightToDeclareTrustedKeysForSelf => {
							rights.declare_for_self = true
						}
						_ => {}
					}
				}
				state
					.right_grants
					.entry(beneficiary)
					.or_default()
					.push(CertificateOnProfile {
						certificate_type,
						signature: signature.clone(),
					});
			}
		};
		for (cert_hash, cert) in self
			.store
			.all_of_type::<RightToDeclareTrustedKeysForEverybodyCertificate>()
		{
			collect_rights(
				cert_hash.raw(),
				cert.beneficiary,
				CertificateType::RightToDeclareTrustedKeysForEverybody,
				&mut state,
			);
		}
		for (cert_hash, cert) in self
			.store
			.all_of_type::<RightToDeclareTrustedKeysForSelfCertificate>()
		{
			collect_rights(
				cert_hash.raw(),
				cert.beneficiary,
				CertificateType::RightToDeclareTrustedKeysForSelf,
				&mut state,
			);
		}

		Ok(state)
	}
}

impl std::fmt::Debug for TrustedKeysResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TrustedKeysResolver")
			.field("mode", &self.mode)
			.finish()
	}
}

fn trust_dfs(
	state: &mut ResolverState,
	key: PublicSignKey,
	stack: &mut HashSet<PublicSignKey>,
) -> Arc<KeyTrustInfo> {
	if stack.contains(&key) {
		// Not memoized: the verdict only holds for this path.
		return KeyTrustInfo::leaf(key, false, "endless loop");
	}
	if let Some(cached) = state.memo.get(&key) {
		return Arc::clone(cached);
	}
	if state.root_keys.contains(&key) {
		let info = KeyTrustInfo::leaf(key, true, "local root key");
		state.memo.insert(key, Arc::clone(&info));
		return info;
	}
	let Some(profiles) = state.keys_to_profile.get(&key) else {
		let info = KeyTrustInfo::leaf(key, false, "no profiles contain this key");
		state.memo.insert(key, Arc::clone(&info));
		return info;
	};

	let profiles: Vec<Arc<ProfileData>> = profiles.values().cloned().collect();
	stack.insert(key);
	let mut trusted = false;
	let mut sources = Vec::new();

	for profile in &profiles {
		// Certificates on the profile versions listing this key, plus the
		// right grants anchoring the key's person.
		let anchors = state
			.right_grants
			.get(&profile.person_id)
			.map(|grants| {
				grants
					.iter()
					.map(|grant| (grant.certificate_type, grant.signature.clone()))
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();
		let mut edges: Vec<(CertificateType, Signature)> = profile
			.certificates
			.iter()
			.map(|cert| (cert.certificate_type, cert.signature.clone()))
			.collect();
		edges.extend(anchors);

		for (certificate_type, signature) in edges {
			let issuer = signature.issuer;
			let rights = state
				.person_rights
				.get(&issuer)
				.copied()
				.unwrap_or_default();
			let applicable = match certificate_type {
				CertificateType::TrustKeys => rights.declare_for_everybody,
				CertificateType::Affirmation => {
					rights.declare_for_self && issuer == profile.person_id
				}
				// Anchor edges: validity is established by verifying the
				// grantor's signature below.
				CertificateType::RightToDeclareTrustedKeysForEverybody
				| CertificateType::RightToDeclareTrustedKeysForSelf => true,
				_ => false,
			};
			if !applicable {
				continue;
			}

			// Which key of the issuer actually produced the signature:
			// verify against every candidate, no early exit.
			let candidates = state
				.keys_of_person
				.get(&issuer)
				.cloned()
				.unwrap_or_default();
			let mut signing_keys = Vec::new();
			for candidate in &candidates {
				if signature.verify_with(candidate) {
					signing_keys.push(*candidate);
				}
			}

			for signing_key in signing_keys {
				let info = trust_dfs(state, signing_key, stack);
				if info.trusted {
					trusted = true;
					sources.push(TrustSource {
						issuer,
						certificate_type,
						issuer_key_info: info,
					});
				}
			}
		}
	}
	stack.remove(&key);

	let info = Arc::new(KeyTrustInfo {
		key,
		trusted,
		reason: if trusted {
			"certificate chain ends in a local root key".to_owned()
		} else {
			"no certificate chain ends in a local root key".to_owned()
		},
		sources,
	});
	state.memo.insert(key, Arc::clone(&info));
	info
}
