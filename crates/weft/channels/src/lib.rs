//! The channel manager.
//!
//! A channel is a per-owner append-only list stored as a linked chain of
//! entries; concurrent writers fork the chain and the manager's merge pass
//! reconciles the forks into one canonical, deterministic total order
//! (descending creation time, ties by creation-time hash).
//!
//! Every new `ChannelInfo` version observed through the store hook queues a
//! merge job on a background worker. A post resolves only after its
//! contribution was merged into the channel's read version; `on_updated`
//! fires once per merge pass that changed anything, after the registry
//! snapshot was persisted.

mod iterator;
mod query;

pub use self::iterator::{ChainIterator, MergeItem, MostCurrentMergeIterator, RawChannelEntry};
pub use self::query::{ChannelObject, ObjectIterator, QueryOptions};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_common::event::SubscriptionGuard;
use weft_common::{now_ms, Event, IdOf, KeyedLocks, Lifecycle, RawHash};
use weft_objects::{
	ChannelEntry, ChannelInfo, ChannelRegistry, ChannelRegistryEntry, CreationTime,
	Group, Object, ObjectType, Person,
};
use weft_store::{Store, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
	#[error("channel '{id}' of owner {owner} does not exist")]
	ChannelNotFound { id: String, owner: String },
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("invalid object id '{0}'")]
	InvalidObjectId(String),
	#[error("merge pass failed: {0}")]
	MergeFailed(String),
	#[error("channel manager is shut down")]
	ShutDown,
}

/// Fired after a merge pass changed a channel.
#[derive(Debug, Clone)]
pub struct ChannelUpdated {
	pub id: String,
	pub owner: IdOf<Person>,
	pub id_hash: RawHash,
}

struct CacheEntry {
	read_version: ChannelInfo,
	read_version_index: u64,
	latest_merged_index: u64,
	merged_handlers: Vec<oneshot::Sender<Result<(), ChannelError>>>,
}

struct Inner {
	store: Store,
	default_owner: IdOf<Person>,
	cache: StdMutex<HashMap<RawHash, CacheEntry>>,
	/// Per-channel lock; mutually excludes post and merge for one channel.
	cache_locks: KeyedLocks<RawHash>,
	/// Serializes `ChannelInfo` version writes.
	post_lock: AsyncMutex<()>,
	/// Serializes `post_if_not_exists` scans.
	post_ne_lock: AsyncMutex<()>,
	/// Serializes registry snapshots.
	registry_lock: AsyncMutex<()>,
	on_updated: Event<ChannelUpdated>,
	lifecycle: Lifecycle,
	subscription: StdMutex<Option<SubscriptionGuard>>,
	worker: StdMutex<Option<JoinHandle<()>>>,
}

pub struct ChannelManager {
	inner: Arc<Inner>,
}

impl ChannelManager {
	pub fn new(store: Store, default_owner: IdOf<Person>) -> Self {
		let inner = Arc::new(Inner {
			store: store.clone(),
			default_owner,
			cache: StdMutex::new(HashMap::new()),
			cache_locks: KeyedLocks::new(),
			post_lock: AsyncMutex::new(()),
			post_ne_lock: AsyncMutex::new(()),
			registry_lock: AsyncMutex::new(()),
			on_updated: Event::new(),
			lifecycle: Lifecycle::new(),
			subscription: StdMutex::new(None),
			worker: StdMutex::new(None),
		});
		inner.load_registry();

		let (merge_tx, merge_rx) = mpsc::unbounded_channel();
		let subscription = store.on_versioned_object().subscribe(move |event| {
			if event.object_type == ObjectType::ChannelInfo {
				// Worker gone means shutdown; nothing left to merge into.
				let _ = merge_tx.send(event.id_hash);
			}
		});
		*inner.subscription.lock().expect("poisoned") = Some(subscription);
		let worker = tokio::spawn(run_worker(Arc::clone(&inner), merge_rx));
		*inner.worker.lock().expect("poisoned") = Some(worker);
		inner.lifecycle.init().expect("fresh lifecycle");

		Self { inner }
	}

	fn owner_or_default(&self, owner: Option<IdOf<Person>>) -> IdOf<Person> {
		owner.unwrap_or(self.inner.default_owner)
	}

	/// Creates the channel if it does not exist. Idempotent: a second call
	/// returns the same id hash without writing a new version.
	pub async fn create_channel(
		&self,
		id: &str,
		owner: Option<IdOf<Person>>,
	) -> Result<IdOf<ChannelInfo>, ChannelError> {
		self.inner
			.lifecycle
			.assert_initialised()
			.map_err(|_| ChannelError::ShutDown)?;
		let owner = self.owner_or_default(owner);
		let id_hash = ChannelInfo::id_hash_for(id, owner);

		let _channel_guard = self.inner.cache_locks.lock(&id_hash.raw()).await;
		let _post_guard = self.inner.post_lock.lock().await;
		if self.inner.store.version_count(id_hash.raw()) == 0 {
			info!(channel = id, "creating channel");
			self.inner.store.put_versioned(&ChannelInfo {
				id: id.to_owned(),
				owner,
				head: None,
			});
		}
		Ok(id_hash)
	}

	/// Appends `data` to the channel and resolves once the entry was merged
	/// into the channel's read version.
	pub async fn post_to_channel(
		&self,
		id: &str,
		owner: Option<IdOf<Person>>,
		data: &Object,
		timestamp: Option<u64>,
	) -> Result<(), ChannelError> {
		self.inner
			.lifecycle
			.assert_initialised()
			.map_err(|_| ChannelError::ShutDown)?;
		let owner = self.owner_or_default(owner);
		let id_hash = ChannelInfo::id_hash_for(id, owner);

		let merged = {
			let _channel_guard = self.inner.cache_locks.lock(&id_hash.raw()).await;
			if self.inner.store.version_count(id_hash.raw()) == 0 {
				return Err(ChannelError::ChannelNotFound {
					id: id.to_owned(),
					owner: owner.to_hex(),
				});
			}
			let _post_guard = self.inner.post_lock.lock().await;

			// The new entry chains onto the head as of *this* post; forks
			// from concurrent posters are reconciled by the merge pass.
			let current: ChannelInfo = self.inner.store.current_version(id_hash)?;
			let payload_hash = self.inner.store.put_object(data);
			let creation_time = CreationTime {
				timestamp: timestamp.unwrap_or_else(now_ms),
				data: payload_hash,
			};
			let creation_time_hash = self.inner.store.put_unversioned(&creation_time);
			let entry_hash = self.inner.store.put_unversioned(&ChannelEntry {
				previous: current.head,
				data: creation_time_hash,
			});
			let put = self.inner.store.put_versioned(&ChannelInfo {
				id: id.to_owned(),
				owner,
				head: Some(entry_hash),
			});
			debug!(channel = id, version = put.version_index, "posted entry");

			let (tx, rx) = oneshot::channel();
			let mut cache = self.inner.cache.lock().expect("poisoned");
			cache
				.entry(id_hash.raw())
				.or_insert_with(|| CacheEntry {
					read_version: current.clone(),
					read_version_index: put.version_index.saturating_sub(1),
					latest_merged_index: put.version_index.saturating_sub(1),
					merged_handlers: Vec::new(),
				})
				.merged_handlers
				.push(tx);
			rx
		};

		merged.await.map_err(|_| ChannelError::ShutDown)?
	}

	/// Posts `data` unless an entry with the identical payload already
	/// exists in the channel.
	pub async fn post_if_not_exists(
		&self,
		id: &str,
		owner: Option<IdOf<Person>>,
		data: &Object,
		timestamp: Option<u64>,
	) -> Result<(), ChannelError> {
		let _scan_guard = self.inner.post_ne_lock.lock().await;
		let payload_hash = weft_objects::content_hash_raw(data);
		let owner_id = self.owner_or_default(owner);
		let mut iterator = self
			.object_iterator(QueryOptions {
				omit_data: true,
				..QueryOptions::channel(id, owner_id)
			})
			.await?;
		while let Some(object) = iterator.next().await? {
			if object.data_hash == payload_hash {
				return Ok(());
			}
		}
		self.post_to_channel(id, owner, data, timestamp).await
	}

	/// Fired once per merge pass that changed a channel, after the registry
	/// snapshot was persisted.
	pub fn on_updated(&self) -> &Event<ChannelUpdated> {
		&self.inner.on_updated
	}

	/// `(read_version_index, latest_merged_index)` of a cached channel.
	pub fn cache_indices(&self, id: &str, owner: Option<IdOf<Person>>) -> Option<(u64, u64)> {
		let id_hash = ChannelInfo::id_hash_for(id, self.owner_or_default(owner));
		let cache = self.inner.cache.lock().expect("poisoned");
		cache
			.get(&id_hash.raw())
			.map(|entry| (entry.read_version_index, entry.latest_merged_index))
	}

	/// Enumerates matching entries, most current first.
	pub async fn get_objects(
		&self,
		options: QueryOptions,
	) -> Result<Vec<ChannelObject>, ChannelError> {
		let mut iterator = self.object_iterator(options).await?;
		let mut objects = Vec::new();
		while let Some(object) = iterator.next().await? {
			objects.push(object);
		}
		Ok(objects)
	}

	pub async fn object_iterator(
		&self,
		mut options: QueryOptions,
	) -> Result<ObjectIterator, ChannelError> {
		// An explicit object id addresses one entry directly.
		if let Some(object_id) = options.object_id.take() {
			let (channel_hash, entry_hash) = query::parse_object_id(&object_id)?;
			let meta = self
				.channel_meta(channel_hash)
				.ok_or(ChannelError::InvalidObjectId(object_id))?;
			options.count = Some(options.count.unwrap_or(1).min(1));
			return Ok(ObjectIterator::new(
				self.inner.store.clone(),
				vec![Some(entry_hash)],
				vec![meta],
				options,
			));
		}

		let mut heads = Vec::new();
		let mut metas = Vec::new();
		for meta in self.select_channels(&options) {
			let head = {
				let cache = self.inner.cache.lock().expect("poisoned");
				match cache.get(&meta.id_hash) {
					Some(entry) => entry.read_version.head,
					None => {
						let id: IdOf<ChannelInfo> = IdOf::from_raw(meta.id_hash);
						match self.inner.store.current_version(id) {
							Ok(info) => info.head,
							Err(_) => continue,
						}
					}
				}
			};
			heads.push(head);
			metas.push(meta);
		}
		Ok(ObjectIterator::new(
			self.inner.store.clone(),
			heads,
			metas,
			options,
		))
	}

	/// All persons the channel is shared with: direct grants plus expanded
	/// group memberships, deduplicated.
	pub async fn shared_with(
		&self,
		id: &str,
		owner: Option<IdOf<Person>>,
	) -> Result<Vec<IdOf<Person>>, ChannelError> {
		let owner = self.owner_or_default(owner);
		let id_hash = ChannelInfo::id_hash_for(id, owner);
		let mut persons: BTreeSet<IdOf<Person>> = BTreeSet::new();
		for grant in self.inner.store.accessors_of(id_hash.raw()) {
			persons.extend(grant.persons.iter().copied());
			for group_id in &grant.groups {
				match self.inner.store.current_version::<Group>(*group_id) {
					Ok(group) => persons.extend(group.members.iter().copied()),
					Err(e) => {
						warn!(group = %group_id, error = %e, "skipping unknown group in access grant")
					}
				}
			}
		}
		Ok(persons.into_iter().collect())
	}

	/// Idempotent: stops the merge worker and rejects pending post
	/// handlers.
	pub async fn shutdown(&self) {
		if !self.inner.lifecycle.shutdown() {
			return;
		}
		info!("channel manager shutting down");
		// Dropping the subscription closes the merge queue; the worker
		// drains it and exits.
		*self.inner.subscription.lock().expect("poisoned") = None;
		let worker = self.inner.worker.lock().expect("poisoned").take();
		if let Some(worker) = worker {
			let _ = worker.await;
		}
		let handlers: Vec<oneshot::Sender<Result<(), ChannelError>>> = {
			let mut cache = self.inner.cache.lock().expect("poisoned");
			cache
				.values_mut()
				.flat_map(|entry| entry.merged_handlers.drain(..))
				.collect()
		};
		for handler in handlers {
			let _ = handler.send(Err(ChannelError::ShutDown));
		}
	}

	fn channel_meta(&self, id_hash: RawHash) -> Option<query::ChannelMeta> {
		{
			let cache = self.inner.cache.lock().expect("poisoned");
			if let Some(entry) = cache.get(&id_hash) {
				return Some(query::ChannelMeta {
					id: entry.read_version.id.clone(),
					owner: entry.read_version.owner,
					id_hash,
				});
			}
		}
		let id: IdOf<ChannelInfo> = IdOf::from_raw(id_hash);
		self.inner
			.store
			.current_version(id)
			.ok()
			.map(|info| query::ChannelMeta {
				id: info.id,
				owner: info.owner,
				id_hash,
			})
	}

	fn select_channels(&self, options: &QueryOptions) -> Vec<query::ChannelMeta> {
		let mut metas: Vec<query::ChannelMeta> = {
			let cache = self.inner.cache.lock().expect("poisoned");
			cache
				.iter()
				.filter(|(_, entry)| {
					options
						.channel_ids
						.as_ref()
						.map_or(true, |ids| ids.contains(&entry.read_version.id))
						&& options
							.owners
							.as_ref()
							.map_or(true, |owners| {
								owners.contains(&entry.read_version.owner)
							})
				})
				.map(|(id_hash, entry)| query::ChannelMeta {
					id: entry.read_version.id.clone(),
					owner: entry.read_version.owner,
					id_hash: *id_hash,
				})
				.collect()
		};
		// Explicitly named channels may exist in the store without having
		// been cached yet (fresh manager, remote data).
		if let (Some(ids), Some(owners)) = (&options.channel_ids, &options.owners) {
			for id in ids {
				for owner in owners {
					let id_hash = ChannelInfo::id_hash_for(id, *owner);
					let known = metas.iter().any(|m| m.id_hash == id_hash.raw());
					if !known && self.inner.store.version_count(id_hash.raw()) > 0 {
						metas.push(query::ChannelMeta {
							id: id.clone(),
							owner: *owner,
							id_hash: id_hash.raw(),
						});
					}
				}
			}
		}
		// Deterministic lane order for reproducible queries.
		metas.sort_by_key(|meta| meta.id_hash);
		metas
	}
}

impl std::fmt::Debug for ChannelManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelManager")
			.field(
				"channels",
				&self.inner.cache.lock().expect("poisoned").len(),
			)
			.finish()
	}
}

impl Inner {
	/// Warms the cache from the persisted registry snapshot.
	fn load_registry(&self) {
		let Ok(registry) = self
			.store
			.current_version(ChannelRegistry::singleton_id_hash())
		else {
			return;
		};
		let mut cache = self.cache.lock().expect("poisoned");
		for entry in registry.channels {
			let loaded = self
				.store
				.version_at(entry.channel_info_id_hash, entry.read_version_index);
			match loaded {
				Ok(info) => {
					cache.insert(
						entry.channel_info_id_hash.raw(),
						CacheEntry {
							read_version: info,
							read_version_index: entry.read_version_index,
							latest_merged_index: entry.merged_version_index,
							merged_handlers: Vec::new(),
						},
					);
				}
				Err(e) => {
					warn!(
						channel = %entry.channel_info_id_hash,
						error = %e,
						"dropping stale registry entry"
					);
				}
			}
		}
	}
}

async fn run_worker(inner: Arc<Inner>, mut merge_rx: mpsc::UnboundedReceiver<RawHash>) {
	while let Some(channel) = merge_rx.recv().await {
		if let Err(e) = merge_channel(&inner, channel).await {
			warn!(channel = %channel, error = %e, "merge pass failed");
		}
	}
	debug!("merge worker stopped");
}

async fn merge_channel(inner: &Arc<Inner>, channel: RawHash) -> Result<(), ChannelError> {
	let _channel_guard = inner.cache_locks.lock(&channel).await;
	let count = inner.store.version_count(channel);
	if count == 0 {
		return Ok(());
	}
	let last = count - 1;
	let known_merged_index = {
		let cache = inner.cache.lock().expect("poisoned");
		cache.get(&channel).map(|entry| entry.latest_merged_index)
	};

	let outcome = match do_merge(inner, channel, known_merged_index, last).await {
		Ok(outcome) => outcome,
		Err(e) => {
			for handler in drain_handlers(inner, channel) {
				let _ =
					handler.send(Err(ChannelError::MergeFailed(e.to_string())));
			}
			return Err(e);
		}
	};

	if outcome.is_some() {
		persist_registry(inner).await?;
	}
	for handler in drain_handlers(inner, channel) {
		let _ = handler.send(Ok(()));
	}
	if let Some(updated) = outcome {
		inner.on_updated.emit(&updated);
	}
	Ok(())
}

fn drain_handlers(
	inner: &Inner,
	channel: RawHash,
) -> Vec<oneshot::Sender<Result<(), ChannelError>>> {
	let mut cache = inner.cache.lock().expect("poisoned");
	cache
		.get_mut(&channel)
		.map(|entry| entry.merged_handlers.drain(..).collect())
		.unwrap_or_default()
}

/// Reconciles versions `[merged..=last]` into one canonical head. Returns
/// `None` when there was nothing new to merge.
async fn do_merge(
	inner: &Arc<Inner>,
	channel: RawHash,
	known_merged_index: Option<u64>,
	last: u64,
) -> Result<Option<ChannelUpdated>, ChannelError> {
	let merged_index = known_merged_index.unwrap_or(0);
	if known_merged_index.is_some() && last <= merged_index {
		return Ok(None);
	}
	let id: IdOf<ChannelInfo> = IdOf::from_raw(channel);

	let mut heads = Vec::new();
	for index in merged_index..=last {
		let info: ChannelInfo = inner.store.version_at(id, index)?;
		heads.push(info.head);
	}
	let latest: ChannelInfo = inner.store.version_at(id, last)?;

	let mut merge = MostCurrentMergeIterator::new(&inner.store, heads, true);
	let mut unmerged: Vec<RawChannelEntry> = Vec::new();
	let mut common: Option<RawChannelEntry> = None;
	while let Some(item) = merge.next().await? {
		if item.is_common_history_head {
			common = Some(item.entry);
			break;
		}
		unmerged.push(item.entry);
	}

	// Sanity check. A violated chain structure is a programming error, not
	// a recoverable condition.
	let mut seen = HashSet::new();
	for entry in &unmerged {
		assert!(
			seen.insert(entry.channel_entry_hash),
			"merge inconsistency: entry {} enumerated twice for channel {channel}",
			entry.channel_entry_hash
		);
	}

	// Rebuild: common history stays, unmerged entries are re-chained on
	// top, oldest first.
	let mut head = common.as_ref().map(|entry| entry.channel_entry_hash);
	for raw in unmerged.iter().rev() {
		head = Some(inner.store.put_unversioned(&ChannelEntry {
			previous: head,
			data: raw.creation_time_hash,
		}));
	}

	let (read_version, version_index) = if head != latest.head {
		let merged_info = ChannelInfo {
			id: latest.id.clone(),
			owner: latest.owner,
			head,
		};
		let put = inner.store.put_versioned(&merged_info);
		debug!(
			channel = %merged_info.id,
			version = put.version_index,
			merged = unmerged.len(),
			"published merged head"
		);
		(merged_info, put.version_index)
	} else {
		(latest, last)
	};

	{
		let mut cache = inner.cache.lock().expect("poisoned");
		let entry = cache.entry(channel).or_insert_with(|| CacheEntry {
			read_version: read_version.clone(),
			read_version_index: version_index,
			latest_merged_index: version_index,
			merged_handlers: Vec::new(),
		});
		entry.read_version = read_version.clone();
		entry.read_version_index = entry.read_version_index.max(version_index);
		entry.latest_merged_index = entry.latest_merged_index.max(version_index);
	}

	Ok(Some(ChannelUpdated {
		id: read_version.id,
		owner: read_version.owner,
		id_hash: channel,
	}))
}

async fn persist_registry(inner: &Arc<Inner>) -> Result<(), ChannelError> {
	let _registry_guard = inner.registry_lock.lock().await;
	let mut channels: Vec<ChannelRegistryEntry> = {
		let cache = inner.cache.lock().expect("poisoned");
		cache
			.iter()
			.map(|(id_hash, entry)| ChannelRegistryEntry {
				channel_info_id_hash: IdOf::from_raw(*id_hash),
				read_version_index: entry.read_version_index,
				merged_version_index: entry.latest_merged_index,
			})
			.collect()
	};
	channels.sort_by_key(|entry| entry.channel_info_id_hash.raw());
	inner.store.put_versioned(&ChannelRegistry {
		app_id: ChannelRegistry::APP_ID.to_owned(),
		channels,
	});
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;
	use weft_objects::{
		content_hash, content_hash_raw, Document, IdAccess, Storable, VersionedObject,
	};

	fn owner() -> IdOf<Person> {
		Person {
			email: "owner@example.com".into(),
		}
		.id_hash()
	}

	fn doc(content: &str) -> Object {
		Document {
			content: content.into(),
		}
		.into_object()
	}

	async fn wait_until(mut cond: impl FnMut() -> bool) {
		for _ in 0..400 {
			if cond() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("condition not reached in time");
	}

	/// Writes a fork rooted at the empty chain directly into the store,
	/// simulating a concurrent version arriving from a remote peer.
	fn write_fork(store: &Store, id: &str, owner: IdOf<Person>, timestamp: u64, content: &str) {
		let payload = doc(content);
		let data = store.put_object(&payload);
		let creation_time_hash = store.put_unversioned(&CreationTime {
			timestamp,
			data,
		});
		let entry_hash = store.put_unversioned(&ChannelEntry {
			previous: None,
			data: creation_time_hash,
		});
		store.put_versioned(&ChannelInfo {
			id: id.to_owned(),
			owner,
			head: Some(entry_hash),
		});
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_create_channel_is_idempotent() {
		let store = Store::new();
		let manager = ChannelManager::new(store.clone(), owner());

		let first = manager.create_channel("notes", None).await.unwrap();
		let second = manager.create_channel("notes", None).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(store.version_count(first.raw()), 1);
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_post_resolves_after_merge() {
		let store = Store::new();
		let manager = ChannelManager::new(store.clone(), owner());
		manager.create_channel("notes", None).await.unwrap();

		manager
			.post_to_channel("notes", None, &doc("first"), Some(10))
			.await
			.unwrap();

		// Resolution implies the contribution is merged and visible.
		let (read, merged) = manager.cache_indices("notes", None).unwrap();
		assert!(read >= merged);
		let objects = manager
			.get_objects(QueryOptions::channel("notes", owner()))
			.await
			.unwrap();
		assert_eq!(objects.len(), 1);
		assert_eq!(objects[0].creation_time, 10);
		assert_eq!(objects[0].data, Some(doc("first")));
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_post_to_missing_channel_fails() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		let err = manager
			.post_to_channel("nope", None, &doc("x"), None)
			.await
			.unwrap_err();
		assert!(matches!(err, ChannelError::ChannelNotFound { ref id, .. } if id == "nope"));
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_concurrent_forks_merge_with_hash_tie_break() {
		let store = Store::new();
		let manager = ChannelManager::new(store.clone(), owner());
		manager.create_channel("x", None).await.unwrap();

		// Two forks with the same timestamp, as left by two simultaneous
		// posters.
		write_fork(&store, "x", owner(), 100, "d1");
		write_fork(&store, "x", owner(), 100, "d2");

		let manager_ref = &manager;
		wait_until(move || merged_chain_len(manager_ref, "x") == 2).await;

		let objects = manager
			.get_objects(QueryOptions::channel("x", owner()))
			.await
			.unwrap();
		assert_eq!(objects.len(), 2);
		assert_eq!(objects[0].creation_time, 100);
		assert_eq!(objects[1].creation_time, 100);
		// Equal timestamps: descending creation-time-hash order.
		assert!(objects[0].creation_time_hash.raw() > objects[1].creation_time_hash.raw());

		let (read, merged) = manager.cache_indices("x", None).unwrap();
		assert!(read >= merged);
		manager.shutdown().await;
	}

	/// Chain length of the cached read version; for wait_until closures.
	fn merged_chain_len(manager: &ChannelManager, id: &str) -> usize {
		let head = {
			let cache = manager.inner.cache.lock().expect("poisoned");
			let id_hash = ChannelInfo::id_hash_for(id, owner());
			match cache.get(&id_hash.raw()) {
				Some(entry) => entry.read_version.head,
				None => return 0,
			}
		};
		chain_len(&manager.inner.store, head)
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_merge_converges_regardless_of_arrival_order() {
		let forks = [(100u64, "a"), (100u64, "b"), (250u64, "c")];

		let mut heads = Vec::new();
		for ordering in [[0usize, 1, 2], [2, 1, 0]] {
			let store = Store::new();
			let manager = ChannelManager::new(store.clone(), owner());
			let id_hash = manager.create_channel("conv", None).await.unwrap();

			for index in ordering {
				let (timestamp, content) = forks[index];
				write_fork(&store, "conv", owner(), timestamp, content);
			}
			let store_ref = store.clone();
			wait_until(move || {
				let Ok(info) = store_ref.current_version(id_hash) else {
					return false;
				};
				chain_len(&store_ref, info.head) == 3
			})
			.await;
			// Let trailing merge jobs settle, then snapshot the head.
			tokio::time::sleep(Duration::from_millis(30)).await;
			heads.push(store.current_version(id_hash).unwrap().head);
			manager.shutdown().await;
		}
		assert_eq!(heads[0], heads[1]);
		assert!(heads[0].is_some());
	}

	fn chain_len(store: &Store, head: Option<weft_common::HashOf<ChannelEntry>>) -> usize {
		let mut length = 0;
		let mut next = head;
		while let Some(hash) = next {
			let Ok(entry) = store.get::<ChannelEntry>(hash) else {
				return 0;
			};
			length += 1;
			next = entry.previous;
		}
		length
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_queries_filter_and_limit() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		manager.create_channel("q", None).await.unwrap();
		for (timestamp, content) in [(10, "a"), (20, "b"), (30, "c"), (40, "d")] {
			manager
				.post_to_channel("q", None, &doc(content), Some(timestamp))
				.await
				.unwrap();
		}

		let base = QueryOptions::channel("q", owner());
		let windowed = manager
			.get_objects(QueryOptions {
				from: Some(20),
				to: Some(30),
				..base.clone()
			})
			.await
			.unwrap();
		assert_eq!(
			windowed.iter().map(|o| o.creation_time).collect::<Vec<_>>(),
			vec![30, 20]
		);

		let limited = manager
			.get_objects(QueryOptions {
				count: Some(2),
				..base.clone()
			})
			.await
			.unwrap();
		assert_eq!(
			limited.iter().map(|o| o.creation_time).collect::<Vec<_>>(),
			vec![40, 30]
		);

		let bare = manager
			.get_objects(QueryOptions {
				omit_data: true,
				..base.clone()
			})
			.await
			.unwrap();
		assert!(bare.iter().all(|o| o.data.is_none()));

		// Type predicate: only Person payloads.
		manager
			.post_to_channel(
				"q",
				None,
				&Person {
					email: "payload@example.com".into(),
				}
				.into_object(),
				Some(50),
			)
			.await
			.unwrap();
		let persons = manager
			.get_objects(QueryOptions {
				object_type: Some(ObjectType::Person),
				..base
			})
			.await
			.unwrap();
		assert_eq!(persons.len(), 1);
		assert_eq!(persons[0].creation_time, 50);
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_object_id_addresses_one_entry() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		manager.create_channel("addr", None).await.unwrap();
		manager
			.post_to_channel("addr", None, &doc("old"), Some(1))
			.await
			.unwrap();
		manager
			.post_to_channel("addr", None, &doc("new"), Some(2))
			.await
			.unwrap();

		let all = manager
			.get_objects(QueryOptions::channel("addr", owner()))
			.await
			.unwrap();
		let older = &all[1];
		let fetched = manager
			.get_objects(QueryOptions {
				object_id: Some(older.object_id.clone()),
				..QueryOptions::default()
			})
			.await
			.unwrap();
		assert_eq!(fetched.len(), 1);
		assert_eq!(fetched[0].channel_entry_hash, older.channel_entry_hash);
		assert_eq!(fetched[0].data, Some(doc("old")));
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_multi_channel_queries_interleave() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		manager.create_channel("a", None).await.unwrap();
		manager.create_channel("b", None).await.unwrap();
		manager
			.post_to_channel("a", None, &doc("a1"), Some(10))
			.await
			.unwrap();
		manager
			.post_to_channel("b", None, &doc("b1"), Some(20))
			.await
			.unwrap();
		manager
			.post_to_channel("a", None, &doc("a2"), Some(30))
			.await
			.unwrap();

		let objects = manager.get_objects(QueryOptions::default()).await.unwrap();
		let times: Vec<u64> = objects.iter().map(|o| o.creation_time).collect();
		assert_eq!(times, vec![30, 20, 10]);
		let channels: Vec<&str> =
			objects.iter().map(|o| o.channel_id.as_str()).collect();
		assert_eq!(channels, vec!["a", "b", "a"]);
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_post_if_not_exists() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		manager.create_channel("dedup", None).await.unwrap();

		manager
			.post_if_not_exists("dedup", None, &doc("once"), Some(1))
			.await
			.unwrap();
		manager
			.post_if_not_exists("dedup", None, &doc("once"), Some(2))
			.await
			.unwrap();
		manager
			.post_if_not_exists("dedup", None, &doc("twice"), Some(3))
			.await
			.unwrap();

		let objects = manager
			.get_objects(QueryOptions::channel("dedup", owner()))
			.await
			.unwrap();
		assert_eq!(objects.len(), 2);
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_shared_with_expands_groups() {
		let store = Store::new();
		let manager = ChannelManager::new(store.clone(), owner());
		let channel = manager.create_channel("shared", None).await.unwrap();

		let p1 = Person {
			email: "p1@example.com".into(),
		}
		.id_hash();
		let p2 = Person {
			email: "p2@example.com".into(),
		}
		.id_hash();
		let group = Group {
			name: "readers".into(),
			members: vec![p1, p2],
		};
		let group_id = group.id_hash();
		store.put_versioned(&group);
		// p2 granted both directly and via the group: must appear once.
		store.put_unversioned(&IdAccess {
			object: channel.raw(),
			persons: vec![p2],
			groups: vec![group_id],
		});

		let shared = manager.shared_with("shared", None).await.unwrap();
		let mut expected = vec![p1, p2];
		expected.sort();
		assert_eq!(shared, expected);
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_registry_snapshot_is_persisted() {
		let store = Store::new();
		let manager = ChannelManager::new(store.clone(), owner());
		manager.create_channel("r", None).await.unwrap();
		manager
			.post_to_channel("r", None, &doc("x"), Some(1))
			.await
			.unwrap();

		let registry = store
			.current_version(ChannelRegistry::singleton_id_hash())
			.unwrap();
		let id_hash = ChannelInfo::id_hash_for("r", owner());
		let entry = registry
			.channels
			.iter()
			.find(|c| c.channel_info_id_hash == id_hash)
			.expect("registry lists the channel");
		assert!(entry.read_version_index >= entry.merged_version_index);
		manager.shutdown().await;

		// A fresh manager warms its cache from the snapshot.
		let second = ChannelManager::new(store, owner());
		assert!(second.cache_indices("r", None).is_some());
		second.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_on_updated_fires_after_merge() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		let count = Arc::new(AtomicUsize::new(0));
		let count1 = Arc::clone(&count);
		let _guard = manager.on_updated().subscribe(move |updated| {
			assert_eq!(updated.id, "events");
			count1.fetch_add(1, Ordering::SeqCst);
		});

		manager.create_channel("events", None).await.unwrap();
		manager
			.post_to_channel("events", None, &doc("x"), Some(1))
			.await
			.unwrap();
		let count_ref = Arc::clone(&count);
		wait_until(move || count_ref.load(Ordering::SeqCst) >= 2).await;
		manager.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_shutdown_is_idempotent_and_blocks_new_work() {
		let store = Store::new();
		let manager = ChannelManager::new(store, owner());
		manager.create_channel("s", None).await.unwrap();
		manager.shutdown().await;
		manager.shutdown().await;

		assert!(matches!(
			manager.create_channel("s2", None).await,
			Err(ChannelError::ShutDown)
		));
		assert!(matches!(
			manager.post_to_channel("s", None, &doc("x"), None).await,
			Err(ChannelError::ShutDown)
		));
	}

	#[test]
	fn test_payload_hash_matches_content_hash() {
		let payload = doc("same");
		assert_eq!(
			content_hash_raw(&payload),
			content_hash(&Document {
				content: "same".into()
			})
			.raw()
		);
	}
}
