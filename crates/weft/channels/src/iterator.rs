//! Chain walking and the most-current merge iterator.
//!
//! A channel version is a singly-linked chain of entries, newest first. The
//! merge iterator runs any number of chains in parallel and always yields
//! the globally most current entry next: greater creation time first, ties
//! broken by greater creation-time hash. Iterators that reach an entry
//! another iterator already stands on are dropped (shared history); once a
//! single iterator remains, its current entry is the common history head.

use weft_common::{HashOf, RawHash};
use weft_objects::{ChannelEntry, CreationTime};
use weft_store::Store;

use crate::ChannelError;

/// One resolved chain element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChannelEntry {
	pub channel_entry_hash: HashOf<ChannelEntry>,
	pub creation_time: u64,
	pub creation_time_hash: HashOf<CreationTime>,
	pub data_hash: RawHash,
	pub previous: Option<HashOf<ChannelEntry>>,
}

impl RawChannelEntry {
	/// The merge total order: `(creation time, creation-time hash)`,
	/// compared descending by the merge iterator.
	fn order_key(&self) -> (u64, RawHash) {
		(self.creation_time, self.creation_time_hash.raw())
	}
}

/// Walks one chain from a head towards its root.
pub struct ChainIterator {
	store: Store,
	next: Option<HashOf<ChannelEntry>>,
}

impl ChainIterator {
	pub fn new(store: Store, head: Option<HashOf<ChannelEntry>>) -> Self {
		Self { store, next: head }
	}

	pub async fn next(&mut self) -> Result<Option<RawChannelEntry>, ChannelError> {
		let Some(entry_hash) = self.next else {
			return Ok(None);
		};
		let entry = self.store.get(entry_hash)?;
		let creation_time: CreationTime = self.store.get(entry.data)?;
		self.next = entry.previous;
		Ok(Some(RawChannelEntry {
			channel_entry_hash: entry_hash,
			creation_time: creation_time.timestamp,
			creation_time_hash: entry.data,
			data_hash: creation_time.data,
			previous: entry.previous,
		}))
	}
}

/// An item produced by [`MostCurrentMergeIterator`].
#[derive(Debug, Clone)]
pub struct MergeItem {
	pub entry: RawChannelEntry,
	/// Index of the source chain, in construction order.
	pub source: usize,
	/// Set on the final item when common-history termination is enabled:
	/// every remaining chain continues identically below this entry.
	pub is_common_history_head: bool,
}

struct Lane {
	iter: ChainIterator,
	current: Option<RawChannelEntry>,
	source: usize,
}

pub struct MostCurrentMergeIterator {
	lanes: Vec<Lane>,
	/// Terminate with a common-history head (merge mode) instead of
	/// draining every chain to its root (query mode).
	stop_at_common_history: bool,
	primed: bool,
	done: bool,
}

impl MostCurrentMergeIterator {
	pub fn new(
		store: &Store,
		heads: Vec<Option<HashOf<ChannelEntry>>>,
		stop_at_common_history: bool,
	) -> Self {
		let lanes = heads
			.into_iter()
			.enumerate()
			.map(|(source, head)| Lane {
				iter: ChainIterator::new(store.clone(), head),
				current: None,
				source,
			})
			.collect();
		Self {
			lanes,
			stop_at_common_history,
			primed: false,
			done: false,
		}
	}

	async fn prime(&mut self) -> Result<(), ChannelError> {
		for lane in self.lanes.iter_mut() {
			lane.current = lane.iter.next().await?;
		}
		self.lanes.retain(|lane| lane.current.is_some());
		self.primed = true;
		Ok(())
	}

	/// Drops all but one lane of every group standing on the same entry.
	fn drop_shared_lanes(&mut self) {
		let mut index = 0;
		while index < self.lanes.len() {
			let hash = self.lanes[index]
				.current
				.as_ref()
				.expect("exhausted lanes are removed eagerly")
				.channel_entry_hash;
			let mut other = index + 1;
			while other < self.lanes.len() {
				let same = self.lanes[other]
					.current
					.as_ref()
					.expect("exhausted lanes are removed eagerly")
					.channel_entry_hash == hash;
				if same {
					self.lanes.remove(other);
				} else {
					other += 1;
				}
			}
			index += 1;
		}
	}

	pub async fn next(&mut self) -> Result<Option<MergeItem>, ChannelError> {
		if self.done {
			return Ok(None);
		}
		if !self.primed {
			self.prime().await?;
		}
		// Merging is chain-walking-bound; yield between entries so one busy
		// channel cannot starve the others.
		tokio::task::yield_now().await;

		self.drop_shared_lanes();
		if self.lanes.is_empty() {
			self.done = true;
			return Ok(None);
		}
		if self.stop_at_common_history && self.lanes.len() == 1 {
			self.done = true;
			let lane = &mut self.lanes[0];
			let entry = lane.current.take().expect("exhausted lanes are removed eagerly");
			return Ok(Some(MergeItem {
				entry,
				source: lane.source,
				is_common_history_head: true,
			}));
		}

		// Most current wins: greatest creation time, then greatest hash.
		let best = self
			.lanes
			.iter()
			.enumerate()
			.max_by_key(|(_, lane)| {
				lane.current
					.as_ref()
					.expect("exhausted lanes are removed eagerly")
					.order_key()
			})
			.map(|(index, _)| index)
			.expect("lanes are non-empty here");

		let lane = &mut self.lanes[best];
		let entry = lane.current.take().expect("exhausted lanes are removed eagerly");
		let source = lane.source;
		lane.current = lane.iter.next().await?;
		if lane.current.is_none() {
			self.lanes.remove(best);
		}
		Ok(Some(MergeItem {
			entry,
			source,
			is_common_history_head: false,
		}))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use weft_objects::{content_hash, Document};

	/// Builds a chain in the store from oldest to newest, returning the
	/// head and the per-entry raw hashes (oldest first).
	fn build_chain(
		store: &Store,
		base: Option<HashOf<ChannelEntry>>,
		stamps: &[(u64, &str)],
	) -> (Option<HashOf<ChannelEntry>>, Vec<HashOf<ChannelEntry>>) {
		let mut head = base;
		let mut hashes = Vec::new();
		for (timestamp, content) in stamps {
			let payload = Document {
				content: (*content).to_owned(),
			};
			let data = content_hash(&payload).raw();
			store.put_unversioned(&payload);
			let creation_time = CreationTime {
				timestamp: *timestamp,
				data,
			};
			let ct_hash = store.put_unversioned(&creation_time);
			let entry = ChannelEntry {
				previous: head,
				data: ct_hash,
			};
			let hash = store.put_unversioned(&entry);
			hashes.push(hash);
			head = Some(hash);
		}
		(head, hashes)
	}

	async fn drain(
		mut merge: MostCurrentMergeIterator,
	) -> (Vec<RawChannelEntry>, Option<RawChannelEntry>) {
		let mut unmerged = Vec::new();
		let mut common = None;
		while let Some(item) = merge.next().await.unwrap() {
			if item.is_common_history_head {
				common = Some(item.entry);
				break;
			}
			unmerged.push(item.entry);
		}
		(unmerged, common)
	}

	#[tokio::test]
	async fn test_single_chain_is_all_common_history() {
		let store = Store::new();
		let (head, hashes) = build_chain(&store, None, &[(1, "a"), (2, "b")]);
		let merge = MostCurrentMergeIterator::new(&store, vec![head], true);
		let (unmerged, common) = drain(merge).await;
		assert!(unmerged.is_empty());
		assert_eq!(common.unwrap().channel_entry_hash, hashes[1]);
	}

	#[tokio::test]
	async fn test_forked_chains_share_their_base() {
		let store = Store::new();
		let (base, base_hashes) = build_chain(&store, None, &[(1, "base")]);
		let (head_a, hashes_a) = build_chain(&store, base, &[(2, "a")]);
		let (head_b, hashes_b) = build_chain(&store, base, &[(3, "b")]);

		let merge =
			MostCurrentMergeIterator::new(&store, vec![head_a, head_b], true);
		let (unmerged, common) = drain(merge).await;

		// Newest first: b (ts 3) then a (ts 2); base is common history.
		assert_eq!(
			unmerged
				.iter()
				.map(|e| e.channel_entry_hash)
				.collect::<Vec<_>>(),
			vec![hashes_b[0], hashes_a[0]]
		);
		assert_eq!(common.unwrap().channel_entry_hash, base_hashes[0]);
	}

	#[tokio::test]
	async fn test_identical_chains_merge_to_common_history_immediately() {
		let store = Store::new();
		let (head, hashes) = build_chain(&store, None, &[(1, "a"), (2, "b")]);
		let merge =
			MostCurrentMergeIterator::new(&store, vec![head, head, head], true);
		let (unmerged, common) = drain(merge).await;
		assert!(unmerged.is_empty());
		assert_eq!(common.unwrap().channel_entry_hash, hashes[1]);
	}

	#[tokio::test]
	async fn test_equal_timestamps_break_ties_by_creation_time_hash() {
		let store = Store::new();
		let (head_a, _) = build_chain(&store, None, &[(5, "x")]);
		let (head_b, _) = build_chain(&store, None, &[(5, "y")]);

		let merge =
			MostCurrentMergeIterator::new(&store, vec![head_a, head_b], true);
		let (unmerged, common) = drain(merge).await;

		// Disjoint single-entry chains: the greater creation-time hash is
		// emitted, the other becomes the common history head.
		assert_eq!(unmerged.len(), 1);
		let common = common.unwrap();
		assert!(unmerged[0].creation_time_hash.raw() > common.creation_time_hash.raw());
	}

	#[tokio::test]
	async fn test_query_mode_drains_everything() {
		let store = Store::new();
		let (base, _) = build_chain(&store, None, &[(1, "base")]);
		let (head_a, _) = build_chain(&store, base, &[(2, "a")]);
		let (head_b, _) = build_chain(&store, base, &[(4, "b"), (6, "c")]);

		let mut merge =
			MostCurrentMergeIterator::new(&store, vec![head_a, head_b], false);
		let mut timestamps = Vec::new();
		while let Some(item) = merge.next().await.unwrap() {
			assert!(!item.is_common_history_head);
			timestamps.push(item.entry.creation_time);
		}
		// Fully drained in descending order, shared base emitted once.
		assert_eq!(timestamps, vec![6, 4, 2, 1]);
	}

	#[test]
	fn test_chain_entries_are_content_addressed() {
		let store = Store::new();
		let (head_a, _) = build_chain(&store, None, &[(1, "same")]);
		let (head_b, _) = build_chain(&store, None, &[(1, "same")]);
		assert_eq!(head_a, head_b);
	}
}
