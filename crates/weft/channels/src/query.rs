//! Channel queries: enumerate entries across one or many channels in the
//! canonical descending order.

use weft_common::{HashOf, IdOf, RawHash};
use weft_objects::{ChannelEntry, Object, ObjectType, Person};
use weft_store::Store;

use crate::iterator::MostCurrentMergeIterator;
use crate::ChannelError;

/// Filters for [`crate::ChannelManager::get_objects`] and
/// [`crate::ChannelManager::object_iterator`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
	/// Restrict to these channel ids.
	pub channel_ids: Option<Vec<String>>,
	/// Restrict to channels of these owners.
	pub owners: Option<Vec<IdOf<Person>>>,
	/// Inclusive lower creation-time bound.
	pub from: Option<u64>,
	/// Inclusive upper creation-time bound.
	pub to: Option<u64>,
	/// Load exactly one entry, addressed as
	/// `{channel id hash}_{entry hash}`.
	pub object_id: Option<String>,
	/// Only entries whose payload has this type.
	pub object_type: Option<ObjectType>,
	/// Skip loading payloads.
	pub omit_data: bool,
	/// Hard limit, applied after ordering.
	pub count: Option<usize>,
}

impl QueryOptions {
	/// Everything in one channel.
	pub fn channel(id: &str, owner: IdOf<Person>) -> Self {
		Self {
			channel_ids: Some(vec![id.to_owned()]),
			owners: Some(vec![owner]),
			..Self::default()
		}
	}
}

/// One enumerated channel entry.
#[derive(Debug, Clone)]
pub struct ChannelObject {
	pub channel_id: String,
	pub channel_owner: IdOf<Person>,
	pub channel_entry_hash: HashOf<ChannelEntry>,
	pub creation_time: u64,
	pub creation_time_hash: HashOf<weft_objects::CreationTime>,
	pub data_hash: RawHash,
	/// Loaded payload, unless `omit_data` was set.
	pub data: Option<Object>,
	/// Stable address: `{channel id hash}_{entry hash}`.
	pub object_id: String,
}

pub(crate) fn object_id_for(channel_id_hash: RawHash, entry: HashOf<ChannelEntry>) -> String {
	format!("{}_{}", channel_id_hash.to_hex(), entry.to_hex())
}

pub(crate) fn parse_object_id(
	object_id: &str,
) -> Result<(RawHash, HashOf<ChannelEntry>), ChannelError> {
	let invalid = || ChannelError::InvalidObjectId(object_id.to_owned());
	let (channel, entry) = object_id.split_once('_').ok_or_else(invalid)?;
	let channel = RawHash::from_hex(channel).map_err(|_| invalid())?;
	let entry = HashOf::from_hex(entry).map_err(|_| invalid())?;
	Ok((channel, entry))
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelMeta {
	pub id: String,
	pub owner: IdOf<Person>,
	pub id_hash: RawHash,
}

/// Streams matching entries, most current first.
pub struct ObjectIterator {
	store: Store,
	merge: MostCurrentMergeIterator,
	metas: Vec<ChannelMeta>,
	options: QueryOptions,
	emitted: usize,
	done: bool,
}

impl ObjectIterator {
	pub(crate) fn new(
		store: Store,
		heads: Vec<Option<HashOf<ChannelEntry>>>,
		metas: Vec<ChannelMeta>,
		options: QueryOptions,
	) -> Self {
		let merge = MostCurrentMergeIterator::new(&store, heads, false);
		Self {
			store,
			merge,
			metas,
			options,
			emitted: 0,
			done: false,
		}
	}

	pub async fn next(&mut self) -> Result<Option<ChannelObject>, ChannelError> {
		loop {
			if self.done
				|| self
					.options
					.count
					.is_some_and(|count| self.emitted >= count)
			{
				return Ok(None);
			}
			let Some(item) = self.merge.next().await? else {
				self.done = true;
				return Ok(None);
			};
			let entry = item.entry;

			if self.options.to.is_some_and(|to| entry.creation_time > to) {
				continue;
			}
			if self
				.options
				.from
				.is_some_and(|from| entry.creation_time < from)
			{
				// Descending order: everything further back is older.
				self.done = true;
				return Ok(None);
			}

			// The type filter needs the payload even when data is omitted.
			let data = if !self.options.omit_data || self.options.object_type.is_some()
			{
				Some(self.store.get_object(entry.data_hash)?)
			} else {
				None
			};
			if let (Some(wanted), Some(object)) = (self.options.object_type, &data) {
				if object.object_type() != wanted {
					continue;
				}
			}

			let meta = &self.metas[item.source];
			self.emitted += 1;
			return Ok(Some(ChannelObject {
				channel_id: meta.id.clone(),
				channel_owner: meta.owner,
				channel_entry_hash: entry.channel_entry_hash,
				creation_time: entry.creation_time,
				creation_time_hash: entry.creation_time_hash,
				data_hash: entry.data_hash,
				data: if self.options.omit_data { None } else { data },
				object_id: object_id_for(meta.id_hash, entry.channel_entry_hash),
			}));
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_object_id_round_trip() {
		let channel = RawHash::digest(b"channel");
		let entry: HashOf<ChannelEntry> = HashOf::from_raw(RawHash::digest(b"entry"));
		let object_id = object_id_for(channel, entry);
		let (parsed_channel, parsed_entry) = parse_object_id(&object_id).unwrap();
		assert_eq!(parsed_channel, channel);
		assert_eq!(parsed_entry, entry);

		assert!(matches!(
			parse_object_id("garbage"),
			Err(ChannelError::InvalidObjectId(_))
		));
	}
}
