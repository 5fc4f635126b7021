//! Channel chain objects and the registry singleton.

use serde::{Deserialize, Serialize};
use weft_common::{HashOf, IdOf, RawHash};

use crate::person::Person;
use crate::{digest_id_fields, Storable, VersionedObject};

/// A per-owner append-only list. The only mutable field is `head`; versions
/// accumulate in the store and are reconciled by the channel manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub id: String,
	pub owner: IdOf<Person>,
	pub head: Option<HashOf<ChannelEntry>>,
}

impl VersionedObject for ChannelInfo {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "id": self.id, "owner": self.owner })
	}
}

impl ChannelInfo {
	pub fn id_hash_for(id: &str, owner: IdOf<Person>) -> IdOf<ChannelInfo> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({ "id": id, "owner": owner }),
		))
	}
}

/// One immutable node of a channel's singly-linked chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
	pub previous: Option<HashOf<ChannelEntry>>,
	pub data: HashOf<CreationTime>,
}

/// Timestamp wrapper around a payload reference. The pair
/// `(timestamp, content hash)` totally orders channel entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationTime {
	pub timestamp: u64,
	pub data: RawHash,
}

/// Bookkeeping for one channel inside [`ChannelRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRegistryEntry {
	pub channel_info_id_hash: IdOf<ChannelInfo>,
	pub read_version_index: u64,
	pub merged_version_index: u64,
}

/// Singleton snapshot of the channel manager's cache, persisted after every
/// merge pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRegistry {
	pub app_id: String,
	pub channels: Vec<ChannelRegistryEntry>,
}

impl VersionedObject for ChannelRegistry {
	fn id_fields(&self) -> serde_json::Value {
		serde_json::json!({ "app_id": self.app_id })
	}
}

impl ChannelRegistry {
	pub const APP_ID: &'static str = "weft.channels";

	pub fn new() -> Self {
		Self {
			app_id: Self::APP_ID.to_owned(),
			channels: Vec::new(),
		}
	}

	pub fn singleton_id_hash() -> IdOf<ChannelRegistry> {
		IdOf::from_raw(digest_id_fields(
			Self::TYPE,
			serde_json::json!({ "app_id": Self::APP_ID }),
		))
	}
}

impl Default for ChannelRegistry {
	fn default() -> Self {
		Self::new()
	}
}
