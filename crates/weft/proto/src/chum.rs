//! Handoff to the object-sync engine ("chum").
//!
//! The engine itself is an external collaborator; this module defines the
//! seam it plugs into and the barrier that aligns both sides before the
//! sync traffic starts. `chum_one_time` runs the same path with
//! `keep_running = false`: the engine returns after one quiescence instead
//! of holding the connection open.

use async_trait::async_trait;
use tracing::debug;
use weft_common::IdOf;
use weft_net::{codec, Connection};
use weft_objects::{Instance, Person};

use crate::messages::{commands, ProtocolMessage};
use crate::ProtoError;

/// Who the sync engine is talking to.
#[derive(Debug, Clone)]
pub struct ChumPeerInfo {
	pub local_person: IdOf<Person>,
	pub remote_person: IdOf<Person>,
	pub remote_instance: IdOf<Instance>,
	pub initiated_locally: bool,
}

/// The object-sync engine seam.
#[async_trait]
pub trait ChumSync: Send + Sync {
	/// Runs the sync protocol on an authenticated connection. With
	/// `keep_running` the call returns only when the connection dies;
	/// without, it returns after one synchronization pass.
	async fn run(
		&self,
		conn: &Connection,
		peer: ChumPeerInfo,
		keep_running: bool,
	) -> Result<(), ProtoError>;
}

/// Barrier: both sides send `synchronisation` and wait for the peer's.
pub async fn synchronise(conn: &Connection) -> Result<(), ProtoError> {
	codec::send_message(conn, &ProtocolMessage::Synchronisation)?;
	codec::wait_for_message::<ProtocolMessage>(conn, commands::SYNCHRONISATION).await?;
	Ok(())
}

/// A stand-in engine: runs the barrier and then idles. Used by tests and
/// by installations that only pair.
#[derive(Debug, Default)]
pub struct NullChum;

#[async_trait]
impl ChumSync for NullChum {
	async fn run(
		&self,
		conn: &Connection,
		peer: ChumPeerInfo,
		keep_running: bool,
	) -> Result<(), ProtoError> {
		synchronise(conn).await?;
		debug!(remote = %peer.remote_person, keep_running, "chum barrier passed");
		if keep_running {
			conn.wait_closed().await;
		}
		Ok(())
	}
}
