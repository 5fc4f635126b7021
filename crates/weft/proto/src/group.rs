//! Bulk-setting a group membership on a peer (`accessGroup_set`).

use tracing::info;
use weft_net::{codec, Connection};
use weft_objects::{Group, Person, VersionedObject};
use weft_trust::LeuteModel;

use crate::messages::{commands, ProtocolMessage};
use crate::ProtoError;

/// Client side: replaces the members of the peer's auth group with
/// `emails` and waits for the confirmation.
pub async fn send_members(
	conn: &Connection,
	emails: Vec<String>,
) -> Result<(), ProtoError> {
	codec::send_message(conn, &ProtocolMessage::AccessGroupMembers { persons: emails })?;
	codec::wait_for_message::<ProtocolMessage>(conn, commands::SUCCESS).await?;
	Ok(())
}

/// Server side: materializes the received emails as `Person` objects and
/// replaces the named group's membership.
pub async fn serve(
	conn: &Connection,
	leute: &LeuteModel,
	group_name: &str,
) -> Result<(), ProtoError> {
	let message: ProtocolMessage =
		codec::wait_for_message(conn, commands::ACCESS_GROUP_MEMBERS).await?;
	let ProtocolMessage::AccessGroupMembers { persons } = message else {
		unreachable!("the codec checked the command tag");
	};

	let store = leute.store();
	let mut members = Vec::new();
	for email in &persons {
		let person = Person {
			email: email.clone(),
		};
		store.put_versioned(&person);
		let id = person.id_hash();
		if !members.contains(&id) {
			members.push(id);
		}
	}
	let group = Group {
		name: group_name.to_owned(),
		members,
	};
	let group_id = group.id_hash();
	store.put_versioned(&group);

	let mut leute_root = leute.leute()?;
	if leute_root.add_group(group_id) {
		store.put_versioned(&leute_root);
	}
	info!(group = group_name, members = persons.len(), "access group set");

	codec::send_message(conn, &ProtocolMessage::Success)?;
	Ok(())
}
