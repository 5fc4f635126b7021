//! Pairs two in-process devices over the in-memory relay and posts one
//! entry into a channel each side merges.

use std::sync::Arc;

use color_eyre::Result;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;
use weft_channels::{ChannelManager, QueryOptions};
use weft_crypto::Keychain;
use weft_net::MemoryHub;
use weft_objects::{Document, Storable};
use weft_proto::{ConnectionsConfig, ConnectionsRuntime, NullChum};
use weft_store::Store;
use weft_trust::LeuteModel;

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let env_filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();

	tracing_subscriber::fmt()
		.with_target(true)
		.with_level(true)
		.with_env_filter(env_filter)
		.init();

	let hub = MemoryHub::new();
	let relay = Url::parse("memory://relay")?;

	let alice = LeuteModel::create(
		Store::new(),
		Arc::new(Keychain::new()),
		"alice@example.com",
		"alice-laptop",
	)?;
	let bob = LeuteModel::create(
		Store::new(),
		Arc::new(Keychain::new()),
		"bob@example.com",
		"bob-phone",
	)?;

	let runtime_a = ConnectionsRuntime::new(
		alice.clone(),
		hub.clone(),
		Arc::new(NullChum),
		ConnectionsConfig {
			commserver_url: Some(relay.clone()),
			..Default::default()
		},
	)?;
	let runtime_b = ConnectionsRuntime::new(
		bob.clone(),
		hub.clone(),
		Arc::new(NullChum),
		ConnectionsConfig {
			commserver_url: Some(relay),
			accept_incoming_connections: false,
			..Default::default()
		},
	)?;
	tokio::time::sleep(std::time::Duration::from_millis(100)).await;

	let invitation = runtime_a.create_invitation()?;
	info!(encoded = %invitation.encode(), "created invitation");
	runtime_b.connect_using_invitation(&invitation).await?;
	info!("paired: alice knows bob = {}", alice.is_known_person(bob.my_person_id()));

	let channels = ChannelManager::new(alice.store().clone(), alice.my_person_id());
	channels.create_channel("notes", None).await?;
	channels
		.post_to_channel(
			"notes",
			None,
			&Document {
				content: "hello from the demo".into(),
			}
			.into_object(),
			None,
		)
		.await?;
	for object in channels
		.get_objects(QueryOptions::channel("notes", alice.my_person_id()))
		.await?
	{
		info!(time = object.creation_time, "channel entry: {:?}", object.data);
	}

	channels.shutdown().await;
	runtime_a.shutdown();
	runtime_b.shutdown();
	Ok(())
}
