//! Typed JSON messages over a connection.
//!
//! Protocol messages are single text frames: a JSON object carrying a
//! `command` field that selects the variant. Serde's internally-tagged enums
//! map onto this directly, so the codec is a thin layer over
//! [`Connection::wait_for_json_with_command`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::{Connection, ConnectionError};
use crate::pipe::Frame;

/// Serializes `message` and enqueues it as one text frame.
pub fn send_message<T: Serialize>(
	conn: &Connection,
	message: &T,
) -> Result<(), ConnectionError> {
	let text = serde_json::to_string(message)?;
	conn.send(Frame::Text(text))
}

/// Waits for the next frame, which must be the JSON message `command`, and
/// decodes it into `T`.
pub async fn wait_for_message<T: DeserializeOwned>(
	conn: &Connection,
	command: &str,
) -> Result<T, ConnectionError> {
	let value = conn.wait_for_json_with_command(command).await?;
	Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::pipe::pipe_pair;
	use serde::Deserialize;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	#[serde(tag = "command", rename_all = "snake_case")]
	enum TestMessage {
		Greeting { name: String },
		Farewell,
	}

	#[tokio::test]
	async fn test_round_trip() {
		let (a, b) = pipe_pair();
		let (a, b) = (Connection::new(a), Connection::new(b));

		send_message(
			&a,
			&TestMessage::Greeting {
				name: "weft".into(),
			},
		)
		.unwrap();
		let received: TestMessage = wait_for_message(&b, "greeting").await.unwrap();
		assert_eq!(
			received,
			TestMessage::Greeting {
				name: "weft".into()
			}
		);
	}

	#[tokio::test]
	async fn test_unexpected_command_is_a_violation() {
		let (a, b) = pipe_pair();
		let (a, b) = (Connection::new(a), Connection::new(b));

		send_message(&a, &TestMessage::Farewell).unwrap();
		let err = wait_for_message::<TestMessage>(&b, "greeting")
			.await
			.unwrap_err();
		assert!(matches!(err, ConnectionError::Violation(_)));
	}
}
