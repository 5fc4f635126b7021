//! Symmetric encryption plugin.
//!
//! Installed wire-side once the route handshake derived the shared key.
//! Every outbound frame becomes one binary frame: a one-byte kind tag and
//! the payload, sealed with an embedded nonce. Inbound plaintext after the
//! plugin is active is a protocol violation and kills the connection.

use bytes::Bytes;
use weft_crypto::{open, seal, SymmetricKey};

use super::{InboundEvent, OutboundEvent, Plugin, PluginError};
use crate::pipe::Frame;

const TAG_TEXT: u8 = 1;
const TAG_BINARY: u8 = 2;

pub struct Encryption {
	key: SymmetricKey,
}

impl Encryption {
	pub fn new(key: SymmetricKey) -> Self {
		Self { key }
	}

	fn encrypt(&self, frame: Frame) -> Frame {
		let mut plain = Vec::with_capacity(1 + frame_len(&frame));
		match frame {
			Frame::Text(text) => {
				plain.push(TAG_TEXT);
				plain.extend_from_slice(text.as_bytes());
			}
			Frame::Binary(bytes) => {
				plain.push(TAG_BINARY);
				plain.extend_from_slice(&bytes);
			}
		}
		Frame::Binary(Bytes::from(seal(&self.key, &plain)))
	}

	fn decrypt(&self, data: &[u8]) -> Result<Frame, PluginError> {
		let plain = open(&self.key, data)
			.map_err(|e| PluginError::new("encryption", e.to_string()))?;
		match plain.split_first() {
			Some((&TAG_TEXT, rest)) => {
				let text = String::from_utf8(rest.to_vec()).map_err(|_| {
					PluginError::new("encryption", "text frame is not valid utf-8")
				})?;
				Ok(Frame::Text(text))
			}
			Some((&TAG_BINARY, rest)) => {
				Ok(Frame::Binary(Bytes::from(rest.to_vec())))
			}
			_ => Err(PluginError::new("encryption", "malformed frame kind tag")),
		}
	}
}

fn frame_len(frame: &Frame) -> usize {
	match frame {
		Frame::Text(text) => text.len(),
		Frame::Binary(bytes) => bytes.len(),
	}
}

impl Plugin for Encryption {
	fn name(&self) -> &'static str {
		"encryption"
	}

	fn transform_inbound(
		&mut self,
		event: InboundEvent,
	) -> Result<Option<InboundEvent>, PluginError> {
		match event {
			InboundEvent::Message(Frame::Binary(data)) => {
				Ok(Some(InboundEvent::Message(self.decrypt(&data)?)))
			}
			InboundEvent::Message(Frame::Text(_)) => Err(PluginError::new(
				"encryption",
				"received a plaintext frame on an encrypted connection",
			)),
			other => Ok(Some(other)),
		}
	}

	fn transform_outbound(
		&mut self,
		event: OutboundEvent,
	) -> Result<Option<OutboundEvent>, PluginError> {
		match event {
			OutboundEvent::Message(frame) => {
				Ok(Some(OutboundEvent::Message(self.encrypt(frame))))
			}
			other => Ok(Some(other)),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use weft_crypto::CryptoApi;

	fn pair() -> (Encryption, Encryption) {
		let a = CryptoApi::generate();
		let b = CryptoApi::generate();
		let key_a = a.derive_shared_key(&b.public_encryption_key());
		let key_b = b.derive_shared_key(&a.public_encryption_key());
		(Encryption::new(key_a), Encryption::new(key_b))
	}

	fn roundtrip(sender: &mut Encryption, receiver: &mut Encryption, frame: Frame) -> Frame {
		let out = sender
			.transform_outbound(OutboundEvent::Message(frame))
			.unwrap()
			.unwrap();
		let OutboundEvent::Message(wire) = out else {
			panic!("expected a message event");
		};
		assert!(matches!(wire, Frame::Binary(_)));
		let inbound = receiver
			.transform_inbound(InboundEvent::Message(wire))
			.unwrap()
			.unwrap();
		let InboundEvent::Message(frame) = inbound else {
			panic!("expected a message event");
		};
		frame
	}

	#[test]
	fn test_text_and_binary_round_trip() {
		let (mut a, mut b) = pair();
		assert_eq!(
			roundtrip(&mut a, &mut b, Frame::Text("hello".into())),
			Frame::Text("hello".into())
		);
		assert_eq!(
			roundtrip(&mut a, &mut b, Frame::Binary(Bytes::from_static(&[0, 1, 2]))),
			Frame::Binary(Bytes::from_static(&[0, 1, 2]))
		);
	}

	#[test]
	fn test_plaintext_inbound_is_fatal() {
		let (mut a, _) = pair();
		assert!(a
			.transform_inbound(InboundEvent::Message(Frame::Text("plain".into())))
			.is_err());
	}

	#[test]
	fn test_tampered_ciphertext_is_fatal() {
		let (mut a, mut b) = pair();
		let out = a
			.transform_outbound(OutboundEvent::Message(Frame::Text("x".into())))
			.unwrap()
			.unwrap();
		let OutboundEvent::Message(Frame::Binary(wire)) = out else {
			panic!("expected binary");
		};
		let mut tampered = wire.to_vec();
		*tampered.last_mut().unwrap() ^= 0xff;
		assert!(b
			.transform_inbound(InboundEvent::Message(Frame::Binary(Bytes::from(
				tampered
			))))
			.is_err());
	}
}
