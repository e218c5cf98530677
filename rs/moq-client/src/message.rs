//! Control messages exchanged on the session's bidirectional control stream.
//!
//! Each message is a varint type tag followed by the message payload.
//! Data frames never appear here; they travel on datagrams and
//! unidirectional streams, tagged with the alias negotiated via
//! [PublishOpen] or [Subscribe].

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::{Decode, DecodeError, Encode};

/// The protocol versions supported by this implementation.
pub const VERSION: u64 = 1;

/// The type tag preceding every control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
enum MessageType {
	ClientSetup = 0x1,
	ServerSetup = 0x2,
	Announce = 0x3,
	AnnounceOk = 0x4,
	AnnounceError = 0x5,
	PublishOpen = 0x6,
	Subscribe = 0x7,
	SubscribeOk = 0x8,
	SubscribeError = 0x9,
	Unsubscribe = 0xa,
}

impl Encode for MessageType {
	fn encode<W: BufMut>(&self, w: &mut W) {
		u64::from(*self).encode(w)
	}
}

impl Decode for MessageType {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let tag = u64::decode(buf)?;
		tag.try_into().map_err(|_| DecodeError::InvalidMessage(tag))
	}
}

/// Sent by the client immediately after opening the control stream.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientSetup {
	/// Supported versions, in order of preference.
	pub versions: Vec<u64>,
}

impl Encode for ClientSetup {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.versions.len().encode(w);
		for version in &self.versions {
			version.encode(w);
		}
	}
}

impl Decode for ClientSetup {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let count = usize::decode(buf)?;

		// Don't allocate more than 64 elements upfront.
		let mut versions = Vec::with_capacity(count.min(64));
		for _ in 0..count {
			versions.push(u64::decode(buf)?);
		}

		Ok(Self { versions })
	}
}

/// Sent by the server in response to [ClientSetup].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerSetup {
	/// The selected version.
	pub version: u64,
}

/// Sent by the client to announce a publishing namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Announce {
	pub namespace: String,
}

/// Sent by the relay when an announce was accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnnounceOk {
	pub namespace: String,
}

/// Sent by the relay when an announce was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnnounceError {
	pub namespace: String,
	pub reason: String,
}

/// Sent by the client before publishing to a track.
///
/// Registers the alias used to tag outgoing datagrams and data streams.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PublishOpen {
	pub alias: u64,
	pub namespace: String,
	pub track: String,
}

/// Sent by the client to request all future messages for a track.
///
/// Incoming data is tagged with the provided ID instead of the full track
/// name, to save bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Subscribe {
	pub id: u64,
	pub namespace: String,
	pub track: String,
}

/// Sent by the relay when a subscribe was accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscribeOk {
	pub id: u64,
}

/// Sent by the relay when a subscribe was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscribeError {
	pub id: u64,
	pub reason: String,
}

/// Sent by the client to stop receiving a track.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Unsubscribe {
	pub id: u64,
}

macro_rules! message_fields {
	($name:ident { $($field:ident: $ty:ty),+ $(,)? }) => {
		impl Encode for $name {
			fn encode<W: BufMut>(&self, w: &mut W) {
				$(self.$field.encode(w);)+
			}
		}

		impl Decode for $name {
			fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
				Ok(Self {
					$($field: <$ty>::decode(buf)?,)+
				})
			}
		}
	};
}

message_fields!(ServerSetup { version: u64 });
message_fields!(Announce { namespace: String });
message_fields!(AnnounceOk { namespace: String });
message_fields!(AnnounceError { namespace: String, reason: String });
message_fields!(PublishOpen { alias: u64, namespace: String, track: String });
message_fields!(Subscribe { id: u64, namespace: String, track: String });
message_fields!(SubscribeOk { id: u64 });
message_fields!(SubscribeError { id: u64, reason: String });
message_fields!(Unsubscribe { id: u64 });

/// Any message that may appear on the control stream.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlMessage {
	ClientSetup(ClientSetup),
	ServerSetup(ServerSetup),
	Announce(Announce),
	AnnounceOk(AnnounceOk),
	AnnounceError(AnnounceError),
	PublishOpen(PublishOpen),
	Subscribe(Subscribe),
	SubscribeOk(SubscribeOk),
	SubscribeError(SubscribeError),
	Unsubscribe(Unsubscribe),
}

impl Encode for ControlMessage {
	fn encode<W: BufMut>(&self, w: &mut W) {
		match self {
			Self::ClientSetup(msg) => {
				MessageType::ClientSetup.encode(w);
				msg.encode(w)
			}
			Self::ServerSetup(msg) => {
				MessageType::ServerSetup.encode(w);
				msg.encode(w)
			}
			Self::Announce(msg) => {
				MessageType::Announce.encode(w);
				msg.encode(w)
			}
			Self::AnnounceOk(msg) => {
				MessageType::AnnounceOk.encode(w);
				msg.encode(w)
			}
			Self::AnnounceError(msg) => {
				MessageType::AnnounceError.encode(w);
				msg.encode(w)
			}
			Self::PublishOpen(msg) => {
				MessageType::PublishOpen.encode(w);
				msg.encode(w)
			}
			Self::Subscribe(msg) => {
				MessageType::Subscribe.encode(w);
				msg.encode(w)
			}
			Self::SubscribeOk(msg) => {
				MessageType::SubscribeOk.encode(w);
				msg.encode(w)
			}
			Self::SubscribeError(msg) => {
				MessageType::SubscribeError.encode(w);
				msg.encode(w)
			}
			Self::Unsubscribe(msg) => {
				MessageType::Unsubscribe.encode(w);
				msg.encode(w)
			}
		}
	}
}

impl Decode for ControlMessage {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		Ok(match MessageType::decode(buf)? {
			MessageType::ClientSetup => Self::ClientSetup(ClientSetup::decode(buf)?),
			MessageType::ServerSetup => Self::ServerSetup(ServerSetup::decode(buf)?),
			MessageType::Announce => Self::Announce(Announce::decode(buf)?),
			MessageType::AnnounceOk => Self::AnnounceOk(AnnounceOk::decode(buf)?),
			MessageType::AnnounceError => Self::AnnounceError(AnnounceError::decode(buf)?),
			MessageType::PublishOpen => Self::PublishOpen(PublishOpen::decode(buf)?),
			MessageType::Subscribe => Self::Subscribe(Subscribe::decode(buf)?),
			MessageType::SubscribeOk => Self::SubscribeOk(SubscribeOk::decode(buf)?),
			MessageType::SubscribeError => Self::SubscribeError(SubscribeError::decode(buf)?),
			MessageType::Unsubscribe => Self::Unsubscribe(Unsubscribe::decode(buf)?),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	fn roundtrip(msg: ControlMessage) {
		let buf = msg.encode_bytes();
		let mut cursor = Cursor::new(buf.as_ref());
		let decoded = ControlMessage::decode(&mut cursor).unwrap();
		assert_eq!(decoded, msg);
		assert_eq!(cursor.position() as usize, buf.len());
	}

	#[test]
	fn control_roundtrip() {
		roundtrip(ControlMessage::ClientSetup(ClientSetup {
			versions: vec![VERSION, 2],
		}));
		roundtrip(ControlMessage::Announce(Announce {
			namespace: "example".into(),
		}));
		roundtrip(ControlMessage::PublishOpen(PublishOpen {
			alias: 7,
			namespace: "example".into(),
			track: "actor-position".into(),
		}));
		roundtrip(ControlMessage::SubscribeError(SubscribeError {
			id: 3,
			reason: "unknown track".into(),
		}));
	}

	#[test]
	fn unknown_tag() {
		let buf = 0x7fu64.encode_bytes();
		let mut cursor = Cursor::new(buf.as_ref());
		assert!(matches!(
			ControlMessage::decode(&mut cursor),
			Err(DecodeError::InvalidMessage(0x7f))
		));
	}

	#[test]
	fn partial_message_is_short() {
		let full = ControlMessage::Subscribe(Subscribe {
			id: 1,
			namespace: "example".into(),
			track: "chat".into(),
		})
		.encode_bytes();

		for size in 0..full.len() {
			let mut cursor = Cursor::new(&full[..size]);
			assert!(matches!(ControlMessage::decode(&mut cursor), Err(DecodeError::Short)));
		}
	}
}
