use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{mpsc, watch};

use crate::session::{self, Command};
use crate::{ConnectionState, Error};

/// How a published message travels to the relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeliveryMode {
	/// Unordered and unreliable, lowest latency. One message per QUIC
	/// datagram, so the payload must fit within the path limits.
	Datagram = 0,

	/// Reliable and ordered, any size. Messages share a dedicated QUIC
	/// stream per track, delimited so boundaries survive chunking.
	#[default]
	Stream = 1,
}

/// Publishes messages to a single track.
///
/// Bound to the connection that created it: once that connection
/// disconnects, every publish fails with [Error::NotConnected].
pub struct Publisher {
	alias: u64,
	namespace: String,
	track: String,
	mode: DeliveryMode,

	quic: quinn::Connection,
	commands: mpsc::UnboundedSender<Command>,
	state: watch::Receiver<ConnectionState>,
}

impl Publisher {
	pub(crate) fn new(
		alias: u64,
		namespace: &str,
		track: &str,
		mode: DeliveryMode,
		quic: quinn::Connection,
		commands: mpsc::UnboundedSender<Command>,
		state: watch::Receiver<ConnectionState>,
	) -> Self {
		Self {
			alias,
			namespace: namespace.to_string(),
			track: track.to_string(),
			mode,
			quic,
			commands,
			state,
		}
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn track(&self) -> &str {
		&self.track
	}

	/// The delivery mode used when none is given per call.
	pub fn mode(&self) -> DeliveryMode {
		self.mode
	}

	/// Publish one message using the default delivery mode.
	pub fn publish(&self, payload: Bytes) -> Result<(), Error> {
		self.publish_via(payload, self.mode)
	}

	/// Publish one message, overriding the delivery mode.
	///
	/// Datagram sends are fire-and-forget; stream sends are queued for the
	/// background writer. Neither blocks the caller.
	pub fn publish_via(&self, payload: Bytes, mode: DeliveryMode) -> Result<(), Error> {
		if payload.is_empty() {
			return Err(Error::InvalidArgument("empty payload"));
		}

		if *self.state.borrow() != ConnectionState::Connected {
			return Err(Error::NotConnected);
		}

		match mode {
			DeliveryMode::Datagram => self.send_datagram(payload),
			DeliveryMode::Stream => self
				.commands
				.send(Command::StreamFrame {
					alias: self.alias,
					payload,
				})
				.map_err(|_| Error::NotConnected),
		}
	}

	/// Publish UTF-8 text using the default delivery mode.
	pub fn publish_text(&self, text: &str) -> Result<(), Error> {
		self.publish_text_via(text, self.mode)
	}

	/// Publish UTF-8 text, overriding the delivery mode.
	pub fn publish_text_via(&self, text: &str, mode: DeliveryMode) -> Result<(), Error> {
		if text.is_empty() {
			return Err(Error::InvalidArgument("empty text"));
		}

		self.publish_via(Bytes::copy_from_slice(text.as_bytes()), mode)
	}

	fn send_datagram(&self, payload: Bytes) -> Result<(), Error> {
		let max = self.quic.max_datagram_size().ok_or(Error::DatagramUnsupported)?;

		// The wire datagram carries the alias before the payload.
		let overhead = crate::coding::varint_size(self.alias);
		if payload.len() + overhead > max {
			let err = Error::PayloadTooLarge {
				size: payload.len(),
				max: max.saturating_sub(overhead),
			};
			tracing::warn!(alias = self.alias, %err, "datagram rejected");
			return Err(err);
		}

		let datagram = session::encode_datagram(self.alias, &payload);

		self.quic.send_datagram(datagram).map_err(|err| {
			let err = match err {
				quinn::SendDatagramError::TooLarge => Error::PayloadTooLarge {
					size: payload.len(),
					max: max.saturating_sub(overhead),
				},
				quinn::SendDatagramError::ConnectionLost(_) => Error::NotConnected,
				err => Error::transport(err),
			};
			crate::diagnostics::report(&err);
			err
		})
	}
}

impl Drop for Publisher {
	fn drop(&mut self) {
		let _ = self.commands.send(Command::PublishClose { alias: self.alias });
	}
}
