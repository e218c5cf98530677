use std::sync::Arc;

use crate::coding::DecodeError;

/// A list of every error the client can produce.
///
/// Parameter validation failures are returned synchronously and never touch
/// the network; transport failures are additionally recorded in the
/// best-effort [crate::last_error] channel.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	/// The caller provided empty or malformed input.
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),

	/// The operation requires a connected session.
	#[error("not connected")]
	NotConnected,

	/// The payload does not fit in a single datagram.
	#[error("payload too large: {size} > {max}")]
	PayloadTooLarge { size: usize, max: usize },

	/// The peer does not support QUIC datagrams.
	#[error("datagrams unsupported by peer")]
	DatagramUnsupported,

	/// Dialing or the protocol handshake failed.
	#[error("connect error: {0}")]
	Connect(Arc<anyhow::Error>),

	/// The transport failed mid-session.
	#[error("transport error: {0}")]
	Transport(Arc<dyn std::error::Error + Send + Sync>),

	/// The relay rejected the request.
	#[error("rejected by relay: {0}")]
	Rejected(String),

	#[error("decode error: {0}")]
	Decode(#[from] DecodeError),

	/// The server negotiated an unsupported protocol version.
	#[error("unsupported version: {0}")]
	Version(u64),

	#[error("timed out")]
	Timeout,

	/// The session was closed locally.
	#[error("closed")]
	Closed,
}

impl Error {
	pub(crate) fn transport<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
		Self::Transport(Arc::new(err))
	}

	/// The error code used when closing the QUIC connection.
	pub fn to_code(&self) -> u32 {
		match self {
			Self::InvalidArgument(_) => 1,
			Self::NotConnected => 2,
			Self::PayloadTooLarge { .. } => 3,
			Self::DatagramUnsupported => 4,
			Self::Connect(_) => 5,
			Self::Transport(_) => 6,
			Self::Rejected(_) => 7,
			Self::Decode(_) => 8,
			Self::Version(_) => 9,
			Self::Timeout => 10,
			Self::Closed => 11,
		}
	}

	/// Whether the failure happened at the protocol/transport layer, as
	/// opposed to local parameter validation.
	pub(crate) fn is_protocol(&self) -> bool {
		matches!(
			self,
			Self::DatagramUnsupported
				| Self::Connect(_)
				| Self::Transport(_)
				| Self::Rejected(_)
				| Self::Decode(_)
				| Self::Version(_)
		)
	}
}
