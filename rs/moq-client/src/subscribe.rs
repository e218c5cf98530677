use bytes::Bytes;
use tokio::sync::mpsc;

use crate::session::Command;

/// One complete message received from a track.
///
/// The binary payload is always present. `text` is populated only when the
/// payload is strictly valid UTF-8, so consumers can use either
/// representation without re-validating.
#[derive(Clone, Debug)]
pub struct Frame {
	pub payload: Bytes,
	pub text: Option<String>,
}

impl Frame {
	pub(crate) fn new(payload: Bytes) -> Self {
		// Strict validation: overlong encodings, bad continuation bytes,
		// surrogates, out-of-range codepoints and truncated sequences all
		// leave `text` unset.
		let text = std::str::from_utf8(&payload).ok().map(str::to_string);

		Self { payload, text }
	}
}

/// Receives messages published to a single track.
///
/// Ends (yielding `None`) when the owning connection disconnects, the relay
/// rejects the subscription, or the subscriber is dropped.
pub struct Subscriber {
	id: u64,
	namespace: String,
	track: String,

	frames: mpsc::UnboundedReceiver<Frame>,
	commands: mpsc::UnboundedSender<Command>,
}

impl Subscriber {
	pub(crate) fn new(
		id: u64,
		namespace: &str,
		track: &str,
		frames: mpsc::UnboundedReceiver<Frame>,
		commands: mpsc::UnboundedSender<Command>,
	) -> Self {
		Self {
			id,
			namespace: namespace.to_string(),
			track: track.to_string(),
			frames,
			commands,
		}
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn track(&self) -> &str {
		&self.track
	}

	/// The next complete message, in arrival order.
	///
	/// All frames for one subscriber are delivered through this single
	/// receiver, so the consumer never races itself.
	pub async fn next(&mut self) -> Option<Frame> {
		self.frames.recv().await
	}
}

impl Drop for Subscriber {
	fn drop(&mut self) {
		let _ = self.commands.send(Command::Unsubscribe { id: self.id });
	}
}
