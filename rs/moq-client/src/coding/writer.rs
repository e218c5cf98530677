use bytes::BytesMut;

use crate::coding::Encode;
use crate::Error;

/// A writer for encoding messages onto a QUIC stream.
pub struct Writer {
	stream: quinn::SendStream,
	buffer: BytesMut,
}

impl Writer {
	pub fn new(stream: quinn::SendStream) -> Self {
		Self {
			stream,
			buffer: Default::default(),
		}
	}

	/// Encode the given message to the stream.
	pub async fn encode<T: Encode>(&mut self, msg: &T) -> Result<(), Error> {
		self.buffer.clear();
		msg.encode(&mut self.buffer);

		self.stream.write_all(&self.buffer).await.map_err(Error::transport)
	}

	/// Mark the stream as finished.
	pub fn finish(&mut self) {
		let _ = self.stream.finish();
	}

	/// Abort the stream with the given error code.
	pub fn reset(&mut self, code: u32) {
		let _ = self.stream.reset(code.into());
	}
}
