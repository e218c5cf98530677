use std::io;

use bytes::{Buf, BytesMut};

use crate::coding::{Decode, DecodeError};
use crate::Error;

/// The maximum chunk size to read from the stream at once.
const MAX_READ: usize = 32 * 1024;

/// A reader for decoding messages from a QUIC stream.
///
/// Partial data is buffered until a full message is available.
pub struct Reader {
	stream: quinn::RecvStream,
	buffer: BytesMut,
}

impl Reader {
	pub fn new(stream: quinn::RecvStream) -> Self {
		Self {
			stream,
			buffer: Default::default(),
		}
	}

	/// Decode the next message from the stream.
	pub async fn decode<T: Decode>(&mut self) -> Result<T, Error> {
		loop {
			let mut cursor = io::Cursor::new(&self.buffer[..]);
			match T::decode(&mut cursor) {
				Ok(msg) => {
					let size = cursor.position() as usize;
					self.buffer.advance(size);
					return Ok(msg);
				}
				Err(DecodeError::Short) => {
					if !self.fill().await? {
						// Stream closed while we still need more data.
						return Err(Error::Decode(DecodeError::Short));
					}
				}
				Err(e) => return Err(Error::Decode(e)),
			}
		}
	}

	/// Decode the next message, or return None if the stream is finished.
	pub async fn decode_maybe<T: Decode>(&mut self) -> Result<Option<T>, Error> {
		loop {
			let mut cursor = io::Cursor::new(&self.buffer[..]);
			match T::decode(&mut cursor) {
				Ok(msg) => {
					let size = cursor.position() as usize;
					self.buffer.advance(size);
					return Ok(Some(msg));
				}
				Err(DecodeError::Short) => {
					if !self.fill().await? {
						if self.buffer.is_empty() {
							// A clean FIN on a message boundary.
							return Ok(None);
						}

						// The stream was truncated mid-message.
						return Err(Error::Decode(DecodeError::Short));
					}
				}
				Err(e) => return Err(Error::Decode(e)),
			}
		}
	}

	/// Read more data into the buffer, returning false on FIN.
	async fn fill(&mut self) -> Result<bool, Error> {
		match self.stream.read_chunk(MAX_READ, true).await.map_err(Error::transport)? {
			Some(chunk) => {
				self.buffer.extend_from_slice(&chunk.bytes);
				Ok(true)
			}
			None => Ok(false),
		}
	}

	/// Stop reading, telling the peer we're no longer interested.
	pub fn stop(&mut self, code: u32) {
		let _ = self.stream.stop(code.into());
	}
}
