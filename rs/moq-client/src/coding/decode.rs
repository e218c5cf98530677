use std::string::FromUtf8Error;

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Refuse to buffer a single length-prefixed value larger than this.
const MAX_SIZE: usize = 1 << 24;

/// Read the value from the buffer.
///
/// If [DecodeError::Short] is returned, the caller should try again with more data.
pub trait Decode: Sized {
	/// Decode the value from the given buffer.
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError>;
}

/// A decode error.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
	#[error("short buffer")]
	Short,

	#[error("invalid string")]
	InvalidString(#[from] FromUtf8Error),

	#[error("invalid message: {0:?}")]
	InvalidMessage(u64),

	#[error("invalid value")]
	InvalidValue,

	#[error("bounds exceeded")]
	BoundsExceeded,
}

impl Decode for u8 {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		match buf.has_remaining() {
			true => Ok(buf.get_u8()),
			false => Err(DecodeError::Short),
		}
	}
}

/// QUIC variable-length integer (RFC 9000 §16).
impl Decode for u64 {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		if !buf.has_remaining() {
			return Err(DecodeError::Short);
		}

		let first = buf.get_u8();
		let tag = first >> 6;
		let mut v = (first & 0b0011_1111) as u64;

		let extra = match tag {
			0b00 => 0,
			0b01 => 1,
			0b10 => 3,
			_ => 7,
		};

		if buf.remaining() < extra {
			return Err(DecodeError::Short);
		}

		for _ in 0..extra {
			v = (v << 8) | buf.get_u8() as u64;
		}

		Ok(v)
	}
}

impl Decode for usize {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let v = u64::decode(buf)?;
		usize::try_from(v).map_err(|_| DecodeError::BoundsExceeded)
	}
}

impl Decode for String {
	/// Decode a string with a varint length prefix.
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let v = Vec::<u8>::decode(buf)?;
		let str = String::from_utf8(v)?;

		Ok(str)
	}
}

impl Decode for Vec<u8> {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let bytes = Bytes::decode(buf)?;
		Ok(bytes.to_vec())
	}
}

impl Decode for Bytes {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let len = usize::decode(buf)?;
		if len > MAX_SIZE {
			return Err(DecodeError::BoundsExceeded);
		}

		if buf.remaining() < len {
			return Err(DecodeError::Short);
		}

		Ok(buf.copy_to_bytes(len))
	}
}
