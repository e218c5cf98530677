use std::ffi::{c_char, CString};

/// The operation succeeded.
pub const MOQ_OK: i32 = 0;

/// The caller provided empty or malformed input.
pub const MOQ_ERROR_INVALID_ARGUMENT: i32 = -1;

/// The operation requires a connected client.
pub const MOQ_ERROR_NOT_CONNECTED: i32 = -2;

/// The payload does not fit in a single datagram.
pub const MOQ_ERROR_PAYLOAD_TOO_LARGE: i32 = -3;

/// The transport or the relay failed.
pub const MOQ_ERROR_TRANSPORT: i32 = -4;

/// The bounded wait for a relay reply expired.
pub const MOQ_ERROR_TIMEOUT: i32 = -5;

/// A handle was null, already destroyed, or not created by this library.
pub const MOQ_ERROR_INVALID_POINTER: i32 = -6;

/// The library caught a panic at the FFI boundary.
pub const MOQ_ERROR_PANIC: i32 = -7;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Client(#[from] moq_client::Error),

	#[error("invalid pointer")]
	InvalidPointer,

	#[error("invalid utf-8 in argument")]
	Utf8(#[from] std::str::Utf8Error),

	#[error("invalid log filter: {0}")]
	LogFilter(String),

	#[error("panic")]
	Panic,
}

impl Error {
	pub fn code(&self) -> i32 {
		use moq_client::Error as Client;

		match self {
			Self::Client(err) => match err {
				Client::InvalidArgument(_) => MOQ_ERROR_INVALID_ARGUMENT,
				Client::NotConnected | Client::Closed => MOQ_ERROR_NOT_CONNECTED,
				Client::PayloadTooLarge { .. } => MOQ_ERROR_PAYLOAD_TOO_LARGE,
				Client::Timeout => MOQ_ERROR_TIMEOUT,
				_ => MOQ_ERROR_TRANSPORT,
			},
			Self::InvalidPointer => MOQ_ERROR_INVALID_POINTER,
			Self::Utf8(_) => MOQ_ERROR_INVALID_ARGUMENT,
			Self::LogFilter(_) => MOQ_ERROR_INVALID_ARGUMENT,
			Self::Panic => MOQ_ERROR_PANIC,
		}
	}
}

/// The outcome of a fallible operation.
///
/// `code` is [MOQ_OK] or one of the negative `MOQ_ERROR_*` values. On
/// failure `message` holds a human-readable description that must be
/// released with [crate::moq_free_str]; on success it is null.
#[repr(C)]
pub struct MoqResult {
	pub code: i32,
	pub message: *mut c_char,
}

impl MoqResult {
	pub(crate) fn ok() -> Self {
		Self {
			code: MOQ_OK,
			message: std::ptr::null_mut(),
		}
	}

	pub(crate) fn err(err: Error) -> Self {
		tracing::error!(%err, "operation failed");

		let message = CString::new(err.to_string())
			.unwrap_or_default()
			.into_raw();

		Self {
			code: err.code(),
			message,
		}
	}
}

pub(crate) fn result(res: Result<(), Error>) -> MoqResult {
	match res {
		Ok(()) => MoqResult::ok(),
		Err(err) => MoqResult::err(err),
	}
}
