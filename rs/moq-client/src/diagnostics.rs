use std::sync::Mutex;

use crate::Error;

// Best-effort diagnostics shared by every connection in the process.
// Intentionally racy: per-operation results are authoritative, this exists
// for logging surfaces that only have a "what went wrong last" query.
static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);

/// Record a protocol/transport-layer failure.
///
/// Parameter validation failures are ignored; they are reported through the
/// operation's own return value instead.
pub(crate) fn report(err: &Error) {
	if !err.is_protocol() {
		return;
	}

	*LAST_ERROR.lock().unwrap() = Some(err.to_string());
}

/// The most recent protocol/transport failure in this process, if any.
pub fn last_error() -> Option<String> {
	LAST_ERROR.lock().unwrap().clone()
}

/// The static build version of this library.
pub fn version() -> &'static str {
	env!("CARGO_PKG_VERSION")
}
