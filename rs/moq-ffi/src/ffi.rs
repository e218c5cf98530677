use std::collections::HashSet;
use std::ffi::{c_char, c_void, CStr};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{LazyLock, Mutex};

use crate::Error;

pub(crate) static RUNTIME: LazyLock<Mutex<tokio::runtime::Handle>> = LazyLock::new(|| {
	let runtime = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()
		.unwrap();
	let handle = runtime.handle().clone();

	std::thread::Builder::new()
		.name("moq-ffi".into())
		.spawn(move || {
			runtime.block_on(std::future::pending::<()>());
		})
		.expect("failed to spawn runtime thread");

	Mutex::new(handle)
});

/// Runs the provided function in the runtime context, catching panics.
///
/// Uses a mutex to ensure Handle::enter() guards are dropped in LIFO order,
/// as required by tokio to avoid panics in multi-threaded FFI contexts.
pub(crate) fn enter<T>(f: impl FnOnce() -> T) -> Result<T, Error> {
	let handle = RUNTIME.lock().unwrap();
	let _guard = handle.enter();

	std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_| Error::Panic)
}

/// Blocks the calling thread on the given future, catching panics.
///
/// The runtime's own thread keeps driving IO and timers, so this is safe to
/// call from any foreign thread (but never from within the runtime).
pub(crate) fn block_on<T>(fut: impl Future<Output = T>) -> Result<T, Error> {
	let handle = RUNTIME.lock().unwrap().clone();

	std::panic::catch_unwind(AssertUnwindSafe(|| handle.block_on(fut))).map_err(|_| Error::Panic)
}

/// Wrapper for the C connection-state callback with user data.
pub(crate) struct OnState {
	user_data: *mut c_void,
	on_state: crate::MoqStateCallback,
}

impl OnState {
	/// # Safety
	/// - The caller must ensure user_data remains valid for the callback's lifetime.
	/// - The callback function pointer must be valid if provided.
	pub unsafe fn new(user_data: *mut c_void, on_state: crate::MoqStateCallback) -> Self {
		Self { user_data, on_state }
	}

	/// Invoke the callback with the new state.
	///
	/// Using &mut avoids the need for Sync.
	pub fn call(&mut self, state: crate::MoqConnectionState) {
		if let Some(on_state) = &self.on_state {
			on_state(self.user_data, state);
		}
	}
}

unsafe impl Send for OnState {}

/// Wrapper for the C data-received callback with user data.
pub(crate) struct OnData {
	user_data: *mut c_void,
	on_data: crate::MoqDataCallback,
}

impl OnData {
	/// # Safety
	/// - The caller must ensure user_data remains valid for the callback's lifetime.
	/// - The callback function pointer must be valid if provided.
	pub unsafe fn new(user_data: *mut c_void, on_data: crate::MoqDataCallback) -> Self {
		Self { user_data, on_data }
	}

	pub fn call(&mut self, data: &[u8]) {
		if let Some(on_data) = &self.on_data {
			on_data(self.user_data, data.as_ptr(), data.len());
		}
	}
}

unsafe impl Send for OnData {}

/// Parse a null-terminated C string into a &str.
///
/// # Safety
/// The caller must ensure the pointer is valid for 'a.
pub(crate) unsafe fn parse_cstr<'a>(cstr: *const c_char) -> Result<&'a str, Error> {
	if cstr.is_null() {
		return Err(Error::InvalidPointer);
	}

	Ok(unsafe { CStr::from_ptr(cstr) }.to_str()?)
}

/// Parse a raw pointer and size into a byte slice.
///
/// Returns an empty slice if both pointer and size are zero.
///
/// # Safety
/// The caller must ensure the data is valid for 'a.
pub(crate) unsafe fn parse_slice<'a>(data: *const u8, size: usize) -> Result<&'a [u8], Error> {
	if data.is_null() {
		if size == 0 {
			return Ok(&[]);
		}

		return Err(Error::InvalidPointer);
	}

	Ok(unsafe { std::slice::from_raw_parts(data, size) })
}

// Every handle we've given out and not yet destroyed, so destruction is
// idempotent and foreign pointers are rejected instead of dereferenced.
static HANDLES: LazyLock<Mutex<Handles>> = LazyLock::new(Default::default);

#[derive(Default)]
struct Handles {
	clients: HashSet<usize>,
	publishers: HashSet<usize>,
	subscribers: HashSet<usize>,
}

#[derive(Clone, Copy)]
pub(crate) enum Kind {
	Client,
	Publisher,
	Subscriber,
}

impl Handles {
	fn set(&mut self, kind: Kind) -> &mut HashSet<usize> {
		match kind {
			Kind::Client => &mut self.clients,
			Kind::Publisher => &mut self.publishers,
			Kind::Subscriber => &mut self.subscribers,
		}
	}
}

pub(crate) fn register<T>(kind: Kind, ptr: *mut T) {
	HANDLES.lock().unwrap().set(kind).insert(ptr as usize);
}

pub(crate) fn is_live<T>(kind: Kind, ptr: *const T) -> bool {
	!ptr.is_null() && HANDLES.lock().unwrap().set(kind).contains(&(ptr as usize))
}

/// Remove the handle, returning false if it was never (or no longer) live.
pub(crate) fn unregister<T>(kind: Kind, ptr: *mut T) -> bool {
	!ptr.is_null() && HANDLES.lock().unwrap().set(kind).remove(&(ptr as usize))
}
