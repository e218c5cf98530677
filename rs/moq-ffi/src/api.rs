use std::ffi::{c_char, c_void, CString};
use std::ptr::null_mut;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use bytes::Bytes;
use moq_client::{ClientConfig, Connection, ConnectionState, DeliveryMode, Publisher};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use crate::ffi::{self, Kind};
use crate::{result, Error, MoqResult};

/// How long to wait for a relay acknowledgement before reporting
/// MOQ_ERROR_TIMEOUT.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state delivered to [MoqStateCallback].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoqConnectionState {
	Disconnected = 0,
	Connecting = 1,
	Connected = 2,
	Failed = 3,
}

impl From<ConnectionState> for MoqConnectionState {
	fn from(state: ConnectionState) -> Self {
		match state {
			ConnectionState::Disconnected => Self::Disconnected,
			ConnectionState::Connecting => Self::Connecting,
			ConnectionState::Connected => Self::Connected,
			ConnectionState::Failed => Self::Failed,
		}
	}
}

/// How a published message travels to the relay.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoqDeliveryMode {
	Datagram = 0,
	Stream = 1,
}

impl From<MoqDeliveryMode> for DeliveryMode {
	fn from(mode: MoqDeliveryMode) -> Self {
		match mode {
			MoqDeliveryMode::Datagram => Self::Datagram,
			MoqDeliveryMode::Stream => Self::Stream,
		}
	}
}

/// Invoked asynchronously on every connection state transition.
pub type MoqStateCallback = Option<extern "C" fn(user_data: *mut c_void, state: MoqConnectionState)>;

/// Invoked asynchronously once per complete received message.
pub type MoqDataCallback = Option<extern "C" fn(user_data: *mut c_void, data: *const u8, len: usize)>;

/// An opaque client handle.
///
/// Created by [moq_client_create], destroyed by [moq_client_destroy].
pub struct MoqClient {
	connection: Connection,

	/// Cancels the state-callback task of the previous connect call.
	state_task: Mutex<Option<oneshot::Sender<()>>>,
}

/// An opaque publisher handle, bound to one track.
pub struct MoqPublisher {
	inner: Publisher,
}

/// An opaque subscriber handle, bound to one track.
///
/// Destroying it stops the data callback and unsubscribes.
pub struct MoqSubscriber {
	_cancel: oneshot::Sender<()>,
}

/// Initialize the library's background runtime.
///
/// Optional: every entry point initializes lazily, but calling this at load
/// time surfaces startup failures early. Returns true on success.
#[no_mangle]
pub extern "C" fn moq_init() -> bool {
	std::panic::catch_unwind(|| ffi::enter(|| true).is_ok()).unwrap_or(false)
}

fn create_connection() -> Result<Connection, moq_client::Error> {
	Connection::new(ClientConfig::default()).or_else(|_| {
		// Hosts without an IPv6 stack can't bind the dual-stack default.
		Connection::new(ClientConfig {
			bind: "0.0.0.0:0".parse().unwrap(),
			..Default::default()
		})
	})
}

/// Create a new client with its own QUIC endpoint.
///
/// Returns null on failure (see `moq_last_error`).
#[no_mangle]
pub extern "C" fn moq_client_create() -> *mut MoqClient {
	ffi::enter(|| match create_connection() {
		Ok(connection) => {
			let client = Box::into_raw(Box::new(MoqClient {
				connection,
				state_task: Mutex::new(None),
			}));
			ffi::register(Kind::Client, client);
			client
		}
		Err(err) => {
			tracing::error!(%err, "failed to create client");
			null_mut()
		}
	})
	.unwrap_or(null_mut())
}

/// Destroy a client, disconnecting first if needed.
///
/// Safe to call with null or an already destroyed handle.
#[no_mangle]
pub extern "C" fn moq_client_destroy(client: *mut MoqClient) {
	let _ = ffi::enter(|| {
		if !ffi::unregister(Kind::Client, client) {
			return;
		}

		let client = unsafe { Box::from_raw(client) };
		let _ = client.connection.disconnect();
	});
}

/// Start connecting to a `moq://host[:port]` URL.
///
/// The callback fires on every subsequent state transition, from a
/// library-owned thread, with the provided user data. Calling this again
/// replaces the previous session and its callback.
#[no_mangle]
pub extern "C" fn moq_connect(
	client: *const MoqClient,
	url: *const c_char,
	on_state: MoqStateCallback,
	user_data: *mut c_void,
) -> MoqResult {
	let res = ffi::enter(|| {
		if !ffi::is_live(Kind::Client, client) {
			return Err(Error::InvalidPointer);
		}
		let client = unsafe { &*client };
		let url = unsafe { ffi::parse_cstr(url)? };
		let mut on_state = unsafe { ffi::OnState::new(user_data, on_state) };

		// Register the observer first so it sees the Connecting transition.
		let mut states = client.connection.state_changes();
		client.connection.connect(url)?;

		let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = &mut cancel_rx => break,
					state = states.recv() => match state {
						Some(state) => on_state.call(state.into()),
						None => break,
					},
				}
			}
		});

		// Dropping the previous sender stops the old callback task.
		*client.state_task.lock().unwrap() = Some(cancel_tx);

		Ok(())
	});

	result(res.and_then(|res| res))
}

/// Disconnect from the relay, invalidating derived publishers/subscribers.
#[no_mangle]
pub extern "C" fn moq_disconnect(client: *const MoqClient) -> MoqResult {
	let res = ffi::enter(|| {
		if !ffi::is_live(Kind::Client, client) {
			return Err(Error::InvalidPointer);
		}
		let client = unsafe { &*client };

		client.connection.disconnect()?;
		Ok(())
	});

	result(res.and_then(|res| res))
}

/// Whether the client currently has an established session. Never blocks.
#[no_mangle]
pub extern "C" fn moq_is_connected(client: *const MoqClient) -> bool {
	ffi::enter(|| {
		if !ffi::is_live(Kind::Client, client) {
			return false;
		}
		let client = unsafe { &*client };

		client.connection.is_connected()
	})
	.unwrap_or(false)
}

/// Announce a namespace for publishing.
///
/// Blocks the calling thread until the relay acknowledges or the bounded
/// wait expires (MOQ_ERROR_TIMEOUT). Never call from the state or data
/// callbacks.
#[no_mangle]
pub extern "C" fn moq_announce_namespace(client: *const MoqClient, namespace: *const c_char) -> MoqResult {
	let res = (|| {
		if !ffi::is_live(Kind::Client, client) {
			return Err(Error::InvalidPointer);
		}
		let client = unsafe { &*client };
		let namespace = unsafe { ffi::parse_cstr(namespace)? }.to_string();
		let connection = client.connection.clone();

		match ffi::block_on(async move { tokio::time::timeout(ANNOUNCE_TIMEOUT, connection.announce(&namespace)).await })? {
			Ok(res) => Ok(res?),
			Err(_) => Err(moq_client::Error::Timeout.into()),
		}
	})();

	result(res)
}

/// Create a publisher for a track, using Stream delivery by default.
///
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn moq_create_publisher(
	client: *const MoqClient,
	namespace: *const c_char,
	track: *const c_char,
) -> *mut MoqPublisher {
	moq_create_publisher_ex(client, namespace, track, MoqDeliveryMode::Stream)
}

/// Create a publisher for a track with an explicit default delivery mode.
///
/// Returns null on failure; the connection must be established first.
#[no_mangle]
pub extern "C" fn moq_create_publisher_ex(
	client: *const MoqClient,
	namespace: *const c_char,
	track: *const c_char,
	mode: MoqDeliveryMode,
) -> *mut MoqPublisher {
	let res = ffi::enter(|| {
		if !ffi::is_live(Kind::Client, client) {
			return Err(Error::InvalidPointer);
		}
		let client = unsafe { &*client };
		let namespace = unsafe { ffi::parse_cstr(namespace)? };
		let track = unsafe { ffi::parse_cstr(track)? };

		let publisher = client.connection.publisher(namespace, track, mode.into())?;

		let publisher = Box::into_raw(Box::new(MoqPublisher { inner: publisher }));
		ffi::register(Kind::Publisher, publisher);
		Ok(publisher)
	});

	match res.and_then(|res| res) {
		Ok(publisher) => publisher,
		Err(err) => {
			tracing::error!(%err, "failed to create publisher");
			null_mut()
		}
	}
}

/// Destroy a publisher. Safe to call with null or twice.
#[no_mangle]
pub extern "C" fn moq_publisher_destroy(publisher: *mut MoqPublisher) {
	let _ = ffi::enter(|| {
		if !ffi::unregister(Kind::Publisher, publisher) {
			return;
		}

		drop(unsafe { Box::from_raw(publisher) });
	});
}

/// Publish a binary payload to the publisher's track.
///
/// Datagram mode is fire-and-forget and size-bounded; stream mode is
/// reliable and ordered. Neither blocks.
#[no_mangle]
pub extern "C" fn moq_publish_data(
	publisher: *const MoqPublisher,
	data: *const u8,
	len: usize,
	mode: MoqDeliveryMode,
) -> MoqResult {
	let res = ffi::enter(|| {
		if !ffi::is_live(Kind::Publisher, publisher) {
			return Err(Error::InvalidPointer);
		}
		let publisher = unsafe { &*publisher };
		let payload = unsafe { ffi::parse_slice(data, len)? };

		publisher
			.inner
			.publish_via(Bytes::copy_from_slice(payload), mode.into())?;
		Ok(())
	});

	result(res.and_then(|res| res))
}

/// Publish a null-terminated UTF-8 string to the publisher's track.
#[no_mangle]
pub extern "C" fn moq_publish_text(
	publisher: *const MoqPublisher,
	text: *const c_char,
	mode: MoqDeliveryMode,
) -> MoqResult {
	let res = ffi::enter(|| {
		if !ffi::is_live(Kind::Publisher, publisher) {
			return Err(Error::InvalidPointer);
		}
		let publisher = unsafe { &*publisher };
		let text = unsafe { ffi::parse_cstr(text)? };

		publisher.inner.publish_text_via(text, mode.into())?;
		Ok(())
	});

	result(res.and_then(|res| res))
}

/// Subscribe to a track.
///
/// The callback fires once per complete received message, from a
/// library-owned thread. Returns null on failure; the connection must be
/// established first.
#[no_mangle]
pub extern "C" fn moq_subscribe(
	client: *const MoqClient,
	namespace: *const c_char,
	track: *const c_char,
	on_data: MoqDataCallback,
	user_data: *mut c_void,
) -> *mut MoqSubscriber {
	let res = ffi::enter(|| {
		if !ffi::is_live(Kind::Client, client) {
			return Err(Error::InvalidPointer);
		}
		let client = unsafe { &*client };
		let namespace = unsafe { ffi::parse_cstr(namespace)? };
		let track = unsafe { ffi::parse_cstr(track)? };
		let mut on_data = unsafe { ffi::OnData::new(user_data, on_data) };

		let mut subscriber = client.connection.subscribe(namespace, track)?;

		let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = &mut cancel_rx => break,
					frame = subscriber.next() => match frame {
						Some(frame) => on_data.call(&frame.payload),
						None => break,
					},
				}
			}
		});

		let subscriber = Box::into_raw(Box::new(MoqSubscriber { _cancel: cancel_tx }));
		ffi::register(Kind::Subscriber, subscriber);
		Ok(subscriber)
	});

	match res.and_then(|res| res) {
		Ok(subscriber) => subscriber,
		Err(err) => {
			tracing::error!(%err, "failed to subscribe");
			null_mut()
		}
	}
}

/// Destroy a subscriber, stopping its callback. Safe to call with null or twice.
#[no_mangle]
pub extern "C" fn moq_subscriber_destroy(subscriber: *mut MoqSubscriber) {
	let _ = ffi::enter(|| {
		if !ffi::unregister(Kind::Subscriber, subscriber) {
			return;
		}

		drop(unsafe { Box::from_raw(subscriber) });
	});
}

/// The static library version. The caller must not free the result.
#[no_mangle]
pub extern "C" fn moq_version() -> *const c_char {
	concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

static LAST_ERROR: LazyLock<Mutex<CString>> = LazyLock::new(|| Mutex::new(CString::default()));

/// The most recent transport-layer failure, or an empty string.
///
/// Best-effort diagnostics only: racy across connections, and the returned
/// pointer is valid until the next call. The caller must not free it.
#[no_mangle]
pub extern "C" fn moq_last_error() -> *const c_char {
	let message = moq_client::last_error().unwrap_or_default();

	let mut guard = LAST_ERROR.lock().unwrap();
	*guard = CString::new(message).unwrap_or_default();
	guard.as_ptr()
}

/// Release a message returned inside a [MoqResult]. Safe to call with null.
#[no_mangle]
pub extern "C" fn moq_free_str(message: *mut c_char) {
	if !message.is_null() {
		drop(unsafe { CString::from_raw(message) });
	}
}

/// Install a stderr logger with the given filter (defaults to "info").
///
/// May be called once per process; RUST_LOG overrides the filter.
#[no_mangle]
pub extern "C" fn moq_log_init(level: *const c_char) -> MoqResult {
	let res = (|| {
		let level = match level.is_null() {
			true => "info",
			false => unsafe { ffi::parse_cstr(level)? },
		};

		let directive = level.parse().map_err(|err: tracing_subscriber::filter::ParseError| {
			Error::LogFilter(err.to_string())
		})?;

		let filter = EnvFilter::builder()
			.with_default_directive(directive)
			.from_env_lossy();

		let logger = tracing_subscriber::fmt()
			.with_writer(std::io::stderr)
			.with_env_filter(filter)
			.finish();

		tracing::subscriber::set_global_default(logger).map_err(|err| Error::LogFilter(err.to_string()))?;
		Ok(())
	})();

	result(res)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{MOQ_ERROR_INVALID_ARGUMENT, MOQ_ERROR_INVALID_POINTER, MOQ_ERROR_NOT_CONNECTED, MOQ_OK};
	use std::ffi::CStr;

	// Serialize tests that create and destroy handles, so a freed address
	// can't be reused by a concurrent test before we probe it.
	static TEST_LOCK: Mutex<()> = Mutex::new(());

	fn lock() -> std::sync::MutexGuard<'static, ()> {
		TEST_LOCK.lock().unwrap_or_else(|err| err.into_inner())
	}

	fn cstr(s: &str) -> CString {
		CString::new(s).unwrap()
	}

	fn free(res: MoqResult) -> i32 {
		moq_free_str(res.message);
		res.code
	}

	#[test]
	fn init_succeeds() {
		assert!(moq_init());
	}

	#[test]
	fn version_is_static() {
		let version = moq_version();
		assert!(!version.is_null());

		let version = unsafe { CStr::from_ptr(version) }.to_str().unwrap();
		assert!(!version.is_empty());
	}

	#[test]
	fn destroy_is_idempotent() {
		let _guard = lock();

		moq_client_destroy(null_mut());

		let client = moq_client_create();
		assert!(!client.is_null());

		moq_client_destroy(client);
		moq_client_destroy(client);

		moq_publisher_destroy(null_mut());
		moq_subscriber_destroy(null_mut());
		moq_free_str(null_mut());
	}

	#[test]
	fn stale_handles_are_rejected() {
		let _guard = lock();

		let client = moq_client_create();
		moq_client_destroy(client);

		assert_eq!(free(moq_disconnect(client)), MOQ_ERROR_INVALID_POINTER);
		assert!(!moq_is_connected(client));
		assert_eq!(
			free(moq_announce_namespace(client, cstr("example").as_ptr())),
			MOQ_ERROR_INVALID_POINTER
		);
	}

	#[test]
	fn connect_validates_input() {
		let _guard = lock();

		let client = moq_client_create();
		assert!(!client.is_null());

		assert_eq!(
			free(moq_connect(client, std::ptr::null(), None, null_mut())),
			MOQ_ERROR_INVALID_POINTER
		);
		assert_eq!(
			free(moq_connect(client, cstr("").as_ptr(), None, null_mut())),
			MOQ_ERROR_INVALID_ARGUMENT
		);
		assert_eq!(
			free(moq_connect(client, cstr("https://relay.example.com").as_ptr(), None, null_mut())),
			MOQ_ERROR_INVALID_ARGUMENT
		);

		moq_client_destroy(client);
	}

	#[test]
	fn operations_require_connection() {
		let _guard = lock();

		let client = moq_client_create();
		assert!(!client.is_null());

		assert!(!moq_is_connected(client));
		assert_eq!(free(moq_disconnect(client)), MOQ_ERROR_NOT_CONNECTED);
		assert_eq!(
			free(moq_announce_namespace(client, cstr("example").as_ptr())),
			MOQ_ERROR_NOT_CONNECTED
		);

		let publisher = moq_create_publisher_ex(
			client,
			cstr("example").as_ptr(),
			cstr("actor-position").as_ptr(),
			MoqDeliveryMode::Stream,
		);
		assert!(publisher.is_null());

		let subscriber = moq_subscribe(
			client,
			cstr("example").as_ptr(),
			cstr("actor-position").as_ptr(),
			None,
			null_mut(),
		);
		assert!(subscriber.is_null());

		moq_client_destroy(client);
	}

	#[test]
	fn results_carry_messages() {
		let _guard = lock();

		let client = moq_client_create();

		let res = moq_disconnect(client);
		assert_eq!(res.code, MOQ_ERROR_NOT_CONNECTED);
		assert!(!res.message.is_null());

		let message = unsafe { CStr::from_ptr(res.message) }.to_str().unwrap().to_string();
		assert_eq!(message, "not connected");
		moq_free_str(res.message);

		let ok = moq_connect(client, cstr("moq://relay.invalid").as_ptr(), None, null_mut());
		assert_eq!(ok.code, MOQ_OK);
		assert!(ok.message.is_null());

		moq_client_destroy(client);
	}
}
