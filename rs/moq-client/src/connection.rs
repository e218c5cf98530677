use std::sync::{Arc, Mutex};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::registry::Registry;
use crate::session::{self, Command, Session};
use crate::{diagnostics, Client, ClientConfig, DeliveryMode, Error, Publisher, Subscriber};

/// The lifecycle of a [Connection].
///
/// `Disconnected → Connecting → Connected`, or `Connecting → Failed` when
/// the handshake fails. A mid-session transport loss returns to
/// `Disconnected`; `Failed` is terminal until the next [Connection::connect].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
	#[default]
	Disconnected = 0,
	Connecting = 1,
	Connected = 2,
	Failed = 3,
}

/// A handle to one logical session with a relay.
///
/// Cheap to clone; the underlying transport is torn down when the last
/// clone is dropped or [Connection::disconnect] is called, whichever comes
/// first. All methods hand work to a background task and never block.
#[derive(Clone)]
pub struct Connection {
	shared: Arc<Shared>,

	// Disconnects when the last public handle is dropped.
	_guard: Arc<Guard>,
}

struct Shared {
	client: Client,
	state: watch::Sender<ConnectionState>,
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	/// Bumped on every connect attempt so stale drivers can't touch state.
	epoch: u64,

	active: Option<Active>,

	/// Registered state-change observers.
	observers: Vec<mpsc::UnboundedSender<ConnectionState>>,
}

struct Active {
	/// Set by the driver once the handshake completes.
	quic: Arc<Mutex<Option<quinn::Connection>>>,

	commands: mpsc::UnboundedSender<Command>,
	registry: Registry,

	/// Dropping this cancels the driver task.
	_cancel: oneshot::Sender<()>,
}

struct Guard {
	shared: Arc<Shared>,
}

impl Drop for Guard {
	fn drop(&mut self) {
		let _ = self.shared.disconnect();
	}
}

impl Connection {
	/// Create a disconnected client with its own QUIC endpoint.
	///
	/// Must be called within a tokio runtime context.
	pub fn new(config: ClientConfig) -> Result<Self, Error> {
		let client = config.init().map_err(|err| Error::Connect(Arc::new(err)))?;

		let shared = Arc::new(Shared {
			client,
			state: watch::channel(ConnectionState::Disconnected).0,
			inner: Default::default(),
		});

		Ok(Self {
			_guard: Arc::new(Guard { shared: shared.clone() }),
			shared,
		})
	}

	/// Start connecting to the given `moq://host[:port]` URL.
	///
	/// Returns once the attempt is underway; completion is reported through
	/// the state channel as `Connected` or `Failed`. Calling this while a
	/// session is already active replaces it, logging a warning.
	pub fn connect(&self, url: &str) -> Result<(), Error> {
		if url.is_empty() {
			return Err(Error::InvalidArgument("empty url"));
		}

		let url = Url::parse(url).map_err(|_| Error::InvalidArgument("unparseable url"))?;
		if url.scheme() != crate::SCHEME {
			return Err(Error::InvalidArgument("url scheme must be 'moq'"));
		}
		if url.host_str().unwrap_or_default().is_empty() {
			return Err(Error::InvalidArgument("url missing host"));
		}

		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (cancel_tx, cancel_rx) = oneshot::channel();
		let registry = Registry::default();
		let quic = Arc::new(Mutex::new(None));

		let epoch = {
			let mut inner = self.shared.inner.lock().unwrap();

			if let Some(old) = inner.active.take() {
				tracing::warn!(%url, "connect replacing an active session");

				// Never allow two live transports at once.
				if let Some(quic) = old.quic.lock().unwrap().take() {
					quic.close(quinn::VarInt::from_u32(0), b"replaced");
				}
				old.registry.clear();
			}

			inner.epoch += 1;
			inner.active = Some(Active {
				quic: quic.clone(),
				commands: commands_tx,
				registry: registry.clone(),
				_cancel: cancel_tx,
			});

			let epoch = inner.epoch;
			self.shared.set_state_locked(&mut inner, ConnectionState::Connecting);
			epoch
		};

		let shared = self.shared.clone();
		tokio::spawn(async move {
			run_session(shared, epoch, url, quic, commands_rx, cancel_rx, registry).await;
		});

		Ok(())
	}

	/// Close the session, invalidating every derived publisher and subscriber.
	pub fn disconnect(&self) -> Result<(), Error> {
		self.shared.disconnect()
	}

	/// Whether the session is currently established. Never blocks.
	pub fn is_connected(&self) -> bool {
		self.state() == ConnectionState::Connected
	}

	/// The current state of the session.
	pub fn state(&self) -> ConnectionState {
		*self.shared.state.borrow()
	}

	/// Watch the state, collapsing rapid transitions to the latest value.
	pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
		self.shared.state.subscribe()
	}

	/// Observe every state transition, in order, exactly once each.
	///
	/// Transitions are recorded synchronously but delivered on the
	/// receiver's own task, so a slow observer never stalls the session.
	pub fn state_changes(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.shared.inner.lock().unwrap().observers.push(tx);
		rx
	}

	/// Announce a namespace for publishing, resolving on the relay's reply.
	pub async fn announce(&self, namespace: &str) -> Result<(), Error> {
		if namespace.is_empty() {
			return Err(Error::InvalidArgument("empty namespace"));
		}

		let commands = self.commands()?;
		let (tx, rx) = oneshot::channel();

		commands
			.send(Command::Announce {
				namespace: namespace.to_string(),
				reply: tx,
			})
			.map_err(|_| Error::NotConnected)?;

		rx.await.map_err(|_| Error::NotConnected)?
	}

	/// Create a publisher for a track.
	///
	/// The namespace does not need to have been announced by this handle,
	/// but the relay will refuse delivery until someone announces it.
	pub fn publisher(&self, namespace: &str, track: &str, mode: DeliveryMode) -> Result<Publisher, Error> {
		if namespace.is_empty() {
			return Err(Error::InvalidArgument("empty namespace"));
		}
		if track.is_empty() {
			return Err(Error::InvalidArgument("empty track"));
		}

		let inner = self.shared.inner.lock().unwrap();
		let active = inner.active.as_ref().ok_or(Error::NotConnected)?;
		let quic = active.quic.lock().unwrap().clone().ok_or(Error::NotConnected)?;

		// Allowed, but the relay will refuse delivery until someone announces.
		if !active.registry.is_announced(namespace) {
			tracing::warn!(namespace, "creating publisher for an unannounced namespace");
		}

		let alias = active.registry.next_alias();

		active
			.commands
			.send(Command::PublishOpen {
				alias,
				namespace: namespace.to_string(),
				track: track.to_string(),
			})
			.map_err(|_| Error::NotConnected)?;

		tracing::debug!(alias, namespace, track, ?mode, "created publisher");

		Ok(Publisher::new(
			alias,
			namespace,
			track,
			mode,
			quic,
			active.commands.clone(),
			self.shared.state.subscribe(),
		))
	}

	/// Subscribe to a track, receiving every message published to it.
	///
	/// Succeeds as soon as interest is registered, even if no publisher
	/// exists yet; a track that never produces data simply never yields.
	pub fn subscribe(&self, namespace: &str, track: &str) -> Result<Subscriber, Error> {
		if namespace.is_empty() {
			return Err(Error::InvalidArgument("empty namespace"));
		}
		if track.is_empty() {
			return Err(Error::InvalidArgument("empty track"));
		}

		let inner = self.shared.inner.lock().unwrap();
		let active = inner.active.as_ref().ok_or(Error::NotConnected)?;
		if active.quic.lock().unwrap().is_none() {
			return Err(Error::NotConnected);
		}

		let (tx, rx) = mpsc::unbounded_channel();
		let id = active.registry.insert_subscriber(namespace, track, tx);

		if active
			.commands
			.send(Command::Subscribe {
				id,
				namespace: namespace.to_string(),
				track: track.to_string(),
			})
			.is_err()
		{
			active.registry.remove_subscriber(id);
			return Err(Error::NotConnected);
		}

		tracing::debug!(id, namespace, track, "subscribed");

		Ok(Subscriber::new(id, namespace, track, rx, active.commands.clone()))
	}

	fn commands(&self) -> Result<mpsc::UnboundedSender<Command>, Error> {
		if !self.is_connected() {
			return Err(Error::NotConnected);
		}

		let inner = self.shared.inner.lock().unwrap();
		let active = inner.active.as_ref().ok_or(Error::NotConnected)?;
		Ok(active.commands.clone())
	}
}

impl Shared {
	fn disconnect(&self) -> Result<(), Error> {
		let mut inner = self.inner.lock().unwrap();
		let active = inner.active.take().ok_or(Error::NotConnected)?;

		if let Some(quic) = active.quic.lock().unwrap().take() {
			quic.close(quinn::VarInt::from_u32(0), b"disconnected");
		}

		active.registry.clear();
		drop(active); // cancels the driver task

		self.set_state_locked(&mut inner, ConnectionState::Disconnected);
		Ok(())
	}

	fn set_state(&self, epoch: u64, state: ConnectionState) {
		let mut inner = self.inner.lock().unwrap();
		if inner.epoch != epoch {
			// A newer connect attempt owns the state now.
			return;
		}

		self.set_state_locked(&mut inner, state);
	}

	/// Update the state synchronously, then queue observer notifications.
	fn set_state_locked(&self, inner: &mut Inner, state: ConnectionState) {
		if *self.state.borrow() == state {
			return;
		}

		self.state.send_replace(state);
		inner.observers.retain(|tx| tx.send(state).is_ok());

		tracing::debug!(?state, "connection state changed");
	}

	/// Drop the active session after a driver-side failure.
	fn clear_active(&self, epoch: u64) {
		let mut inner = self.inner.lock().unwrap();
		if inner.epoch != epoch {
			return;
		}

		if let Some(active) = inner.active.take() {
			active.registry.clear();
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
	shared: Arc<Shared>,
	epoch: u64,
	url: Url,
	quic_slot: Arc<Mutex<Option<quinn::Connection>>>,
	commands: mpsc::UnboundedReceiver<Command>,
	mut cancel: oneshot::Receiver<()>,
	registry: Registry,
) {
	let res = tokio::select! {
		// Cancelled while connecting; disconnect already updated the state.
		_ = &mut cancel => return,
		res = session::connect(&shared.client, &url) => res,
	};

	let (quic, writer, reader) = match res {
		Ok(session) => session,
		Err(err) => {
			diagnostics::report(&err);
			tracing::warn!(%url, %err, "connection failed");

			shared.set_state(epoch, ConnectionState::Failed);
			shared.clear_active(epoch);
			return;
		}
	};

	*quic_slot.lock().unwrap() = Some(quic.clone());
	shared.set_state(epoch, ConnectionState::Connected);

	let session = Session::new(quic.clone(), writer, commands, registry.clone());

	let res = tokio::select! {
		// Explicit disconnect; state handled there.
		_ = &mut cancel => return,
		res = session.run(reader) => res,
	};

	let err = res.err().unwrap_or(Error::Closed);
	if !matches!(err, Error::Closed) {
		diagnostics::report(&err);
		tracing::warn!(%err, "session terminated");
	}

	quic.close(quinn::VarInt::from_u32(err.to_code()), err.to_string().as_bytes());
	registry.clear();

	shared.set_state(epoch, ConnectionState::Disconnected);
	shared.clear_active(epoch);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client() -> Connection {
		let config = ClientConfig {
			bind: "0.0.0.0:0".parse().unwrap(),
			..Default::default()
		};

		Connection::new(config).expect("failed to create client")
	}

	#[tokio::test]
	async fn connect_rejects_bad_urls() {
		let connection = client();

		assert!(matches!(connection.connect(""), Err(Error::InvalidArgument(_))));
		assert!(matches!(connection.connect("not a url"), Err(Error::InvalidArgument(_))));
		assert!(matches!(
			connection.connect("https://relay.example.com"),
			Err(Error::InvalidArgument(_))
		));
		assert!(matches!(connection.connect("moq:///"), Err(Error::InvalidArgument(_))));

		// Nothing started; still disconnected.
		assert_eq!(connection.state(), ConnectionState::Disconnected);
		assert!(!connection.is_connected());
	}

	#[tokio::test]
	async fn operations_require_connect() {
		let connection = client();

		assert!(matches!(connection.disconnect(), Err(Error::NotConnected)));
		assert!(matches!(connection.announce("example").await, Err(Error::NotConnected)));
		assert!(matches!(
			connection.publisher("example", "track", DeliveryMode::Stream),
			Err(Error::NotConnected)
		));
		assert!(matches!(connection.subscribe("example", "track"), Err(Error::NotConnected)));
	}

	#[tokio::test]
	async fn validation_happens_before_state_checks() {
		let connection = client();

		assert!(matches!(
			connection.announce("").await,
			Err(Error::InvalidArgument("empty namespace"))
		));
		assert!(matches!(
			connection.publisher("", "track", DeliveryMode::Datagram),
			Err(Error::InvalidArgument("empty namespace"))
		));
		assert!(matches!(
			connection.publisher("example", "", DeliveryMode::Datagram),
			Err(Error::InvalidArgument("empty track"))
		));
		assert!(matches!(
			connection.subscribe("example", ""),
			Err(Error::InvalidArgument("empty track"))
		));
	}

	#[tokio::test]
	async fn state_is_queryable_without_blocking() {
		let connection = client();

		assert_eq!(connection.state(), ConnectionState::Disconnected);

		let watch = connection.state_watch();
		assert_eq!(*watch.borrow(), ConnectionState::Disconnected);
	}
}
