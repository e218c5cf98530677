use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::coding::{Decode, Encode, Reader, Writer};
use crate::message::{self, ClientSetup, ControlMessage};
use crate::registry::Registry;
use crate::{Client, Error};

/// Commands handed from the public handles to the session driver.
pub(crate) enum Command {
	Announce {
		namespace: String,
		reply: oneshot::Sender<Result<(), Error>>,
	},
	PublishOpen {
		alias: u64,
		namespace: String,
		track: String,
	},
	PublishClose {
		alias: u64,
	},
	StreamFrame {
		alias: u64,
		payload: Bytes,
	},
	Subscribe {
		id: u64,
		namespace: String,
		track: String,
	},
	Unsubscribe {
		id: u64,
	},
}

/// Dial the relay and perform the protocol handshake.
pub(crate) async fn connect(client: &Client, url: &Url) -> Result<(quinn::Connection, Writer, Reader), Error> {
	let quic = client
		.connect(url)
		.await
		.map_err(|err| Error::Connect(Arc::new(err)))?;

	let (send, recv) = quic.open_bi().await.map_err(Error::transport)?;
	let mut writer = Writer::new(send);
	let mut reader = Reader::new(recv);

	let setup = ClientSetup {
		versions: vec![message::VERSION],
	};
	tracing::trace!(?setup, "sending client setup");
	writer.encode(&ControlMessage::ClientSetup(setup)).await?;

	let server = match reader.decode::<ControlMessage>().await? {
		ControlMessage::ServerSetup(msg) => msg,
		msg => {
			tracing::warn!(?msg, "expected server setup");
			return Err(Error::Decode(crate::coding::DecodeError::InvalidValue));
		}
	};
	tracing::trace!(?server, "received server setup");

	if server.version != message::VERSION {
		return Err(Error::Version(server.version));
	}

	tracing::debug!(version = server.version, "connected");

	Ok((quic, writer, reader))
}

/// One iteration of the driver loop.
enum Event {
	Control(ControlMessage),
	Command(Option<Command>),
	Datagram(Bytes),
	Stream(quinn::RecvStream),
}

/// The background task driving one established session.
pub(crate) struct Session {
	quic: quinn::Connection,
	control: Writer,
	commands: mpsc::UnboundedReceiver<Command>,
	registry: Registry,

	/// Announces awaiting a relay reply, by namespace.
	announces: HashMap<String, oneshot::Sender<Result<(), Error>>>,

	/// Data stream writer tasks, by publisher alias.
	streams: HashMap<u64, mpsc::UnboundedSender<Bytes>>,
}

impl Session {
	pub fn new(
		quic: quinn::Connection,
		control: Writer,
		commands: mpsc::UnboundedReceiver<Command>,
		registry: Registry,
	) -> Self {
		Self {
			quic,
			control,
			commands,
			registry,
			announces: HashMap::new(),
			streams: HashMap::new(),
		}
	}

	/// Run until the transport fails or every command sender is dropped.
	pub async fn run(mut self, mut reader: Reader) -> Result<(), Error> {
		loop {
			let event = tokio::select! {
				msg = reader.decode::<ControlMessage>() => Event::Control(msg?),
				cmd = self.commands.recv() => Event::Command(cmd),
				datagram = self.quic.read_datagram() => Event::Datagram(datagram.map_err(Error::transport)?),
				stream = self.quic.accept_uni() => Event::Stream(stream.map_err(Error::transport)?),
			};

			match event {
				Event::Control(msg) => self.recv_control(msg)?,
				Event::Command(Some(cmd)) => self.send_command(cmd).await?,
				// Every handle is gone; nothing left to drive.
				Event::Command(None) => return Err(Error::Closed),
				Event::Datagram(datagram) => self.recv_datagram(datagram)?,
				Event::Stream(stream) => self.accept_stream(stream),
			}
		}
	}

	fn recv_control(&mut self, msg: ControlMessage) -> Result<(), Error> {
		tracing::trace!(?msg, "received control message");

		match msg {
			ControlMessage::AnnounceOk(msg) => {
				self.registry.announce(&msg.namespace);

				match self.announces.remove(&msg.namespace) {
					Some(reply) => {
						let _ = reply.send(Ok(()));
					}
					None => tracing::warn!(namespace = %msg.namespace, "announce ok for unknown namespace"),
				}
			}
			ControlMessage::AnnounceError(msg) => match self.announces.remove(&msg.namespace) {
				Some(reply) => {
					let _ = reply.send(Err(Error::Rejected(msg.reason)));
				}
				None => tracing::warn!(namespace = %msg.namespace, "announce error for unknown namespace"),
			},
			ControlMessage::SubscribeOk(msg) => {
				tracing::debug!(id = msg.id, "subscribe acknowledged");
			}
			ControlMessage::SubscribeError(msg) => {
				tracing::warn!(id = msg.id, reason = %msg.reason, "subscribe rejected");

				// End just this subscriber; the rest of the session is fine.
				self.registry.remove_subscriber(msg.id);
			}
			msg => {
				tracing::warn!(?msg, "unexpected control message");
				return Err(Error::Decode(crate::coding::DecodeError::InvalidValue));
			}
		}

		Ok(())
	}

	async fn send_command(&mut self, cmd: Command) -> Result<(), Error> {
		match cmd {
			Command::Announce { namespace, reply } => {
				// A replaced announce resolves the prior waiter as closed.
				if let Some(prev) = self.announces.insert(namespace.clone(), reply) {
					let _ = prev.send(Err(Error::Closed));
				}

				self.control
					.encode(&ControlMessage::Announce(message::Announce { namespace }))
					.await?;
			}
			Command::PublishOpen { alias, namespace, track } => {
				self.registry.insert_publisher(alias, &namespace, &track);

				self.control
					.encode(&ControlMessage::PublishOpen(message::PublishOpen {
						alias,
						namespace,
						track,
					}))
					.await?;
			}
			Command::PublishClose { alias } => {
				if let Some((namespace, track)) = self.registry.remove_publisher(alias) {
					tracing::debug!(alias, %namespace, %track, "publisher closed");
				}

				// Dropping the sender finishes the data stream, if any.
				self.streams.remove(&alias);
			}
			Command::StreamFrame { alias, payload } => {
				let stream = self
					.streams
					.entry(alias)
					.or_insert_with(|| spawn_stream_writer(self.quic.clone(), alias));

				if stream.send(payload).is_err() {
					// The writer task died; a fresh stream is opened on the next frame.
					tracing::warn!(alias, "dropping frame for failed data stream");
					self.streams.remove(&alias);
				}
			}
			Command::Subscribe { id, namespace, track } => {
				self.control
					.encode(&ControlMessage::Subscribe(message::Subscribe { id, namespace, track }))
					.await?;
			}
			Command::Unsubscribe { id } => {
				self.registry.remove_subscriber(id);

				self.control
					.encode(&ControlMessage::Unsubscribe(message::Unsubscribe { id }))
					.await?;
			}
		}

		Ok(())
	}

	/// A datagram carries the subscribe id followed by one whole message.
	fn recv_datagram(&mut self, mut datagram: Bytes) -> Result<(), Error> {
		let id = match u64::decode(&mut datagram) {
			Ok(id) => id,
			Err(_) => {
				tracing::warn!("dropping malformed datagram");
				return Ok(());
			}
		};

		self.registry.deliver(id, datagram);
		Ok(())
	}

	/// A unidirectional stream carries the subscribe id followed by
	/// length-prefixed messages until FIN.
	fn accept_stream(&mut self, stream: quinn::RecvStream) {
		let registry = self.registry.clone();

		tokio::spawn(async move {
			if let Err(err) = run_stream_reader(stream, registry).await {
				crate::diagnostics::report(&err);
				tracing::warn!(%err, "data stream failed");
			}
		});
	}
}

async fn run_stream_reader(stream: quinn::RecvStream, registry: Registry) -> Result<(), Error> {
	let mut reader = Reader::new(stream);

	let id: u64 = reader.decode().await?;

	while let Some(payload) = reader.decode_maybe::<Bytes>().await? {
		registry.deliver(id, payload);
	}

	Ok(())
}

fn spawn_stream_writer(quic: quinn::Connection, alias: u64) -> mpsc::UnboundedSender<Bytes> {
	let (tx, rx) = mpsc::unbounded_channel();

	tokio::spawn(async move {
		if let Err(err) = run_stream_writer(quic, alias, rx).await {
			crate::diagnostics::report(&err);
			tracing::warn!(alias, %err, "publish stream failed");
		}
	});

	tx
}

async fn run_stream_writer(
	quic: quinn::Connection,
	alias: u64,
	mut frames: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), Error> {
	let send = quic.open_uni().await.map_err(Error::transport)?;
	let mut writer = Writer::new(send);

	writer.encode(&alias).await?;

	while let Some(payload) = frames.recv().await {
		writer.encode(&payload).await?;
	}

	writer.finish();
	Ok(())
}

/// Build the datagram for a single publish: the alias then the raw payload.
pub(crate) fn encode_datagram(alias: u64, payload: &Bytes) -> Bytes {
	let mut buf = BytesMut::with_capacity(crate::coding::varint_size(alias) + payload.len());
	alias.encode(&mut buf);
	buf.extend_from_slice(payload);
	buf.freeze()
}
