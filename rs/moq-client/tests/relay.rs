//! End-to-end tests against a minimal in-process relay.
//!
//! The relay speaks just enough of the protocol to acknowledge announces
//! and subscribes, and to fan published frames back out to subscribers on
//! the same connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use moq_client::coding::{Decode, Encode, Reader, Writer};
use moq_client::message::{self, ControlMessage};
use moq_client::{ClientConfig, Connection, ConnectionState, DeliveryMode, Error};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Time for in-flight control messages to settle on loopback.
const SETTLE: Duration = Duration::from_millis(200);

struct Relay {
	endpoint: quinn::Endpoint,
	url: String,
}

impl Relay {
	fn start() -> anyhow::Result<Self> {
		let key = rcgen::KeyPair::generate()?;
		let cert = rcgen::CertificateParams::new(vec!["localhost".into(), "127.0.0.1".into()])?.self_signed(&key)?;

		let chain = vec![rustls::pki_types::CertificateDer::from(cert)];
		let key = rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
			key.serialized_der().to_vec(),
		));

		let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
		let mut tls = rustls::ServerConfig::builder_with_provider(provider)
			.with_protocol_versions(&[&rustls::version::TLS13])?
			.with_no_client_auth()
			.with_single_cert(chain, key)?;
		tls.alpn_protocols = vec![moq_client::ALPN.as_bytes().to_vec()];

		let config = quinn::ServerConfig::with_crypto(Arc::new(quinn::crypto::rustls::QuicServerConfig::try_from(
			tls,
		)?));
		let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse()?)?;
		let url = format!("moq://127.0.0.1:{}", endpoint.local_addr()?.port());

		let accept = endpoint.clone();
		tokio::spawn(async move {
			while let Some(incoming) = accept.accept().await {
				tokio::spawn(async move {
					if let Err(err) = serve(incoming).await {
						eprintln!("relay session ended: {err:#}");
					}
				});
			}
		});

		Ok(Self { endpoint, url })
	}
}

impl Drop for Relay {
	fn drop(&mut self) {
		self.endpoint.close(0u32.into(), b"shutdown");
	}
}

#[derive(Default)]
struct RelayState {
	/// Publisher aliases to their (namespace, track).
	publishers: HashMap<u64, (String, String)>,

	/// Subscriber ids per (namespace, track).
	subscribers: HashMap<(String, String), Vec<u64>>,
}

impl RelayState {
	fn route(&self, alias: u64) -> Vec<u64> {
		self.publishers
			.get(&alias)
			.and_then(|key| self.subscribers.get(key))
			.cloned()
			.unwrap_or_default()
	}
}

async fn serve(incoming: quinn::Incoming) -> anyhow::Result<()> {
	let connection = incoming.await?;

	let (send, recv) = connection.accept_bi().await?;
	let mut control_send = Writer::new(send);
	let mut control_recv = Reader::new(recv);

	let setup = match control_recv.decode::<ControlMessage>().await? {
		ControlMessage::ClientSetup(setup) => setup,
		msg => anyhow::bail!("expected client setup, got {msg:?}"),
	};
	anyhow::ensure!(setup.versions.contains(&message::VERSION), "no common version");

	control_send
		.encode(&ControlMessage::ServerSetup(message::ServerSetup {
			version: message::VERSION,
		}))
		.await?;

	let state = Arc::new(Mutex::new(RelayState::default()));

	loop {
		tokio::select! {
			msg = control_recv.decode::<ControlMessage>() => match msg? {
				ControlMessage::Announce(msg) => {
					control_send
						.encode(&ControlMessage::AnnounceOk(message::AnnounceOk {
							namespace: msg.namespace,
						}))
						.await?;
				}
				ControlMessage::PublishOpen(msg) => {
					state.lock().unwrap().publishers.insert(msg.alias, (msg.namespace, msg.track));
				}
				ControlMessage::Subscribe(msg) => {
					state
						.lock()
						.unwrap()
						.subscribers
						.entry((msg.namespace, msg.track))
						.or_default()
						.push(msg.id);

					control_send
						.encode(&ControlMessage::SubscribeOk(message::SubscribeOk { id: msg.id }))
						.await?;
				}
				ControlMessage::Unsubscribe(msg) => {
					for ids in state.lock().unwrap().subscribers.values_mut() {
						ids.retain(|id| *id != msg.id);
					}
				}
				msg => anyhow::bail!("unexpected control message: {msg:?}"),
			},
			datagram = connection.read_datagram() => {
				let mut datagram = datagram?;
				let alias = u64::decode(&mut datagram)?;

				for id in state.lock().unwrap().route(alias) {
					let mut buf = bytes::BytesMut::new();
					id.encode(&mut buf);
					buf.extend_from_slice(&datagram);
					connection.send_datagram(buf.freeze())?;
				}
			}
			stream = connection.accept_uni() => {
				let stream = stream?;
				let connection = connection.clone();
				let state = state.clone();

				tokio::spawn(async move {
					if let Err(err) = forward_stream(connection, state, stream).await {
						eprintln!("relay stream ended: {err:#}");
					}
				});
			}
		}
	}
}

/// Copy frames from a publisher's data stream to every subscriber.
async fn forward_stream(
	connection: quinn::Connection,
	state: Arc<Mutex<RelayState>>,
	stream: quinn::RecvStream,
) -> anyhow::Result<()> {
	let mut reader = Reader::new(stream);
	let alias: u64 = reader.decode().await?;

	// The PublishOpen control message may still be in flight.
	while !state.lock().unwrap().publishers.contains_key(&alias) {
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	let mut outputs: HashMap<u64, Writer> = HashMap::new();

	while let Some(payload) = reader.decode_maybe::<Bytes>().await? {
		let ids = state.lock().unwrap().route(alias);

		for id in ids {
			if !outputs.contains_key(&id) {
				let send = connection.open_uni().await?;
				let mut writer = Writer::new(send);
				writer.encode(&id).await?;
				outputs.insert(id, writer);
			}

			outputs.get_mut(&id).unwrap().encode(&payload).await?;
		}
	}

	for writer in outputs.values_mut() {
		writer.finish();
	}

	Ok(())
}

fn config() -> ClientConfig {
	ClientConfig {
		// The relay listens on IPv4 loopback.
		bind: "0.0.0.0:0".parse().unwrap(),
		..Default::default()
	}
}

fn trusting_client() -> Connection {
	Connection::new(ClientConfig {
		tls_disable_verify: true,
		..config()
	})
	.expect("failed to create client")
}

async fn expect_state(states: &mut mpsc::UnboundedReceiver<ConnectionState>, expected: ConnectionState) {
	let state = timeout(TIMEOUT, states.recv())
		.await
		.expect("timed out waiting for state change")
		.expect("state channel closed");
	assert_eq!(state, expected);
}

#[tokio::test]
async fn publish_subscribe_end_to_end() -> anyhow::Result<()> {
	let relay = Relay::start()?;

	let connection = trusting_client();
	let mut states = connection.state_changes();

	// Nothing is valid before connect.
	assert!(matches!(connection.announce("example").await, Err(Error::NotConnected)));
	assert!(matches!(
		connection.publisher("example", "actor-position", DeliveryMode::Stream),
		Err(Error::NotConnected)
	));

	connection.connect(&relay.url)?;
	expect_state(&mut states, ConnectionState::Connecting).await;
	expect_state(&mut states, ConnectionState::Connected).await;
	assert!(connection.is_connected());

	timeout(TIMEOUT, connection.announce("example")).await??;

	let mut subscriber = connection.subscribe("example", "actor-position")?;
	let publisher = connection.publisher("example", "actor-position", DeliveryMode::Stream)?;

	// Let the subscribe reach the relay before publishing.
	tokio::time::sleep(SETTLE).await;

	// Validation failures never transmit.
	assert!(matches!(
		publisher.publish(Bytes::new()),
		Err(Error::InvalidArgument("empty payload"))
	));
	assert!(matches!(
		publisher.publish_text(""),
		Err(Error::InvalidArgument("empty text"))
	));

	// A datagram that can't fit fails synchronously.
	let oversized = Bytes::from(vec![0u8; 100_000]);
	assert!(matches!(
		publisher.publish_via(oversized, DeliveryMode::Datagram),
		Err(Error::PayloadTooLarge { .. })
	));

	// ASCII text arrives as both binary and text.
	publisher.publish_text("Hello")?;
	let frame = timeout(TIMEOUT, subscriber.next()).await?.expect("no frame");
	assert_eq!(&frame.payload[..], b"Hello");
	assert_eq!(frame.payload.len(), 5);
	assert_eq!(frame.text.as_deref(), Some("Hello"));

	// Multi-byte and 4-byte sequences round-trip bit for bit.
	let text = "Hello 世界 🎮";
	publisher.publish_text(text)?;
	let frame = timeout(TIMEOUT, subscriber.next()).await?.expect("no frame");
	assert_eq!(&frame.payload[..], text.as_bytes());
	assert_eq!(frame.text.as_deref(), Some(text));

	// Invalid UTF-8 still delivers the binary event, with no text.
	publisher.publish_via(Bytes::from_static(&[0xff, 0xfe, 0xfd]), DeliveryMode::Stream)?;
	let frame = timeout(TIMEOUT, subscriber.next()).await?.expect("no frame");
	assert_eq!(&frame.payload[..], &[0xff, 0xfe, 0xfd]);
	assert_eq!(frame.text, None);

	// The datagram path delivers too.
	publisher.publish_via(Bytes::from_static(b"ping"), DeliveryMode::Datagram)?;
	let frame = timeout(TIMEOUT, subscriber.next()).await?.expect("no datagram frame");
	assert_eq!(&frame.payload[..], b"ping");
	assert_eq!(frame.text.as_deref(), Some("ping"));

	// Disconnect ends everything derived from the connection.
	connection.disconnect()?;
	expect_state(&mut states, ConnectionState::Disconnected).await;
	assert!(!connection.is_connected());

	// The second disconnect reports NotConnected without side effects.
	assert!(matches!(connection.disconnect(), Err(Error::NotConnected)));
	assert_eq!(connection.state(), ConnectionState::Disconnected);

	assert!(timeout(TIMEOUT, subscriber.next()).await?.is_none());
	assert!(matches!(publisher.publish_text("late"), Err(Error::NotConnected)));

	Ok(())
}

#[tokio::test]
async fn failed_handshake_reaches_failed_exactly_once() -> anyhow::Result<()> {
	let relay = Relay::start()?;

	// Certificate verification stays on, so the self-signed relay is refused.
	let connection = Connection::new(config())?;
	let mut states = connection.state_changes();

	connection.connect(&relay.url)?;
	expect_state(&mut states, ConnectionState::Connecting).await;
	expect_state(&mut states, ConnectionState::Failed).await;

	assert!(!connection.is_connected());
	assert_eq!(connection.state(), ConnectionState::Failed);

	// The failure landed in the diagnostics channel.
	assert!(moq_client::last_error().is_some());

	// Failed is terminal until the next connect attempt.
	assert!(matches!(connection.announce("example").await, Err(Error::NotConnected)));

	// No further transitions arrive.
	assert!(timeout(SETTLE, states.recv()).await.is_err());

	Ok(())
}

#[tokio::test]
async fn subscribe_without_publisher_never_hangs() -> anyhow::Result<()> {
	let relay = Relay::start()?;

	let connection = trusting_client();
	let mut states = connection.state_changes();

	connection.connect(&relay.url)?;
	expect_state(&mut states, ConnectionState::Connecting).await;
	expect_state(&mut states, ConnectionState::Connected).await;

	// The subscribe itself succeeds with no announce and no publisher.
	let mut subscriber = connection.subscribe("nobody", "silence")?;

	// No data is a valid terminal state, not a hang.
	assert!(timeout(Duration::from_millis(500), subscriber.next()).await.is_err());

	// Teardown promptly ends the subscriber.
	connection.disconnect()?;
	assert!(timeout(TIMEOUT, subscriber.next()).await?.is_none());

	Ok(())
}

#[tokio::test]
async fn connect_replaces_the_previous_session() -> anyhow::Result<()> {
	let relay = Relay::start()?;

	let connection = trusting_client();
	let mut states = connection.state_changes();

	connection.connect(&relay.url)?;
	expect_state(&mut states, ConnectionState::Connecting).await;
	expect_state(&mut states, ConnectionState::Connected).await;

	let publisher = connection.publisher("example", "actor-position", DeliveryMode::Stream)?;

	// A second connect tears down the first transport and starts over.
	connection.connect(&relay.url)?;
	expect_state(&mut states, ConnectionState::Connecting).await;
	expect_state(&mut states, ConnectionState::Connected).await;
	assert!(connection.is_connected());

	// Handles from the replaced session fail cleanly.
	tokio::time::sleep(SETTLE).await;
	assert!(matches!(publisher.publish_text("stale"), Err(Error::NotConnected)));

	connection.disconnect()?;
	expect_state(&mut states, ConnectionState::Disconnected).await;

	Ok(())
}
