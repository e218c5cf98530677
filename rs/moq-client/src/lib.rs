//! # moq-client: a native Media over QUIC client
//!
//! A connection manager plus publish/subscribe track engine operating over
//! QUIC, designed as the protocol core behind thin host integrations (the
//! `moq-ffi` crate exposes this API over a C ABI).
//!
//! ## API
//!
//! - [Connection::new] creates a disconnected client with its own QUIC endpoint.
//! - [Connection::connect] starts the handshake; progress arrives through
//!   [Connection::state_changes] as [ConnectionState] transitions.
//! - [Connection::announce] registers a publishing namespace with the relay.
//! - [Connection::publisher] creates a [Publisher] for one track; each
//!   publish picks a [DeliveryMode] (datagram or reliable stream).
//! - [Connection::subscribe] creates a [Subscriber]; [Subscriber::next]
//!   yields one [Frame] per complete message, with a UTF-8 decode attached
//!   when the payload is valid text.
//! - [Connection::disconnect] tears the session down, invalidating every
//!   derived publisher and subscriber.
//!
//! All calls are non-blocking handles into a background session task; the
//! only suspension points are protocol-level waits (handshake completion,
//! relay acknowledgement).
//!
//! [last_error] and [version] form a best-effort, process-wide diagnostics
//! channel; per-operation [Result]s are authoritative.

mod client;
mod connection;
mod diagnostics;
mod error;
mod publish;
mod registry;
mod session;
mod subscribe;

pub mod coding;
pub mod message;

pub use client::*;
pub use connection::*;
pub use diagnostics::{last_error, version};
pub use error::*;
pub use publish::*;
pub use subscribe::*;
