use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use slab::Slab;
use tokio::sync::mpsc;

use crate::Frame;

/// The set of namespaces and tracks active on one connection.
///
/// Shared between the public handles and the session driver; cleared when
/// the owning connection is torn down, which ends every subscriber.
#[derive(Clone, Default)]
pub(crate) struct Registry {
	inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
	/// Namespaces the relay has acknowledged.
	announced: HashSet<String>,

	/// Active publishers by alias.
	publishers: HashMap<u64, (String, String)>,

	/// The next publisher alias to hand out.
	next_alias: u64,

	/// Active subscribers, keyed by the id sent on the wire.
	subscribers: Slab<SubscriberEntry>,
}

struct SubscriberEntry {
	namespace: String,
	track: String,
	frames: mpsc::UnboundedSender<Frame>,
}

impl Registry {
	pub fn announce(&self, namespace: &str) {
		self.inner.lock().unwrap().announced.insert(namespace.to_string());
	}

	pub fn is_announced(&self, namespace: &str) -> bool {
		self.inner.lock().unwrap().announced.contains(namespace)
	}

	pub fn next_alias(&self) -> u64 {
		let mut inner = self.inner.lock().unwrap();
		inner.next_alias += 1;
		inner.next_alias
	}

	pub fn insert_publisher(&self, alias: u64, namespace: &str, track: &str) {
		let mut inner = self.inner.lock().unwrap();
		inner.publishers.insert(alias, (namespace.to_string(), track.to_string()));
	}

	pub fn remove_publisher(&self, alias: u64) -> Option<(String, String)> {
		self.inner.lock().unwrap().publishers.remove(&alias)
	}

	pub fn insert_subscriber(&self, namespace: &str, track: &str, frames: mpsc::UnboundedSender<Frame>) -> u64 {
		let mut inner = self.inner.lock().unwrap();
		inner.subscribers.insert(SubscriberEntry {
			namespace: namespace.to_string(),
			track: track.to_string(),
			frames,
		}) as u64
	}

	pub fn remove_subscriber(&self, id: u64) {
		let mut inner = self.inner.lock().unwrap();
		inner.subscribers.try_remove(id as usize);
	}

	/// Route a reassembled message to its subscriber.
	pub fn deliver(&self, id: u64, payload: Bytes) {
		if payload.is_empty() {
			tracing::trace!(id, "dropping empty frame");
			return;
		}

		let frame = Frame::new(payload);

		let mut inner = self.inner.lock().unwrap();
		match inner.subscribers.get(id as usize) {
			Some(entry) => {
				tracing::trace!(id, namespace = %entry.namespace, track = %entry.track, size = frame.payload.len(), "delivering frame");

				if entry.frames.send(frame).is_err() {
					// The subscriber was dropped; stop routing to it.
					inner.subscribers.try_remove(id as usize);
				}
			}
			None => tracing::trace!(id, "dropping frame for unknown subscriber"),
		}
	}

	/// Drop every entry, ending all subscribers.
	pub fn clear(&self) {
		let mut inner = self.inner.lock().unwrap();
		*inner = Default::default();
	}
}
