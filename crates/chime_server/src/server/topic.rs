#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chime_protocol::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A named channel with a set of live subscribers. Created lazily on first
/// publish or subscribe, dropped by the manager once it has neither
/// subscribers nor cached messages.
///
/// Each subscriber is a bounded queue; `publish` never blocks. A subscriber
/// whose queue is full is dropped (its stream ends) so one slow consumer
/// cannot stall the topic.
#[derive(Debug, Clone)]
pub struct Topic {
	id: String,
	inner: Arc<Mutex<TopicInner>>,
}

#[derive(Debug, Default)]
struct TopicInner {
	next_subscriber_id: u64,
	subscribers: HashMap<u64, mpsc::Sender<Arc<Message>>>,
}

impl Topic {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			inner: Arc::new(Mutex::new(TopicInner::default())),
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	/// Register a subscriber queue; returns its handle for `unsubscribe`.
	pub fn subscribe(&self, tx: mpsc::Sender<Arc<Message>>) -> u64 {
		let mut inner = self.inner.lock().expect("topic lock");
		let id = inner.next_subscriber_id;
		inner.next_subscriber_id += 1;
		inner.subscribers.insert(id, tx);
		debug!(topic = %self.id, subscriber_id = id, subscribers = inner.subscribers.len(), "subscribed");
		id
	}

	/// Remove a subscriber. Idempotent.
	pub fn unsubscribe(&self, subscriber_id: u64) {
		let mut inner = self.inner.lock().expect("topic lock");
		inner.subscribers.remove(&subscriber_id);
	}

	/// Deliver `msg` to every currently registered subscriber, in FIFO order
	/// per subscriber. Slow or closed subscribers are removed.
	pub fn publish(&self, msg: &Arc<Message>) {
		let mut inner = self.inner.lock().expect("topic lock");
		let mut dropped: Vec<u64> = Vec::new();
		for (id, tx) in inner.subscribers.iter() {
			match tx.try_send(Arc::clone(msg)) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(topic = %self.id, subscriber_id = id, "subscriber queue full, dropping subscriber");
					dropped.push(*id);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					dropped.push(*id);
				}
			}
		}
		for id in dropped {
			inner.subscribers.remove(&id);
		}
	}

	pub fn subscriber_count(&self) -> usize {
		let inner = self.inner.lock().expect("topic lock");
		inner.subscribers.len()
	}
}
