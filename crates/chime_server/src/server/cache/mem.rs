#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chime_protocol::{Message, SinceMarker, unix_now};

use crate::server::cache::MessageCache;

/// In-memory message cache; the default when no cache file is configured.
#[derive(Debug, Default)]
pub struct MemCache {
	inner: Mutex<HashMap<String, Vec<Entry>>>,
}

#[derive(Debug, Clone)]
struct Entry {
	msg: Message,
	published: bool,
	attachment_deleted: bool,
}

impl MemCache {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl MessageCache for MemCache {
	async fn add_message(&self, m: &Message) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().expect("mem cache lock");
		let published = m.time <= unix_now();
		inner.entry(m.topic.clone()).or_default().push(Entry {
			msg: m.clone(),
			published,
			attachment_deleted: false,
		});
		Ok(())
	}

	async fn messages(&self, topic: &str, since: &SinceMarker, include_scheduled: bool) -> anyhow::Result<Vec<Message>> {
		if since.is_none() {
			return Ok(Vec::new());
		}
		let inner = self.inner.lock().expect("mem cache lock");
		let Some(entries) = inner.get(topic) else {
			return Ok(Vec::new());
		};
		let now = unix_now();
		let start = match since {
			SinceMarker::Id(id) => entries
				.iter()
				.position(|e| e.msg.id == *id)
				.map(|pos| pos + 1)
				.unwrap_or(0),
			_ => 0,
		};
		let mut out: Vec<Message> = entries[start..]
			.iter()
			.filter(|e| include_scheduled || e.msg.time <= now)
			.filter(|e| match since {
				SinceMarker::Time(t) => e.msg.time >= *t,
				_ => true,
			})
			.map(|e| e.msg.clone())
			.collect();
		out.sort_by_key(|m| m.time);
		Ok(out)
	}

	async fn message_count(&self, topic: &str) -> anyhow::Result<usize> {
		let inner = self.inner.lock().expect("mem cache lock");
		Ok(inner.get(topic).map(|e| e.len()).unwrap_or(0))
	}

	async fn topics(&self) -> anyhow::Result<Vec<String>> {
		let inner = self.inner.lock().expect("mem cache lock");
		Ok(inner.keys().cloned().collect())
	}

	async fn messages_due(&self) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.lock().expect("mem cache lock");
		let now = unix_now();
		let mut due: Vec<Message> = inner
			.values()
			.flatten()
			.filter(|e| !e.published && e.msg.time <= now)
			.map(|e| e.msg.clone())
			.collect();
		due.sort_by_key(|m| m.time);
		Ok(due)
	}

	async fn mark_published(&self, m: &Message) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().expect("mem cache lock");
		if let Some(entries) = inner.get_mut(&m.topic)
			&& let Some(entry) = entries.iter_mut().find(|e| e.msg.id == m.id)
		{
			entry.published = true;
		}
		Ok(())
	}

	async fn prune(&self, older_than: i64) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().expect("mem cache lock");
		for entries in inner.values_mut() {
			entries.retain(|e| e.msg.time >= older_than);
		}
		inner.retain(|_, entries| !entries.is_empty());
		Ok(())
	}

	async fn attachments_expired(&self) -> anyhow::Result<Vec<String>> {
		let inner = self.inner.lock().expect("mem cache lock");
		let now = unix_now();
		Ok(inner
			.values()
			.flatten()
			.filter(|e| !e.attachment_deleted)
			.filter(|e| {
				e.msg
					.attachment
					.as_ref()
					.map(|a| a.expires > 0 && a.expires <= now)
					.unwrap_or(false)
			})
			.map(|e| e.msg.id.clone())
			.collect())
	}

	async fn mark_attachments_deleted(&self, ids: &[String]) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().expect("mem cache lock");
		for entries in inner.values_mut() {
			for entry in entries.iter_mut() {
				if ids.contains(&entry.msg.id) {
					entry.attachment_deleted = true;
				}
			}
		}
		Ok(())
	}

	async fn attachment_bytes_used(&self, owner: &str) -> anyhow::Result<i64> {
		let inner = self.inner.lock().expect("mem cache lock");
		let now = unix_now();
		Ok(inner
			.values()
			.flatten()
			.filter_map(|e| e.msg.attachment.as_ref())
			.filter(|a| a.owner == owner && a.expires > now)
			.map(|a| a.size)
			.sum())
	}
}
