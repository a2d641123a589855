#![forbid(unsafe_code)]

use async_trait::async_trait;
use chime_protocol::{Message, SinceMarker};

use crate::server::cache::MessageCache;

/// Cache used when retention is disabled (`cache_duration = 0`): everything
/// is dropped, every query is empty.
#[derive(Debug, Default)]
pub struct NopCache;

impl NopCache {
	pub fn new() -> Self {
		Self
	}
}

#[async_trait]
impl MessageCache for NopCache {
	async fn add_message(&self, _m: &Message) -> anyhow::Result<()> {
		Ok(())
	}

	async fn messages(&self, _topic: &str, _since: &SinceMarker, _include_scheduled: bool) -> anyhow::Result<Vec<Message>> {
		Ok(Vec::new())
	}

	async fn message_count(&self, _topic: &str) -> anyhow::Result<usize> {
		Ok(0)
	}

	async fn topics(&self) -> anyhow::Result<Vec<String>> {
		Ok(Vec::new())
	}

	async fn messages_due(&self) -> anyhow::Result<Vec<Message>> {
		Ok(Vec::new())
	}

	async fn mark_published(&self, _m: &Message) -> anyhow::Result<()> {
		Ok(())
	}

	async fn prune(&self, _older_than: i64) -> anyhow::Result<()> {
		Ok(())
	}

	async fn attachments_expired(&self) -> anyhow::Result<Vec<String>> {
		Ok(Vec::new())
	}

	async fn mark_attachments_deleted(&self, _ids: &[String]) -> anyhow::Result<()> {
		Ok(())
	}

	async fn attachment_bytes_used(&self, _owner: &str) -> anyhow::Result<i64> {
		Ok(0)
	}
}
