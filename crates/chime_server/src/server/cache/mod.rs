#![forbid(unsafe_code)]

pub mod mem;
pub mod nop;
pub mod sqlite;

use async_trait::async_trait;
use chime_protocol::{Message, SinceMarker};

pub use mem::MemCache;
pub use nop::NopCache;
pub use sqlite::SqliteCache;

/// Message store behind the server: retention, replay, the scheduled-message
/// queue, and the attachment-expiry index. Implementations: [`NopCache`]
/// (retention disabled), [`MemCache`], [`SqliteCache`].
#[async_trait]
pub trait MessageCache: Send + Sync {
	async fn add_message(&self, m: &Message) -> anyhow::Result<()>;

	/// Cached messages of `topic` selected by `since`, ascending by time.
	/// Scheduled (not yet due) messages are only included on request.
	async fn messages(&self, topic: &str, since: &SinceMarker, include_scheduled: bool) -> anyhow::Result<Vec<Message>>;

	async fn message_count(&self, topic: &str) -> anyhow::Result<usize>;

	/// Topic ids with at least one cached message; used to reseed the live
	/// topic registry at startup.
	async fn topics(&self) -> anyhow::Result<Vec<String>>;

	/// Scheduled messages that are due (`time <= now`) and not yet published.
	async fn messages_due(&self) -> anyhow::Result<Vec<Message>>;

	async fn mark_published(&self, m: &Message) -> anyhow::Result<()>;

	/// Drop messages older than the given unix timestamp.
	async fn prune(&self, older_than: i64) -> anyhow::Result<()>;

	/// Ids of messages whose attachment is past its expiry and whose blob has
	/// not been deleted yet.
	async fn attachments_expired(&self) -> anyhow::Result<Vec<String>>;

	async fn mark_attachments_deleted(&self, ids: &[String]) -> anyhow::Result<()>;

	/// Bytes of live (non-expired) attachments owned by `owner`; feeds the
	/// per-visitor attachment quota.
	async fn attachment_bytes_used(&self, owner: &str) -> anyhow::Result<i64>;
}
