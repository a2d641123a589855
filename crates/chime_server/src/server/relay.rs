#![forbid(unsafe_code)]

use async_trait::async_trait;
use chime_protocol::Message;

/// Reserved topic the relay keepalive manager publishes to.
pub const RELAY_CONTROL_TOPIC: &str = "~control";

/// Upstream push-notification mirror (e.g. a mobile push gateway). Every
/// live published message is forwarded unless the publisher opts out with
/// `firebase=no`. Failures are logged, never surfaced to publishers.
#[async_trait]
pub trait PushRelay: Send + Sync {
	async fn publish(&self, m: &Message) -> anyhow::Result<()>;
}

/// Outbound mailer for `email=` publishes. Supplied by the embedder.
#[async_trait]
pub trait Mailer: Send + Sync {
	async fn send(&self, sender_ip: &str, to: &str, m: &Message) -> anyhow::Result<()>;
}
