#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chime_protocol::{Attachment, Message, unix_now};

use crate::config::ServerConfig;
use crate::server::cache::{MemCache, MessageCache};
use crate::server::testutil::test_config;
use crate::server::visitor::Visitor;

fn visitor(config: ServerConfig) -> Visitor {
	Visitor::new(Arc::new(config), Arc::new(MemCache::new()), "203.0.113.9")
}

#[tokio::test]
async fn request_bucket_denies_past_burst() {
	let v = visitor(ServerConfig {
		visitor_request_limit_burst: 2,
		visitor_request_limit_replenish: Duration::from_secs(3600),
		..test_config()
	});
	assert!(v.request_allowed().is_ok());
	assert!(v.request_allowed().is_ok());
	assert!(v.request_allowed().is_err());
}

#[tokio::test]
async fn zero_burst_means_unlimited() {
	let v = visitor(ServerConfig {
		visitor_request_limit_burst: 0,
		..test_config()
	});
	for _ in 0..100 {
		assert!(v.request_allowed().is_ok());
	}
}

#[tokio::test]
async fn subscription_slots_are_bounded_and_released() {
	let v = visitor(ServerConfig {
		visitor_subscription_limit: 2,
		..test_config()
	});
	assert!(v.subscription_allowed().is_ok());
	assert!(v.subscription_allowed().is_ok());
	assert!(v.subscription_allowed().is_err());

	v.remove_subscription();
	assert!(v.subscription_allowed().is_ok());
}

#[tokio::test]
async fn email_bucket_is_separate_from_requests() {
	let v = visitor(ServerConfig {
		visitor_email_limit_burst: 1,
		visitor_email_limit_replenish: Duration::from_secs(3600),
		..test_config()
	});
	assert!(v.email_allowed().is_ok());
	assert!(v.email_allowed().is_err());
	assert!(v.request_allowed().is_ok());
}

#[tokio::test]
async fn stats_track_live_attachment_bytes_for_owner() {
	let config = Arc::new(ServerConfig {
		visitor_attachment_total_size_limit: 1000,
		..test_config()
	});
	let cache = Arc::new(MemCache::new());
	let v = Visitor::new(Arc::clone(&config), cache.clone() as Arc<dyn MessageCache>, "203.0.113.9");

	let mut m = Message::new("t");
	m.attachment = Some(Attachment {
		name: "a.bin".to_string(),
		size: 300,
		expires: unix_now() + 3600,
		owner: "203.0.113.9".to_string(),
		..Attachment::default()
	});
	cache.add_message(&m).await.expect("add");

	// Someone else's attachment must not count.
	let mut other = Message::new("t");
	other.attachment = Some(Attachment {
		name: "b.bin".to_string(),
		size: 400,
		expires: unix_now() + 3600,
		owner: "198.51.100.1".to_string(),
		..Attachment::default()
	});
	cache.add_message(&other).await.expect("add other");

	let stats = v.stats().await.expect("stats");
	assert_eq!(stats.visitor_attachment_bytes_used, 300);
	assert_eq!(stats.visitor_attachment_bytes_remaining, 700);
	assert_eq!(stats.subscriptions, 0);
}

#[tokio::test]
async fn stats_json_uses_camel_case() {
	let v = visitor(test_config());
	let stats = v.stats().await.expect("stats");
	let json = serde_json::to_value(&stats).expect("json");
	let obj = json.as_object().expect("object");
	assert!(obj.contains_key("visitorAttachmentBytesRemaining"));
	assert!(obj.contains_key("attachmentFileSizeLimit"));
	assert!(obj.contains_key("subscriptions"));
}

#[tokio::test]
async fn visitor_with_open_subscription_is_never_stale() {
	let v = visitor(ServerConfig {
		visitor_expunge_after: Duration::ZERO,
		..test_config()
	});
	v.subscription_allowed().expect("slot");
	tokio::time::sleep(Duration::from_millis(1100)).await;
	assert!(!v.stale());

	v.remove_subscription();
	assert!(v.stale());
}
