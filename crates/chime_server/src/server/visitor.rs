#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chime_protocol::unix_now;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::server::cache::MessageCache;
use crate::util::limit::{BytesLimiter, LimitReached, Limiter, TokenBucket};

/// Per-client identity used for rate limiting; keyed by source IP (or the
/// forwarded-for address when running behind a proxy).
pub struct Visitor {
	ip: String,
	config: Arc<ServerConfig>,
	cache: Arc<dyn MessageCache>,
	requests: Option<Mutex<TokenBucket>>,
	emails: Option<Mutex<TokenBucket>>,
	subscriptions: AtomicU64,
	bandwidth: Arc<BytesLimiter>,
	last_seen: AtomicI64,
}

/// Snapshot returned by `GET /user/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorStats {
	pub subscriptions: u64,
	pub attachment_file_size_limit: i64,
	pub visitor_attachment_bytes_total: i64,
	pub visitor_attachment_bytes_used: i64,
	pub visitor_attachment_bytes_remaining: i64,
}

fn bucket(burst: u32, replenish_secs: f64) -> Option<Mutex<TokenBucket>> {
	if burst == 0 {
		return None;
	}
	let refill = 1.0 / replenish_secs.max(0.001);
	Some(Mutex::new(TokenBucket::new(burst as f64, refill)))
}

impl Visitor {
	pub fn new(config: Arc<ServerConfig>, cache: Arc<dyn MessageCache>, ip: impl Into<String>) -> Self {
		let requests = bucket(
			config.visitor_request_limit_burst,
			config.visitor_request_limit_replenish.as_secs_f64(),
		);
		let emails = bucket(
			config.visitor_email_limit_burst,
			config.visitor_email_limit_replenish.as_secs_f64(),
		);
		let bandwidth = Arc::new(BytesLimiter::new(
			config.visitor_attachment_daily_bandwidth_limit,
			std::time::Duration::from_secs(24 * 3600),
		));
		Self {
			ip: ip.into(),
			config,
			cache,
			requests,
			emails,
			subscriptions: AtomicU64::new(0),
			bandwidth,
			last_seen: AtomicI64::new(unix_now()),
		}
	}

	pub fn ip(&self) -> &str {
		&self.ip
	}

	pub fn request_allowed(&self) -> Result<(), LimitReached> {
		allow_one(&self.requests)
	}

	pub fn email_allowed(&self) -> Result<(), LimitReached> {
		allow_one(&self.emails)
	}

	/// Claim a subscription slot; must be paired with `remove_subscription`.
	pub fn subscription_allowed(&self) -> Result<(), LimitReached> {
		let limit = self.config.visitor_subscription_limit;
		let mut result = Ok(());
		let _ = self.subscriptions.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
			if limit > 0 && n >= limit {
				result = Err(LimitReached);
				None
			} else {
				result = Ok(());
				Some(n + 1)
			}
		});
		result
	}

	pub fn remove_subscription(&self) {
		let _ = self
			.subscriptions
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
	}

	/// Shared byte budget for attachment upload and download.
	pub fn bandwidth_limiter(&self) -> Arc<dyn Limiter> {
		Arc::clone(&self.bandwidth) as Arc<dyn Limiter>
	}

	pub async fn stats(&self) -> anyhow::Result<VisitorStats> {
		let total = self.config.visitor_attachment_total_size_limit;
		let used = self.cache.attachment_bytes_used(&self.ip).await?;
		Ok(VisitorStats {
			subscriptions: self.subscriptions.load(Ordering::SeqCst),
			attachment_file_size_limit: self.config.attachment_file_size_limit,
			visitor_attachment_bytes_total: total,
			visitor_attachment_bytes_used: used,
			visitor_attachment_bytes_remaining: (total - used).max(0),
		})
	}

	/// Refresh the idle clock.
	pub fn keepalive(&self) {
		self.last_seen.store(unix_now(), Ordering::Relaxed);
	}

	/// Whether this visitor has been idle long enough to be expunged.
	pub fn stale(&self) -> bool {
		let idle = unix_now() - self.last_seen.load(Ordering::Relaxed);
		self.subscriptions.load(Ordering::SeqCst) == 0 && idle > self.config.visitor_expunge_after.as_secs() as i64
	}
}

fn allow_one(bucket: &Option<Mutex<TokenBucket>>) -> Result<(), LimitReached> {
	match bucket {
		None => Ok(()),
		Some(bucket) => {
			let mut bucket = bucket.lock().expect("visitor bucket lock");
			if bucket.allow() { Ok(()) } else { Err(LimitReached) }
		}
	}
}
