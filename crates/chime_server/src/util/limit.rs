#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("limit reached")]
pub struct LimitReached;

/// A budget that can be consumed in arbitrary increments. Refusal must not
/// consume anything.
pub trait Limiter: Send + Sync {
	fn allow(&self, n: u64) -> Result<(), LimitReached>;
}

/// Classic token bucket: `capacity` tokens, refilled at `refill_per_sec`.
#[derive(Debug)]
pub struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
		Self {
			capacity,
			tokens: capacity,
			refill_per_sec,
			last: Instant::now(),
		}
	}

	pub fn allow(&mut self) -> bool {
		self.allow_n(1.0)
	}

	pub fn allow_n(&mut self, n: f64) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= n {
			self.tokens -= n;
			true
		} else {
			false
		}
	}
}

/// Byte-granular bucket: `bytes` may be spent per `per` window, shared by
/// concurrent users. Used for attachment bandwidth.
#[derive(Debug)]
pub struct BytesLimiter {
	bucket: Mutex<TokenBucket>,
}

impl BytesLimiter {
	pub fn new(bytes: u64, per: Duration) -> Self {
		let refill = bytes as f64 / per.as_secs_f64().max(1.0);
		Self {
			bucket: Mutex::new(TokenBucket::new(bytes as f64, refill)),
		}
	}
}

impl Limiter for BytesLimiter {
	fn allow(&self, n: u64) -> Result<(), LimitReached> {
		let mut bucket = self.bucket.lock().expect("bytes limiter lock");
		if bucket.allow_n(n as f64) { Ok(()) } else { Err(LimitReached) }
	}
}

/// One-shot budget of `limit` units, never refilled. Used for the remaining
/// per-visitor attachment quota during a single upload.
#[derive(Debug)]
pub struct FixedLimiter {
	limit: u64,
	used: AtomicU64,
}

impl FixedLimiter {
	pub fn new(limit: u64) -> Self {
		Self {
			limit,
			used: AtomicU64::new(0),
		}
	}
}

impl Limiter for FixedLimiter {
	fn allow(&self, n: u64) -> Result<(), LimitReached> {
		let mut result = Ok(());
		let _ = self.used.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
			match used.checked_add(n) {
				Some(next) if next <= self.limit => {
					result = Ok(());
					Some(next)
				}
				_ => {
					result = Err(LimitReached);
					None
				}
			}
		});
		result
	}
}
