#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, NaiveTime, TimeZone};
use thiserror::Error;

/// Current unix time in seconds.
#[inline]
pub fn unix_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_secs() as i64
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
	#[error("cannot parse duration: {0}")]
	Duration(String),
	#[error("cannot parse time: {0}")]
	Time(String),
}

/// Parse a duration literal such as `30s`, `15m`, `12h`, `2d` or a compound
/// like `1h30m`. A bare integer is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, TimeError> {
	let value = value.trim();
	if value.is_empty() {
		return Err(TimeError::Duration(value.to_string()));
	}
	if let Ok(secs) = value.parse::<u64>() {
		return Ok(Duration::from_secs(secs));
	}

	let mut total: u64 = 0;
	let mut digits = String::new();
	for c in value.chars() {
		if c.is_ascii_digit() {
			digits.push(c);
			continue;
		}
		let n: u64 = digits.parse().map_err(|_| TimeError::Duration(value.to_string()))?;
		digits.clear();
		let unit = match c {
			's' => 1,
			'm' => 60,
			'h' => 3600,
			'd' => 86400,
			_ => return Err(TimeError::Duration(value.to_string())),
		};
		total = total.saturating_add(n.saturating_mul(unit));
	}
	if !digits.is_empty() {
		return Err(TimeError::Duration(value.to_string()));
	}
	Ok(Duration::from_secs(total))
}

/// Resolve a delivery-time parameter into unix seconds, relative to `now`.
/// Accepts a duration offset (`30m`), an absolute unix timestamp, or a
/// `HH:MM` local clock time (the next occurrence).
pub fn parse_future_time(value: &str, now: i64) -> Result<i64, TimeError> {
	let value = value.trim();
	if value.is_empty() {
		return Err(TimeError::Time(value.to_string()));
	}

	// Absolute timestamps are at least ~2001 in unix seconds; anything
	// smaller is treated as a relative offset.
	if let Ok(ts) = value.parse::<i64>() {
		if ts > 1_000_000_000 {
			return Ok(ts);
		}
	}
	if let Ok(d) = parse_duration(value) {
		return Ok(now + d.as_secs() as i64);
	}
	if let Some(ts) = parse_next_clock_time(value, now) {
		return Ok(ts);
	}
	Err(TimeError::Time(value.to_string()))
}

fn parse_next_clock_time(value: &str, now: i64) -> Option<i64> {
	let t = NaiveTime::parse_from_str(value, "%H:%M").ok()?;
	let now_local = Local.timestamp_opt(now, 0).single()?;
	let mut candidate = now_local.date_naive().and_time(t);
	let candidate_ts = Local.from_local_datetime(&candidate).single()?.timestamp();
	if candidate_ts > now {
		return Some(candidate_ts);
	}
	candidate += chrono::Duration::days(1);
	Some(Local.from_local_datetime(&candidate).single()?.timestamp())
}
