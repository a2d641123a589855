#![forbid(unsafe_code)]

use thiserror::Error;

use crate::message::valid_message_id;
use crate::time::{parse_duration, unix_now};

/// Replay cursor for a subscriber: where in the cached history to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinceMarker {
	/// No replay at all.
	None,
	/// Replay the full cached history.
	All,
	/// Replay messages with `time >= .0` (unix seconds).
	Time(i64),
	/// Replay messages published after the one with this id.
	Id(String),
}

impl SinceMarker {
	pub fn is_none(&self) -> bool {
		matches!(self, SinceMarker::None)
	}

	pub fn is_all(&self) -> bool {
		matches!(self, SinceMarker::All)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid since value: {0}")]
pub struct SinceError(pub String);

/// Parse a `since` parameter: `all`, `none`, a unix timestamp, a duration
/// literal (`12h`), or a message id. An empty value means everything when
/// polling and nothing on a live stream.
pub fn parse_since(value: &str, poll: bool) -> Result<SinceMarker, SinceError> {
	let value = value.trim();
	match value {
		"" => {
			if poll {
				return Ok(SinceMarker::All);
			}
			Ok(SinceMarker::None)
		}
		"all" => Ok(SinceMarker::All),
		"none" => Ok(SinceMarker::None),
		_ => {
			// Anything shaped like a message id is an id, even when it is
			// all digits and would also parse as a timestamp.
			if valid_message_id(value) {
				return Ok(SinceMarker::Id(value.to_string()));
			}
			if let Ok(ts) = value.parse::<i64>() {
				return Ok(SinceMarker::Time(ts));
			}
			if let Ok(d) = parse_duration(value) {
				return Ok(SinceMarker::Time(unix_now() - d.as_secs() as i64));
			}
			Err(SinceError(value.to_string()))
		}
	}
}
