#![forbid(unsafe_code)]

use core::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::unix_now;

/// Length of a message id (`[A-Za-z0-9]`).
pub const MESSAGE_ID_LENGTH: usize = 10;

/// Body used when a message is published with no text and no attachment.
pub const EMPTY_MESSAGE_BODY: &str = "triggered";

/// Value of `Message::encoding` for base64-encoded bodies.
pub const ENCODING_BASE64: &str = "base64";

/// Default priority when none is given.
pub const DEFAULT_PRIORITY: u8 = 3;

const MIN_PRIORITY: u8 = 1;
const MAX_PRIORITY: u8 = 5;

const MAX_TOPIC_LENGTH: usize = 64;

/// Event kinds emitted on subscriber streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Open,
	Message,
	Keepalive,
	PollRequest,
}

impl EventKind {
	/// Stable string identifier, as written on the wire.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Open => "open",
			EventKind::Message => "message",
			EventKind::Keepalive => "keepalive",
			EventKind::PollRequest => "poll_request",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Binary blob associated with a message. `owner` is internal bookkeeping
/// (the publishing visitor) and never appears in the JSON encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub name: String,

	#[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
	pub content_type: String,

	#[serde(default, skip_serializing_if = "is_zero")]
	pub size: i64,

	#[serde(default, skip_serializing_if = "is_zero")]
	pub expires: i64,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub url: String,

	#[serde(skip)]
	pub owner: String,
}

/// A published message. Immutable once it has been fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub id: String,

	/// Intended publish time in unix seconds; in the future for scheduled messages.
	pub time: i64,

	pub event: EventKind,

	pub topic: String,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub title: String,

	#[serde(default)]
	pub message: String,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub encoding: String,

	#[serde(default, skip_serializing_if = "is_zero_u8")]
	pub priority: u8,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub click: String,

	/// Client-side action descriptors; opaque to the server.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub actions: Vec<serde_json::Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attachment: Option<Attachment>,
}

impl Message {
	/// New message-event record with a fresh random id and the current time.
	pub fn new(topic: impl Into<String>) -> Self {
		Self::event(EventKind::Message, topic)
	}

	/// Synthetic `open` event, sent when a subscriber stream starts.
	pub fn open(topic: impl Into<String>) -> Self {
		Self::event(EventKind::Open, topic)
	}

	/// Synthetic `keepalive` event.
	pub fn keepalive(topic: impl Into<String>) -> Self {
		Self::event(EventKind::Keepalive, topic)
	}

	fn event(event: EventKind, topic: impl Into<String>) -> Self {
		Self {
			id: random_message_id(),
			time: unix_now(),
			event,
			topic: topic.into(),
			title: String::new(),
			message: String::new(),
			encoding: String::new(),
			priority: 0,
			tags: Vec::new(),
			click: String::new(),
			actions: Vec::new(),
			attachment: None,
		}
	}
}

/// Default message text for an attachment published without a body.
pub fn default_attachment_message(name: &str) -> String {
	format!("You received a file: {name}")
}

/// Generate a random 10-character alphanumeric message id.
pub fn random_message_id() -> String {
	let mut rng = rand::thread_rng();
	(0..MESSAGE_ID_LENGTH).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// Whether `id` has the shape of a message id.
pub fn valid_message_id(id: &str) -> bool {
	id.len() == MESSAGE_ID_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Topic ids are 1-64 characters of `[-_A-Za-z0-9]`.
pub fn valid_topic(id: &str) -> bool {
	!id.is_empty() && id.len() <= MAX_TOPIC_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid priority: {0}")]
pub struct PriorityError(pub String);

/// Parse a priority value: a digit 1-5 or one of the named levels. An empty
/// string yields the default priority.
pub fn parse_priority(value: &str) -> Result<u8, PriorityError> {
	let value = value.trim();
	match value.to_ascii_lowercase().as_str() {
		"" => Ok(DEFAULT_PRIORITY),
		"1" | "min" => Ok(1),
		"2" | "low" => Ok(2),
		"3" | "default" => Ok(3),
		"4" | "high" => Ok(4),
		"5" | "max" | "urgent" => Ok(5),
		_ => Err(PriorityError(value.to_string())),
	}
}

/// Whether `priority` is inside the valid range (zero means "unset").
pub fn priority_in_range(priority: u8) -> bool {
	(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority)
}

fn is_zero(v: &i64) -> bool {
	*v == 0
}

fn is_zero_u8(v: &u8) -> bool {
	*v == 0
}
