#![forbid(unsafe_code)]

//! Wire-level data model for the chime notification service: the message
//! record and its JSON encoding, replay cursors, and the small time/duration
//! vocabulary used by publish and subscribe parameters.

pub mod message;
pub mod since;
pub mod time;

pub use message::{
	Attachment, EventKind, Message, PriorityError, DEFAULT_PRIORITY, EMPTY_MESSAGE_BODY, ENCODING_BASE64,
	MESSAGE_ID_LENGTH, default_attachment_message, parse_priority, priority_in_range, random_message_id,
	valid_message_id, valid_topic,
};
pub use since::{SinceError, SinceMarker, parse_since};
pub use time::{TimeError, parse_duration, parse_future_time, unix_now};
