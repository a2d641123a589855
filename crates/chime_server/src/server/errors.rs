#![forbid(unsafe_code)]

use serde::Serialize;
use thiserror::Error;

/// Error surfaced to HTTP clients as `{"code":N,"http":H,"error":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{error}")]
pub struct HttpError {
	pub code: u32,
	pub http: u16,
	pub error: String,
}

impl HttpError {
	fn new(code: u32, http: u16, error: &str) -> Self {
		Self {
			code,
			http,
			error: error.to_string(),
		}
	}

	pub fn json(&self) -> String {
		serde_json::to_string(self).unwrap_or_else(|_| r#"{"code":50001,"http":500,"error":"internal server error"}"#.to_string())
	}

	pub fn bad_request_priority_invalid() -> Self {
		Self::new(40001, 400, "invalid priority; must be 1-5 or min, low, default, high, max")
	}

	pub fn bad_request_since_invalid() -> Self {
		Self::new(40002, 400, "invalid since parameter; must be all, none, a unix timestamp, a duration or a message id")
	}

	pub fn bad_request_topic_invalid() -> Self {
		Self::new(40003, 400, "invalid topic; topic names are 1-64 characters of [-_A-Za-z0-9]")
	}

	pub fn bad_request_topic_disallowed() -> Self {
		Self::new(40004, 400, "invalid topic; this topic name is reserved")
	}

	pub fn bad_request_delay_cannot_parse() -> Self {
		Self::new(40005, 400, "invalid delay; must be a duration, a unix timestamp or a HH:MM clock time")
	}

	pub fn bad_request_delay_too_small() -> Self {
		Self::new(40006, 400, "invalid delay; delay is below the server minimum")
	}

	pub fn bad_request_delay_too_large() -> Self {
		Self::new(40007, 400, "invalid delay; delay is above the server maximum")
	}

	pub fn bad_request_delay_no_cache() -> Self {
		Self::new(40008, 400, "delayed messages cannot be used together with cache=no")
	}

	pub fn bad_request_delay_no_email() -> Self {
		Self::new(40009, 400, "delayed messages cannot be sent by e-mail")
	}

	pub fn bad_request_json_invalid() -> Self {
		Self::new(40010, 400, "invalid request; request body must be valid JSON")
	}

	pub fn bad_request_message_not_utf8() -> Self {
		Self::new(40011, 400, "invalid message; message must be valid UTF-8")
	}

	pub fn bad_request_websocket_upgrade_missing() -> Self {
		Self::new(40012, 400, "invalid request; client must set the Upgrade: websocket header")
	}

	pub fn bad_request_attachments_disallowed() -> Self {
		Self::new(40013, 400, "attachments are disabled on this server")
	}

	pub fn bad_request_attachment_expiry_before_delivery() -> Self {
		Self::new(40014, 400, "attachment would expire before the scheduled delivery time")
	}

	pub fn bad_request_attachment_url_invalid() -> Self {
		Self::new(40015, 400, "invalid attach URL; must start with http:// or https://")
	}

	pub fn bad_request_email_disabled() -> Self {
		Self::new(40016, 400, "e-mail notifications are disabled on this server")
	}

	pub fn bad_request_actions_invalid() -> Self {
		Self::new(40017, 400, "invalid actions; must be a JSON array of action objects")
	}

	pub fn unauthorized() -> Self {
		Self::new(40101, 401, "unauthorized")
	}

	pub fn forbidden() -> Self {
		Self::new(40301, 403, "forbidden")
	}

	pub fn not_found() -> Self {
		Self::new(40401, 404, "page not found")
	}

	pub fn entity_too_large_attachment() -> Self {
		Self::new(41301, 413, "attachment too large, or bandwidth or attachment quota reached")
	}

	pub fn too_many_requests_limit_requests() -> Self {
		Self::new(42901, 429, "limit reached: too many requests; please be nice")
	}

	pub fn too_many_requests_limit_emails() -> Self {
		Self::new(42902, 429, "limit reached: too many e-mails")
	}

	pub fn too_many_requests_limit_subscriptions() -> Self {
		Self::new(42903, 429, "limit reached: too many active subscriptions")
	}

	pub fn too_many_requests_limit_bandwidth() -> Self {
		Self::new(42904, 429, "limit reached: attachment bandwidth exhausted")
	}

	pub fn too_many_requests_limit_total_topics() -> Self {
		Self::new(42905, 429, "limit reached: the server has too many topics")
	}

	pub fn internal() -> Self {
		Self::new(50001, 500, "internal server error")
	}
}

impl From<anyhow::Error> for HttpError {
	fn from(_: anyhow::Error) -> Self {
		HttpError::internal()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn json_shape() {
		let err = HttpError::not_found();
		assert_eq!(err.json(), r#"{"code":40401,"http":404,"error":"page not found"}"#);
	}
}
