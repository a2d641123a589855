#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chime_protocol::{
	Attachment, EMPTY_MESSAGE_BODY, ENCODING_BASE64, Message, default_attachment_message, parse_future_time,
	parse_priority, unix_now, valid_topic,
};
use http_body_util::Full;
use hyper::body::Body;
use hyper::{HeaderMap, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::warn;

use crate::server::errors::HttpError;
use crate::server::file_cache::FileError;
use crate::server::params::{query_params, read_bool_param, read_param};
use crate::server::router::{ResponseBody, json_response};
use crate::server::server::Server;
use crate::server::visitor::Visitor;
use crate::util::content_type;
use crate::util::limit::{FixedLimiter, Limiter};
use crate::util::peek::{BoxError, PeekedBody, peek};

pub(crate) struct PublishParams {
	pub cache: bool,
	pub firebase: bool,
	pub email: String,
	pub unifiedpush: bool,
}

/// JSON body accepted on `PUT|POST /`; rewritten into a standard publish.
#[derive(Debug, Default, Deserialize)]
struct PublishEnvelope {
	#[serde(default)]
	topic: String,
	#[serde(default)]
	message: String,
	#[serde(default)]
	title: String,
	#[serde(default)]
	priority: u8,
	#[serde(default)]
	tags: Vec<String>,
	#[serde(default)]
	click: String,
	#[serde(default)]
	actions: Vec<serde_json::Value>,
	#[serde(default)]
	attach: String,
	#[serde(default)]
	filename: String,
	#[serde(default)]
	email: String,
	#[serde(default)]
	delay: String,
}

impl Server {
	/// The publish pipeline: parse parameters, classify the body, ingest an
	/// attachment if any, fan out, mirror to relays, commit to the cache.
	pub(crate) async fn handle_publish<B>(
		&self,
		req: Request<B>,
		v: &Arc<Visitor>,
	) -> Result<Response<ResponseBody>, HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let topic = self.topic_from_path(req.uri().path())?;
		let query = query_params(req.uri());
		let (parts, body) = req.into_parts();
		let mut body = peek(body, self.config.message_limit).await.map_err(|e| {
			warn!(error = %e, "error reading publish body");
			HttpError::internal()
		})?;

		let mut m = Message::new(topic.id());
		let params = self.parse_publish_params(&parts.headers, &query, v, &mut m)?;
		self.handle_publish_body(&parts.headers, v, &mut m, &mut body, params.unifiedpush).await?;
		if m.message.is_empty() {
			m.message = EMPTY_MESSAGE_BODY.to_string();
		}

		let delayed = m.time > unix_now();
		let msg = Arc::new(m.clone());
		if !delayed {
			topic.publish(&msg);
		}
		if let Some(relay) = self.relay.as_ref().filter(|_| params.firebase && !delayed) {
			let relay = Arc::clone(relay);
			let msg = Arc::clone(&msg);
			let ip = v.ip().to_string();
			tokio::spawn(async move {
				if let Err(e) = relay.publish(&msg).await {
					warn!(ip = %ip, error = %e, "unable to mirror message to relay");
				}
			});
		}
		if let Some(mailer) = self.mailer.as_ref().filter(|_| !params.email.is_empty() && !delayed) {
			let mailer = Arc::clone(mailer);
			let msg = Arc::clone(&msg);
			let ip = v.ip().to_string();
			let email = params.email.clone();
			tokio::spawn(async move {
				if let Err(e) = mailer.send(&ip, &email, &msg).await {
					warn!(ip = %ip, error = %e, "unable to send email");
				}
			});
		}
		if params.cache {
			self.cache.add_message(&m).await.map_err(|e| {
				warn!(error = %e, "unable to cache message");
				HttpError::internal()
			})?;
		}

		{
			let mut state = self.state.lock().expect("server lock");
			state.messages_published += 1;
		}
		metrics::counter!("chime_messages_published_total").increment(1);

		let body = serde_json::to_string(&m).map_err(|_| HttpError::internal())?;
		Ok(json_response(StatusCode::OK, body + "\n"))
	}

	fn parse_publish_params(
		&self,
		headers: &HeaderMap,
		query: &HashMap<String, String>,
		v: &Arc<Visitor>,
		m: &mut Message,
	) -> Result<PublishParams, HttpError> {
		let cache = read_bool_param(headers, query, true, &["x-cache", "cache"]);
		let mut firebase = read_bool_param(headers, query, true, &["x-firebase", "firebase"]);
		m.title = read_param(headers, query, &["x-title", "title", "t"]);
		m.click = read_param(headers, query, &["x-click", "click"]);

		let filename = read_param(headers, query, &["x-filename", "filename", "file", "f"]);
		let attach = read_param(headers, query, &["x-attach", "attach", "a"]);
		if !attach.is_empty() || !filename.is_empty() {
			m.attachment = Some(Attachment::default());
		}
		if let Some(attachment) = m.attachment.as_mut() {
			attachment.name = filename;
			if !attach.is_empty() {
				if !attach.starts_with("http://") && !attach.starts_with("https://") {
					return Err(HttpError::bad_request_attachment_url_invalid());
				}
				attachment.url = attach.clone();
				if attachment.name.is_empty() {
					attachment.name = attach
						.rsplit('/')
						.next()
						.map(|s| s.split(['?', '#']).next().unwrap_or("").to_string())
						.filter(|s| !s.is_empty())
						.unwrap_or_default();
				}
				if attachment.name.is_empty() {
					attachment.name = "attachment".to_string();
				}
			}
		}

		let email = read_param(headers, query, &["x-email", "x-e-mail", "email", "e-mail", "mail", "e"]);
		if !email.is_empty() {
			if v.email_allowed().is_err() {
				return Err(HttpError::too_many_requests_limit_emails());
			}
			if self.mailer.is_none() {
				return Err(HttpError::bad_request_email_disabled());
			}
		}

		let message = read_param(headers, query, &["x-message", "message", "m"]).replace("\\n", "\n");
		if !message.is_empty() {
			m.message = message;
		}

		m.priority = parse_priority(&read_param(headers, query, &["x-priority", "priority", "prio", "p"]))
			.map_err(|_| HttpError::bad_request_priority_invalid())?;

		let tags = read_param(headers, query, &["x-tags", "tags", "tag", "ta"]);
		if !tags.is_empty() {
			m.tags = tags
				.split(',')
				.map(|s| s.trim().to_string())
				.filter(|s| !s.is_empty())
				.collect();
		}

		let delay = read_param(headers, query, &["x-delay", "delay", "x-at", "at", "x-in", "in"]);
		if !delay.is_empty() {
			if !cache {
				return Err(HttpError::bad_request_delay_no_cache());
			}
			if !email.is_empty() {
				// The address cannot be stored alongside the message.
				return Err(HttpError::bad_request_delay_no_email());
			}
			let now = unix_now();
			let delivery = parse_future_time(&delay, now).map_err(|_| HttpError::bad_request_delay_cannot_parse())?;
			if delivery < now + self.config.min_delay.as_secs() as i64 {
				return Err(HttpError::bad_request_delay_too_small());
			}
			if delivery > now + self.config.max_delay.as_secs() as i64 {
				return Err(HttpError::bad_request_delay_too_large());
			}
			m.time = delivery;
		}

		let actions = read_param(headers, query, &["x-actions", "actions", "action"]);
		if !actions.is_empty() {
			m.actions =
				serde_json::from_str::<Vec<serde_json::Value>>(&actions).map_err(|_| HttpError::bad_request_actions_invalid())?;
		}

		let unifiedpush = read_bool_param(headers, query, false, &["x-unifiedpush", "unifiedpush", "up"]);
		if unifiedpush {
			firebase = false;
		}

		Ok(PublishParams {
			cache,
			firebase,
			email,
			unifiedpush,
		})
	}

	/// Decide whether the body is the message text or an attachment.
	async fn handle_publish_body<B>(
		&self,
		headers: &HeaderMap,
		v: &Arc<Visitor>,
		m: &mut Message,
		body: &mut PeekedBody<B>,
		unifiedpush: bool,
	) -> Result<(), HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		if unifiedpush {
			return body_as_message_auto_detect(m, body); // opaque body, base64 if binary
		}
		let attach_url_set = m.attachment.as_ref().map(|a| !a.url.is_empty()).unwrap_or(false);
		if attach_url_set {
			return body_as_text_message(m, body); // body is text, blob is external
		}
		let filename_set = m.attachment.as_ref().map(|a| !a.name.is_empty()).unwrap_or(false);
		if filename_set {
			return self.body_as_attachment(headers, v, m, body).await;
		}
		if !body.limit_reached() && std::str::from_utf8(body.peeked()).is_ok() {
			return body_as_text_message(m, body);
		}
		self.body_as_attachment(headers, v, m, body).await
	}

	async fn body_as_attachment<B>(
		&self,
		headers: &HeaderMap,
		v: &Arc<Visitor>,
		m: &mut Message,
		body: &mut PeekedBody<B>,
	) -> Result<(), HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let (Some(file_cache), Some(base_url)) = (self.file_cache.as_ref(), self.config.base_url.as_deref()) else {
			return Err(HttpError::bad_request_attachments_disallowed());
		};
		let now = unix_now();
		let expires = now + self.config.attachment_expiry_duration.as_secs() as i64;
		if m.time > expires {
			return Err(HttpError::bad_request_attachment_expiry_before_delivery());
		}
		let stats = v.stats().await.map_err(|e| {
			warn!(error = %e, "visitor stats failed");
			HttpError::internal()
		})?;

		// Early do-not-trust check; the hard limit is enforced at write time.
		if let Some(content_length) = headers
			.get("content-length")
			.and_then(|h| h.to_str().ok())
			.and_then(|s| s.parse::<i64>().ok())
		{
			if content_length > stats.visitor_attachment_bytes_remaining
				|| content_length > self.config.attachment_file_size_limit
			{
				return Err(HttpError::entity_too_large_attachment());
			}
		}

		let attachment = m.attachment.get_or_insert_with(Attachment::default);
		attachment.owner = v.ip().to_string(); // drives the per-visitor quota
		attachment.expires = expires;
		let (mime, ext) = content_type::detect(body.peeked(), &attachment.name);
		attachment.content_type = mime;
		attachment.url = format!("{base_url}/file/{}{}", m.id, ext);
		if attachment.name.is_empty() {
			attachment.name = format!("attachment{ext}");
		}
		if m.message.is_empty() {
			m.message = default_attachment_message(&attachment.name);
		}

		let limiters: Vec<Arc<dyn Limiter>> = vec![
			v.bandwidth_limiter(),
			Arc::new(FixedLimiter::new(stats.visitor_attachment_bytes_remaining.max(0) as u64)),
		];
		let size = file_cache.write(&m.id, body, &limiters).await.map_err(|e| match e {
			FileError::LimitReached => HttpError::entity_too_large_attachment(),
			e => {
				warn!(error = %e, "attachment write failed");
				HttpError::internal()
			}
		})?;
		m.attachment.as_mut().expect("attachment just set").size = size;
		Ok(())
	}

	/// Rewrite a JSON publish (`PUT|POST /`) into a `/<topic>` publish with
	/// `X-*` headers so the standard pipeline handles it.
	pub(crate) async fn transform_body_json<B>(
		&self,
		req: Request<B>,
		_v: &Arc<Visitor>,
	) -> Result<Request<Full<Bytes>>, HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let (parts, body) = req.into_parts();
		let body = peek(body, self.config.message_limit).await.map_err(|e| {
			warn!(error = %e, "error reading JSON publish body");
			HttpError::internal()
		})?;
		let envelope: PublishEnvelope =
			serde_json::from_slice(body.peeked()).map_err(|_| HttpError::bad_request_json_invalid())?;
		if !valid_topic(&envelope.topic) {
			return Err(HttpError::bad_request_topic_invalid());
		}
		let message = if envelope.message.is_empty() {
			EMPTY_MESSAGE_BODY.to_string()
		} else {
			envelope.message
		};

		let uri = match parts.uri.query() {
			Some(q) => format!("/{}?{}", envelope.topic, q),
			None => format!("/{}", envelope.topic),
		};
		let mut builder = Request::builder().method(parts.method).uri(uri);
		for (name, value) in parts.headers.iter() {
			builder = builder.header(name, value);
		}
		if !envelope.title.is_empty() {
			builder = builder.header("X-Title", envelope.title);
		}
		if envelope.priority != 0 {
			builder = builder.header("X-Priority", envelope.priority.to_string());
		}
		if !envelope.tags.is_empty() {
			builder = builder.header("X-Tags", envelope.tags.join(","));
		}
		if !envelope.attach.is_empty() {
			builder = builder.header("X-Attach", envelope.attach);
		}
		if !envelope.filename.is_empty() {
			builder = builder.header("X-Filename", envelope.filename);
		}
		if !envelope.click.is_empty() {
			builder = builder.header("X-Click", envelope.click);
		}
		if !envelope.actions.is_empty() {
			let actions = serde_json::to_string(&envelope.actions).map_err(|_| HttpError::bad_request_json_invalid())?;
			builder = builder.header("X-Actions", actions);
		}
		if !envelope.email.is_empty() {
			builder = builder.header("X-Email", envelope.email);
		}
		if !envelope.delay.is_empty() {
			builder = builder.header("X-Delay", envelope.delay);
		}
		builder
			.body(Full::new(Bytes::from(message)))
			.map_err(|_| HttpError::bad_request_json_invalid())
	}
}

fn body_as_message_auto_detect<B>(m: &mut Message, body: &mut PeekedBody<B>) -> Result<(), HttpError>
where
	B: Body<Data = Bytes> + Send + Unpin,
	B::Error: Into<BoxError> + Send,
{
	match std::str::from_utf8(body.peeked()) {
		Ok(text) => m.message = text.to_string(), // not trimmed on purpose
		Err(_) => {
			m.message = STANDARD.encode(body.peeked());
			m.encoding = ENCODING_BASE64.to_string();
		}
	}
	Ok(())
}

fn body_as_text_message<B>(m: &mut Message, body: &mut PeekedBody<B>) -> Result<(), HttpError>
where
	B: Body<Data = Bytes> + Send + Unpin,
	B::Error: Into<BoxError> + Send,
{
	let text = std::str::from_utf8(body.peeked()).map_err(|_| HttpError::bad_request_message_not_utf8())?;
	if !text.is_empty() {
		// An empty body must not override a message given via parameters
		// (publish via GET). Truncated at the peek limit by construction.
		m.message = text.trim().to_string();
	}
	if let Some(attachment) = m.attachment.as_ref() {
		if !attachment.name.is_empty() && m.message.is_empty() {
			m.message = default_attachment_message(&attachment.name);
		}
	}
	Ok(())
}
