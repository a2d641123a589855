#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chime_protocol::{DEFAULT_PRIORITY, EventKind, Message, SinceMarker, parse_priority, parse_since};
use hyper::body::{Body, Frame};
use hyper::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::server::errors::HttpError;
use crate::server::params::{query_params, read_bool_param, read_param};
use crate::server::router::ResponseBody;
use crate::server::server::Server;
use crate::server::topic::Topic;
use crate::server::visitor::Visitor;
use crate::util::peek::BoxError;

/// Wire encoding of an HTTP subscriber stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamFormat {
	Json,
	Sse,
	Raw,
}

impl StreamFormat {
	pub(crate) fn content_type(self) -> &'static str {
		match self {
			StreamFormat::Json => "application/x-ndjson; charset=utf-8",
			StreamFormat::Sse => "text/event-stream; charset=utf-8",
			StreamFormat::Raw => "text/plain; charset=utf-8",
		}
	}

	pub(crate) fn encode(self, m: &Message) -> Result<String, serde_json::Error> {
		match self {
			StreamFormat::Json => Ok(serde_json::to_string(m)? + "\n"),
			StreamFormat::Sse => {
				let json = serde_json::to_string(m)?;
				// Default events go out as plain `data:` lines so the
				// browser's .onmessage fires.
				if m.event == EventKind::Message {
					Ok(format!("data: {json}\n\n"))
				} else {
					Ok(format!("event: {}\ndata: {json}\n\n", m.event))
				}
			}
			StreamFormat::Raw => {
				if m.event == EventKind::Message {
					Ok(m.message.replace('\n', " ") + "\n")
				} else {
					// Non-default events are a blank line; keeps the
					// connection warm without polluting the output.
					Ok("\n".to_string())
				}
			}
		}
	}
}

/// Subscriber-side message filters; all present filters must match.
#[derive(Debug, Default, Clone)]
pub(crate) struct QueryFilter {
	message: String,
	title: String,
	priority: Vec<u8>,
	tags: Vec<String>,
}

impl QueryFilter {
	pub(crate) fn parse(headers: &HeaderMap, query: &HashMap<String, String>) -> Result<Self, HttpError> {
		let mut priority = Vec::new();
		let priority_str = read_param(headers, query, &["x-priority", "priority", "prio", "p"]);
		if !priority_str.is_empty() {
			for p in priority_str.split(',') {
				priority.push(parse_priority(p).map_err(|_| HttpError::bad_request_priority_invalid())?);
			}
		}
		let tags_str = read_param(headers, query, &["x-tags", "tags", "tag", "ta"]);
		let tags = if tags_str.is_empty() {
			Vec::new()
		} else {
			tags_str.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
		};
		Ok(Self {
			message: read_param(headers, query, &["x-message", "message", "m"]),
			title: read_param(headers, query, &["x-title", "title", "t"]),
			priority,
			tags,
		})
	}

	/// Synthetic events always pass; filters only constrain real messages.
	pub(crate) fn pass(&self, m: &Message) -> bool {
		if m.event != EventKind::Message {
			return true;
		}
		if !self.message.is_empty() && m.message != self.message {
			return false;
		}
		if !self.title.is_empty() && m.title != self.title {
			return false;
		}
		if !self.priority.is_empty() {
			let p = if m.priority == 0 { DEFAULT_PRIORITY } else { m.priority };
			if !self.priority.contains(&p) {
				return false;
			}
		}
		if !self.tags.is_empty() && !self.tags.iter().all(|t| m.tags.contains(t)) {
			return false;
		}
		true
	}
}

pub(crate) struct SubscribeParams {
	pub poll: bool,
	pub since: SinceMarker,
	pub scheduled: bool,
	pub filter: QueryFilter,
}

pub(crate) fn parse_subscribe_params(headers: &HeaderMap, query: &HashMap<String, String>) -> Result<SubscribeParams, HttpError> {
	let poll = read_bool_param(headers, query, false, &["x-poll", "poll", "po"]);
	let scheduled = read_bool_param(headers, query, false, &["x-scheduled", "scheduled", "sched"]);
	let since = parse_since(&read_param(headers, query, &["x-since", "since", "si"]), poll)
		.map_err(|_| HttpError::bad_request_since_invalid())?;
	let filter = QueryFilter::parse(headers, query)?;
	Ok(SubscribeParams {
		poll,
		since,
		scheduled,
		filter,
	})
}

/// Releases the visitor's subscription slot when the stream ends.
pub(crate) struct SubscriptionGuard {
	v: Arc<Visitor>,
}

impl SubscriptionGuard {
	pub(crate) fn acquire(v: &Arc<Visitor>) -> Result<Self, HttpError> {
		v.subscription_allowed()
			.map_err(|_| HttpError::too_many_requests_limit_subscriptions())?;
		Ok(Self { v: Arc::clone(v) })
	}
}

impl Drop for SubscriptionGuard {
	fn drop(&mut self) {
		self.v.remove_subscription();
	}
}

impl Server {
	/// Long-lived subscriber stream over plain HTTP (NDJSON, SSE or raw).
	/// The response body is fed by a spawned streamer task; client
	/// disconnect tears the task down at its next write.
	pub(crate) async fn handle_subscribe_http<B>(
		&self,
		req: Request<B>,
		v: &Arc<Visitor>,
		format: StreamFormat,
	) -> Result<Response<ResponseBody>, HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let guard = SubscriptionGuard::acquire(v)?;
		let (topics, topics_str) = self.topics_from_path(req.uri().path())?;
		let query = query_params(req.uri());
		let params = parse_subscribe_params(req.headers(), &query)?;

		let (body_tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(8);
		let (msg_tx, msg_rx) = mpsc::channel::<Arc<Message>>(self.config.subscriber_queue_capacity);

		let mut subscriptions: Vec<(Topic, u64)> = Vec::new();
		if !params.poll {
			for topic in &topics {
				let id = topic.subscribe(msg_tx.clone());
				subscriptions.push((topic.clone(), id));
			}
		}
		drop(msg_tx);

		let streamer = HttpStreamer {
			cache: Arc::clone(&self.cache),
			cancel: self.cancel.clone(),
			keepalive_interval: self.config.keepalive_interval,
			v: Arc::clone(v),
			format,
			params,
			topics,
			topics_str,
			subscriptions,
		};
		tokio::spawn(async move {
			streamer.run(guard, msg_rx, body_tx).await;
		});

		Ok(Response::builder()
			.status(StatusCode::OK)
			.header("Content-Type", format.content_type())
			.body(BodyExt::boxed(StreamBody::new(ReceiverStream::new(body_rx))))
			.expect("response"))
	}
}

struct HttpStreamer {
	cache: Arc<dyn crate::server::cache::MessageCache>,
	cancel: tokio_util::sync::CancellationToken,
	keepalive_interval: std::time::Duration,
	v: Arc<Visitor>,
	format: StreamFormat,
	params: SubscribeParams,
	topics: Vec<Topic>,
	topics_str: String,
	subscriptions: Vec<(Topic, u64)>,
}

impl HttpStreamer {
	async fn run(
		self,
		guard: SubscriptionGuard,
		mut msg_rx: mpsc::Receiver<Arc<Message>>,
		body_tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
	) {
		let _guard = guard;

		if !self.params.poll && !self.emit(&body_tx, &Message::open(&self.topics_str)).await {
			self.teardown();
			return;
		}
		if !self.replay(&body_tx).await {
			self.teardown();
			return;
		}
		if self.params.poll {
			return; // nothing registered; closing the body channel ends the response
		}

		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				received = msg_rx.recv() => {
					match received {
						// Channel closed: the topic dropped us (slow consumer).
						None => break,
						Some(msg) => {
							if !self.params.filter.pass(&msg) {
								continue;
							}
							if !self.emit(&body_tx, &msg).await {
								break;
							}
						}
					}
				}
				_ = tokio::time::sleep(self.keepalive_interval) => {
					self.v.keepalive();
					if !self.emit(&body_tx, &Message::keepalive(&self.topics_str)).await {
						break;
					}
				}
			}
		}
		self.teardown();
	}

	/// Send cached history per the since marker; true on success.
	async fn replay(&self, body_tx: &mpsc::Sender<Result<Frame<Bytes>, BoxError>>) -> bool {
		if self.params.since.is_none() {
			return true;
		}
		for topic in &self.topics {
			let messages = match self.cache.messages(topic.id(), &self.params.since, self.params.scheduled).await {
				Ok(messages) => messages,
				Err(e) => {
					warn!(topic = %topic.id(), error = %e, "replay failed");
					return false;
				}
			};
			for msg in messages {
				if !self.params.filter.pass(&msg) {
					continue;
				}
				if !self.emit(body_tx, &msg).await {
					return false;
				}
			}
		}
		true
	}

	async fn emit(&self, body_tx: &mpsc::Sender<Result<Frame<Bytes>, BoxError>>, m: &Message) -> bool {
		let encoded = match self.format.encode(m) {
			Ok(encoded) => encoded,
			Err(e) => {
				warn!(error = %e, "encode failed");
				return false;
			}
		};
		body_tx.send(Ok(Frame::data(Bytes::from(encoded)))).await.is_ok()
	}

	fn teardown(&self) {
		for (topic, id) in &self.subscriptions {
			topic.unsubscribe(*id);
		}
		debug!(topics = %self.topics_str, "subscriber stream closed");
	}
}
