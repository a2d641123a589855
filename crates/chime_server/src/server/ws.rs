#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use chime_protocol::Message;
use futures_util::{SinkExt as _, StreamExt as _};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tracing::{debug, warn};

use crate::server::errors::HttpError;
use crate::server::params::query_params;
use crate::server::router::{ResponseBody, empty_body};
use crate::server::server::Server;
use crate::server::subscribe::{SubscribeParams, SubscriptionGuard, parse_subscribe_params};
use crate::server::topic::Topic;
use crate::server::visitor::Visitor;
use crate::util::peek::BoxError;

impl Server {
	/// WebSocket subscriber: upgrade the connection, then stream messages as
	/// JSON text frames. Reader and writer run as two halves of one session;
	/// either ending tears the other down.
	pub(crate) async fn handle_subscribe_ws<B>(
		&self,
		mut req: Request<B>,
		v: &Arc<Visitor>,
	) -> Result<Response<ResponseBody>, HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let upgrade_requested = req
			.headers()
			.get("upgrade")
			.and_then(|h| h.to_str().ok())
			.map(|v| v.eq_ignore_ascii_case("websocket"))
			.unwrap_or(false);
		if !upgrade_requested {
			return Err(HttpError::bad_request_websocket_upgrade_missing());
		}
		let key = req
			.headers()
			.get("sec-websocket-key")
			.and_then(|h| h.to_str().ok())
			.map(|s| s.to_string())
			.ok_or_else(HttpError::bad_request_websocket_upgrade_missing)?;

		let guard = SubscriptionGuard::acquire(v)?;
		let (topics, topics_str) = self.topics_from_path(req.uri().path())?;
		let query = query_params(req.uri());
		let params = parse_subscribe_params(req.headers(), &query)?;

		let (msg_tx, msg_rx) = mpsc::channel::<Arc<Message>>(self.config.subscriber_queue_capacity);
		let mut subscriptions: Vec<(Topic, u64)> = Vec::new();
		if !params.poll {
			for topic in &topics {
				let id = topic.subscribe(msg_tx.clone());
				subscriptions.push((topic.clone(), id));
			}
		}
		drop(msg_tx);

		let session = WsSession {
			cache: Arc::clone(&self.cache),
			cancel: self.cancel.clone(),
			keepalive_interval: self.config.keepalive_interval,
			pong_wait: self.config.keepalive_interval + self.config.pong_grace,
			v: Arc::clone(v),
			params,
			topics_str,
			subscriptions,
		};
		let on_upgrade = hyper::upgrade::on(&mut req);
		let ip = v.ip().to_string();
		tokio::spawn(async move {
			let upgraded = match on_upgrade.await {
				Ok(upgraded) => upgraded,
				Err(e) => {
					warn!(ip = %ip, error = %e, "websocket upgrade failed");
					session.teardown();
					drop(guard);
					return;
				}
			};
			let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
			if let Err(e) = session.run(ws, guard, msg_rx).await {
				// Normal closures are not errors.
				debug!(ip = %ip, error = %e, "websocket session ended");
			}
		});

		Ok(Response::builder()
			.status(StatusCode::SWITCHING_PROTOCOLS)
			.header("Upgrade", "websocket")
			.header("Connection", "Upgrade")
			.header("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()))
			.body(empty_body())
			.expect("response"))
	}
}

struct WsSession {
	cache: Arc<dyn crate::server::cache::MessageCache>,
	cancel: tokio_util::sync::CancellationToken,
	keepalive_interval: Duration,
	pong_wait: Duration,
	v: Arc<Visitor>,
	params: SubscribeParams,
	topics_str: String,
	subscriptions: Vec<(Topic, u64)>,
}

impl WsSession {
	async fn run<S>(
		&self,
		ws: WebSocketStream<S>,
		guard: SubscriptionGuard,
		mut msg_rx: mpsc::Receiver<Arc<Message>>,
	) -> anyhow::Result<()>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let _guard = guard;
		let (mut sink, mut stream) = ws.split();

		// The read half only ever sees pings, pongs and close frames; every
		// received frame resets the deadline. Exceeding it ends the session.
		let pong_wait = self.pong_wait;
		let reader = async move {
			loop {
				match timeout(pong_wait, stream.next()).await {
					Err(_) => return Err(anyhow!("read deadline exceeded (no pong)")),
					Ok(None) => return Ok(()),
					Ok(Some(Err(e))) => return Err(anyhow!(e).context("websocket read failed")),
					Ok(Some(Ok(_))) => {}
				}
			}
		};

		let writer = async {
			if !self.params.poll {
				let open = self.encode_json(&Message::open(&self.topics_str))?;
				sink.send(WsMessage::text(open)).await.context("send open event")?;
			}
			for topic_id in self.topics_str.split(',') {
				if self.params.since.is_none() {
					break;
				}
				let messages = self
					.cache
					.messages(topic_id, &self.params.since, self.params.scheduled)
					.await
					.context("replay")?;
				for msg in messages {
					if !self.params.filter.pass(&msg) {
						continue;
					}
					sink.send(WsMessage::text(self.encode_json(&msg)?)).await.context("send replay")?;
				}
			}
			if self.params.poll {
				sink.close().await.ok();
				return Ok(());
			}

			loop {
				tokio::select! {
					_ = self.cancel.cancelled() => return Ok(()),
					received = msg_rx.recv() => {
						match received {
							None => return Ok(()), // dropped by the topic
							Some(msg) => {
								if !self.params.filter.pass(&msg) {
									continue;
								}
								sink.send(WsMessage::text(self.encode_json(&msg)?)).await.context("send message")?;
							}
						}
					}
					_ = tokio::time::sleep(self.keepalive_interval) => {
						self.v.keepalive();
						let keepalive = self.encode_json(&Message::keepalive(&self.topics_str))?;
						sink.send(WsMessage::text(keepalive)).await.context("send keepalive")?;
						sink.send(WsMessage::Ping(Bytes::new())).await.context("send ping")?;
					}
				}
			}
		};

		let result = tokio::select! {
			r = reader => r,
			w = writer => w,
		};
		self.teardown();
		result
	}

	fn encode_json(&self, m: &Message) -> anyhow::Result<String> {
		serde_json::to_string(m).context("encode message")
	}

	fn teardown(&self) {
		for (topic, id) in &self.subscriptions {
			topic.unsubscribe(*id);
		}
	}
}
