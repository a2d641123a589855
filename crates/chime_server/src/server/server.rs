#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use chime_protocol::Message;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::server::auth::Auther;
use crate::server::cache::MessageCache;
use crate::server::errors::HttpError;
use crate::server::file_cache::FileCache;
use crate::server::relay::{Mailer, PushRelay, RELAY_CONTROL_TOPIC};
use crate::server::topic::Topic;
use crate::server::visitor::Visitor;

/// Topic names that collide with URL namespaces and can never be topics.
pub const DISALLOWED_TOPICS: [&str; 5] = ["docs", "static", "file", "app", "settings"];

/// The pub/sub server: topic registry, visitor registry, delivery pipeline
/// and background managers. External collaborators (cache, blob store, auth,
/// push relay, mailer) are injected at construction.
pub struct Server {
	pub(crate) config: Arc<ServerConfig>,
	pub(crate) cache: Arc<dyn MessageCache>,
	pub(crate) file_cache: Option<Arc<FileCache>>,
	pub(crate) auther: Option<Arc<dyn Auther>>,
	pub(crate) relay: Option<Arc<dyn PushRelay>>,
	pub(crate) mailer: Option<Arc<dyn Mailer>>,
	pub(crate) state: Mutex<ServerState>,
	pub(crate) cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct ServerState {
	pub(crate) topics: HashMap<String, Topic>,
	pub(crate) visitors: HashMap<String, Arc<Visitor>>,
	pub(crate) messages_published: u64,
}

impl Server {
	pub async fn new(
		config: ServerConfig,
		cache: Arc<dyn MessageCache>,
		file_cache: Option<Arc<FileCache>>,
		auther: Option<Arc<dyn Auther>>,
		relay: Option<Arc<dyn PushRelay>>,
		mailer: Option<Arc<dyn Mailer>>,
	) -> anyhow::Result<Arc<Self>> {
		// Reseed the topic registry so cached topics survive restarts.
		let mut topics = HashMap::new();
		for id in cache.topics().await.context("load cached topics")? {
			topics.insert(id.clone(), Topic::new(id));
		}

		Ok(Arc::new(Self {
			config: Arc::new(config),
			cache,
			file_cache,
			auther,
			relay,
			mailer,
			state: Mutex::new(ServerState {
				topics,
				visitors: HashMap::new(),
				messages_published: 0,
			}),
			cancel: CancellationToken::new(),
		}))
	}

	/// Bind the configured listener and serve until `stop` is called.
	pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
		let addr: SocketAddr = self
			.config
			.listen_http
			.parse()
			.with_context(|| format!("invalid listen address {}", self.config.listen_http))?;
		let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
		self.serve(listener).await
	}

	/// Serve connections from an already bound listener.
	pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
		info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "listening");
		Self::spawn_managers(&self);

		loop {
			let accepted = tokio::select! {
				_ = self.cancel.cancelled() => break,
				accepted = listener.accept() => accepted,
			};
			let (stream, peer) = match accepted {
				Ok(v) => v,
				Err(e) => {
					warn!(error = %e, "accept failed");
					continue;
				}
			};

			let server = Arc::clone(&self);
			tokio::spawn(async move {
				let io = TokioIo::new(stream);
				let peer_ip = peer.ip();
				let service = service_fn(move |req| {
					let server = Arc::clone(&server);
					async move { Ok::<_, std::convert::Infallible>(server.handle(req, peer_ip).await) }
				});
				if let Err(e) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
					debug!(peer = %peer, error = %e, "connection closed with error");
				}
			});
		}

		info!("listener stopped");
		Ok(())
	}

	/// Broadcast shutdown to the accept loop, all streams and all managers.
	pub fn stop(&self) {
		self.cancel.cancel();
	}

	/// Look up (or create) the visitor for a request's source address.
	pub(crate) fn visitor(&self, peer_ip: IpAddr, forwarded_for: Option<&str>) -> Arc<Visitor> {
		let ip = if self.config.behind_proxy {
			forwarded_for
				.map(|s| s.trim().to_string())
				.filter(|s| !s.is_empty())
				.unwrap_or_else(|| peer_ip.to_string())
		} else {
			peer_ip.to_string()
		};

		let mut state = self.state.lock().expect("server lock");
		if let Some(v) = state.visitors.get(&ip) {
			v.keepalive();
			return Arc::clone(v);
		}
		let v = Arc::new(Visitor::new(Arc::clone(&self.config), Arc::clone(&self.cache), ip.clone()));
		state.visitors.insert(ip, Arc::clone(&v));
		v
	}

	pub(crate) fn request_exempt(&self, v: &Visitor) -> bool {
		self.config.visitor_request_exempt_ips.iter().any(|ip| ip == v.ip())
	}

	/// Resolve topic ids into live topics, creating them on first use.
	pub(crate) fn topics_from_ids(&self, ids: &[&str]) -> Result<Vec<Topic>, HttpError> {
		let mut state = self.state.lock().expect("server lock");
		let mut topics = Vec::with_capacity(ids.len());
		for id in ids {
			if DISALLOWED_TOPICS.contains(id) {
				return Err(HttpError::bad_request_topic_disallowed());
			}
			if !chime_protocol::valid_topic(id) {
				return Err(HttpError::bad_request_topic_invalid());
			}
			if !state.topics.contains_key(*id) {
				if state.topics.len() >= self.config.total_topic_limit {
					return Err(HttpError::too_many_requests_limit_total_topics());
				}
				state.topics.insert(id.to_string(), Topic::new(*id));
			}
			topics.push(state.topics.get(*id).expect("topic just inserted").clone());
		}
		Ok(topics)
	}

	/// Parse `/<t1,t2,...>/...` into live topics plus the literal topic list.
	pub(crate) fn topics_from_path(&self, path: &str) -> Result<(Vec<Topic>, String), HttpError> {
		let first = path.split('/').nth(1).unwrap_or("");
		if first.is_empty() {
			return Err(HttpError::bad_request_topic_invalid());
		}
		let ids: Vec<&str> = first.split(',').filter(|s| !s.is_empty()).collect();
		if ids.is_empty() {
			return Err(HttpError::bad_request_topic_invalid());
		}
		let topics = self.topics_from_ids(&ids)?;
		Ok((topics, first.to_string()))
	}

	pub(crate) fn topic_from_path(&self, path: &str) -> Result<Topic, HttpError> {
		let (mut topics, _) = self.topics_from_path(path)?;
		Ok(topics.remove(0))
	}

	fn spawn_managers(this: &Arc<Self>) {
		let server = Arc::clone(this);
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = server.cancel.cancelled() => break,
					_ = tokio::time::sleep(server.config.manager_interval) => server.update_stats_and_prune().await,
				}
			}
		});

		let server = Arc::clone(this);
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = server.cancel.cancelled() => break,
					_ = tokio::time::sleep(server.config.at_sender_interval) => {
						if let Err(e) = server.send_delayed_messages().await {
							warn!(error = %e, "error sending scheduled messages");
						}
					}
				}
			}
		});

		if this.relay.is_some() {
			let server = Arc::clone(this);
			tokio::spawn(async move {
				loop {
					tokio::select! {
						_ = server.cancel.cancelled() => break,
						_ = tokio::time::sleep(server.config.relay_keepalive_interval) => {
							let Some(relay) = server.relay.as_ref() else { break };
							let m = Message::keepalive(RELAY_CONTROL_TOPIC);
							if let Err(e) = relay.publish(&m).await {
								warn!(error = %e, "error sending relay keepalive");
							}
						}
					}
				}
			});
		}
	}

	/// One manager tick: expunge idle visitors, delete expired attachment
	/// blobs, prune the cache, drop empty idle topics, log a stats line.
	pub(crate) async fn update_stats_and_prune(&self) {
		let visitors = {
			let mut state = self.state.lock().expect("server lock");
			state.visitors.retain(|_, v| !v.stale());
			state.visitors.len()
		};

		if let Some(file_cache) = self.file_cache.as_ref() {
			match self.cache.attachments_expired().await {
				Ok(ids) if !ids.is_empty() => {
					if let Err(e) = file_cache.remove(&ids).await {
						warn!(error = %e, "error deleting expired attachments");
					} else if let Err(e) = self.cache.mark_attachments_deleted(&ids).await {
						warn!(error = %e, "error marking attachments deleted");
					}
				}
				Ok(_) => {}
				Err(e) => warn!(error = %e, "error retrieving expired attachments"),
			}
		}

		let older_than = chime_protocol::unix_now() - self.config.cache_duration.as_secs() as i64;
		if let Err(e) = self.cache.prune(older_than).await {
			warn!(error = %e, "error pruning cache");
		}

		// Count per-topic state without holding the server lock across cache
		// queries, then re-check emptiness under the lock before removal.
		let snapshot: Vec<(String, Topic)> = {
			let state = self.state.lock().expect("server lock");
			state.topics.iter().map(|(id, t)| (id.clone(), t.clone())).collect()
		};
		let mut subscribers = 0usize;
		let mut messages = 0usize;
		let mut empty: Vec<String> = Vec::new();
		for (id, topic) in snapshot {
			let msgs = match self.cache.message_count(&id).await {
				Ok(n) => n,
				Err(e) => {
					warn!(topic = %id, error = %e, "cannot get message count");
					continue;
				}
			};
			let subs = topic.subscriber_count();
			if msgs == 0 && subs == 0 {
				empty.push(id);
				continue;
			}
			subscribers += subs;
			messages += msgs;
		}
		let (topics, published) = {
			let mut state = self.state.lock().expect("server lock");
			for id in empty {
				let still_empty = state.topics.get(&id).map(|t| t.subscriber_count() == 0).unwrap_or(false);
				if still_empty {
					state.topics.remove(&id);
				}
			}
			(state.topics.len(), state.messages_published)
		};

		metrics::gauge!("chime_active_topics").set(topics as f64);
		metrics::gauge!("chime_active_subscribers").set(subscribers as f64);
		metrics::gauge!("chime_active_visitors").set(visitors as f64);
		info!(
			published,
			cached = messages,
			topics,
			subscribers,
			visitors,
			"stats"
		);
	}

	/// One scheduler tick: fan out due scheduled messages exactly once.
	pub(crate) async fn send_delayed_messages(&self) -> anyhow::Result<()> {
		let due = self.cache.messages_due().await?;
		for m in due {
			let topic = {
				let state = self.state.lock().expect("server lock");
				state.topics.get(&m.topic).cloned()
			};
			let msg = Arc::new(m.clone());
			// No subscribers is fine; the message is still marked published.
			if let Some(topic) = topic {
				topic.publish(&msg);
			}
			if let Some(relay) = self.relay.as_ref() {
				if let Err(e) = relay.publish(&msg).await {
					warn!(id = %msg.id, error = %e, "unable to mirror scheduled message to relay");
				}
			}
			self.cache.mark_published(&m).await?;
		}
		Ok(())
	}
}
