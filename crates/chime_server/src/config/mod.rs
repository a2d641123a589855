#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.chime/server.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chime").join("server.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// What `GET /` serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRoot {
	App,
	Home,
	Disabled,
}

/// Typed server configuration consumed by the core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub listen_http: String,
	pub behind_proxy: bool,
	/// Externally visible base URL, e.g. `https://chime.example.com`.
	/// Required for attachments (their download URLs are derived from it).
	pub base_url: Option<String>,
	pub web_root: WebRoot,

	/// Peek limit for classifying a publish body as message or attachment.
	pub message_limit: usize,
	pub min_delay: Duration,
	pub max_delay: Duration,

	/// SQLite cache file; in-memory cache when unset.
	pub cache_file: Option<PathBuf>,
	/// Cache retention; zero disables caching entirely.
	pub cache_duration: Duration,

	pub attachment_cache_dir: Option<PathBuf>,
	pub attachment_total_size_limit: i64,
	pub attachment_file_size_limit: i64,
	pub attachment_expiry_duration: Duration,

	pub keepalive_interval: Duration,
	pub pong_grace: Duration,
	pub manager_interval: Duration,
	pub at_sender_interval: Duration,
	pub relay_keepalive_interval: Duration,

	pub total_topic_limit: usize,
	pub subscriber_queue_capacity: usize,

	pub visitor_request_limit_burst: u32,
	pub visitor_request_limit_replenish: Duration,
	pub visitor_request_exempt_ips: Vec<String>,
	pub visitor_email_limit_burst: u32,
	pub visitor_email_limit_replenish: Duration,
	pub visitor_subscription_limit: u64,
	pub visitor_attachment_total_size_limit: i64,
	pub visitor_attachment_daily_bandwidth_limit: u64,
	pub visitor_expunge_after: Duration,

	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen_http: "127.0.0.1:2586".to_string(),
			behind_proxy: false,
			base_url: None,
			web_root: WebRoot::App,
			message_limit: 4096,
			min_delay: Duration::from_secs(10),
			max_delay: Duration::from_secs(3 * 86400),
			cache_file: None,
			cache_duration: Duration::from_secs(12 * 3600),
			attachment_cache_dir: None,
			attachment_total_size_limit: 5 * 1024 * 1024 * 1024,
			attachment_file_size_limit: 15 * 1024 * 1024,
			attachment_expiry_duration: Duration::from_secs(3 * 3600),
			keepalive_interval: Duration::from_secs(45),
			pong_grace: Duration::from_secs(15),
			manager_interval: Duration::from_secs(60),
			at_sender_interval: Duration::from_secs(10),
			relay_keepalive_interval: Duration::from_secs(3 * 3600),
			total_topic_limit: 15_000,
			subscriber_queue_capacity: 128,
			visitor_request_limit_burst: 60,
			visitor_request_limit_replenish: Duration::from_secs(5),
			visitor_request_exempt_ips: Vec::new(),
			visitor_email_limit_burst: 16,
			visitor_email_limit_replenish: Duration::from_secs(3600),
			visitor_subscription_limit: 30,
			visitor_attachment_total_size_limit: 100 * 1024 * 1024,
			visitor_attachment_daily_bandwidth_limit: 500 * 1024 * 1024,
			visitor_expunge_after: Duration::from_secs(24 * 3600),
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	cache: FileCacheSettings,

	#[serde(default)]
	attachments: FileAttachmentSettings,

	#[serde(default)]
	visitors: FileVisitorSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	listen_http: Option<String>,
	behind_proxy: Option<bool>,
	base_url: Option<String>,
	web_root: Option<String>,
	message_limit: Option<usize>,
	min_delay_secs: Option<u64>,
	max_delay_secs: Option<u64>,
	keepalive_interval_secs: Option<u64>,
	pong_grace_secs: Option<u64>,
	manager_interval_secs: Option<u64>,
	at_sender_interval_secs: Option<u64>,
	relay_keepalive_interval_secs: Option<u64>,
	total_topic_limit: Option<usize>,
	subscriber_queue_capacity: Option<usize>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	file: Option<String>,
	duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAttachmentSettings {
	cache_dir: Option<String>,
	total_size_limit: Option<i64>,
	file_size_limit: Option<i64>,
	expiry_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileVisitorSettings {
	request_limit_burst: Option<u32>,
	request_limit_replenish_secs: Option<u64>,
	#[serde(default)]
	request_exempt_ips: Vec<String>,
	email_limit_burst: Option<u32>,
	email_limit_replenish_secs: Option<u64>,
	subscription_limit: Option<u64>,
	attachment_total_size_limit: Option<i64>,
	attachment_daily_bandwidth_limit: Option<u64>,
	expunge_after_secs: Option<u64>,
}

fn parse_web_root(value: &str) -> WebRoot {
	match value.trim().to_ascii_lowercase().as_str() {
		"home" => WebRoot::Home,
		"disabled" | "off" => WebRoot::Disabled,
		_ => WebRoot::App,
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let mut cfg = Self::default();

		if let Some(v) = file.server.listen_http.filter(|s| !s.trim().is_empty()) {
			cfg.listen_http = v;
		}
		if let Some(v) = file.server.behind_proxy {
			cfg.behind_proxy = v;
		}
		cfg.base_url = file.server.base_url.filter(|s| !s.trim().is_empty()).map(|s| s.trim_end_matches('/').to_string());
		if let Some(v) = file.server.web_root {
			cfg.web_root = parse_web_root(&v);
		}
		if let Some(v) = file.server.message_limit {
			cfg.message_limit = v;
		}
		if let Some(v) = file.server.min_delay_secs {
			cfg.min_delay = Duration::from_secs(v);
		}
		if let Some(v) = file.server.max_delay_secs {
			cfg.max_delay = Duration::from_secs(v);
		}
		if let Some(v) = file.server.keepalive_interval_secs {
			cfg.keepalive_interval = Duration::from_secs(v);
		}
		if let Some(v) = file.server.pong_grace_secs {
			cfg.pong_grace = Duration::from_secs(v);
		}
		if let Some(v) = file.server.manager_interval_secs {
			cfg.manager_interval = Duration::from_secs(v);
		}
		if let Some(v) = file.server.at_sender_interval_secs {
			cfg.at_sender_interval = Duration::from_secs(v);
		}
		if let Some(v) = file.server.relay_keepalive_interval_secs {
			cfg.relay_keepalive_interval = Duration::from_secs(v);
		}
		if let Some(v) = file.server.total_topic_limit {
			cfg.total_topic_limit = v;
		}
		if let Some(v) = file.server.subscriber_queue_capacity {
			cfg.subscriber_queue_capacity = v;
		}
		cfg.metrics_bind = file.server.metrics_bind.filter(|s| !s.trim().is_empty());

		cfg.cache_file = file.cache.file.filter(|s| !s.trim().is_empty()).map(PathBuf::from);
		if let Some(v) = file.cache.duration_secs {
			cfg.cache_duration = Duration::from_secs(v);
		}

		cfg.attachment_cache_dir = file.attachments.cache_dir.filter(|s| !s.trim().is_empty()).map(PathBuf::from);
		if let Some(v) = file.attachments.total_size_limit {
			cfg.attachment_total_size_limit = v;
		}
		if let Some(v) = file.attachments.file_size_limit {
			cfg.attachment_file_size_limit = v;
		}
		if let Some(v) = file.attachments.expiry_duration_secs {
			cfg.attachment_expiry_duration = Duration::from_secs(v);
		}

		if let Some(v) = file.visitors.request_limit_burst {
			cfg.visitor_request_limit_burst = v;
		}
		if let Some(v) = file.visitors.request_limit_replenish_secs {
			cfg.visitor_request_limit_replenish = Duration::from_secs(v);
		}
		cfg.visitor_request_exempt_ips = file.visitors.request_exempt_ips;
		if let Some(v) = file.visitors.email_limit_burst {
			cfg.visitor_email_limit_burst = v;
		}
		if let Some(v) = file.visitors.email_limit_replenish_secs {
			cfg.visitor_email_limit_replenish = Duration::from_secs(v);
		}
		if let Some(v) = file.visitors.subscription_limit {
			cfg.visitor_subscription_limit = v;
		}
		if let Some(v) = file.visitors.attachment_total_size_limit {
			cfg.visitor_attachment_total_size_limit = v;
		}
		if let Some(v) = file.visitors.attachment_daily_bandwidth_limit {
			cfg.visitor_attachment_daily_bandwidth_limit = v;
		}
		if let Some(v) = file.visitors.expunge_after_secs {
			cfg.visitor_expunge_after = Duration::from_secs(v);
		}

		cfg
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("CHIME_LISTEN_HTTP") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.listen_http = v;
			info!("server config: listen_http overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHIME_BEHIND_PROXY")
		&& let Some(behind) = parse_env_bool(&v)
	{
		cfg.behind_proxy = behind;
		info!(behind_proxy = behind, "server config: behind_proxy overridden by env");
	}

	if let Ok(v) = std::env::var("CHIME_BASE_URL") {
		let v = v.trim().trim_end_matches('/').to_string();
		if !v.is_empty() {
			cfg.base_url = Some(v);
			info!("server config: base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHIME_MESSAGE_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
	{
		cfg.message_limit = limit;
		info!(limit, "server config: message_limit overridden by env");
	}

	if let Ok(v) = std::env::var("CHIME_CACHE_FILE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.cache_file = Some(PathBuf::from(v));
			info!("server config: cache_file overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHIME_CACHE_DURATION_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.cache_duration = Duration::from_secs(secs);
		info!(secs, "server config: cache_duration overridden by env");
	}

	if let Ok(v) = std::env::var("CHIME_ATTACHMENT_CACHE_DIR") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.attachment_cache_dir = Some(PathBuf::from(v));
			info!("server config: attachment_cache_dir overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHIME_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}
}
