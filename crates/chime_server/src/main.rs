#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::cache::{MemCache, MessageCache, NopCache, SqliteCache};
use crate::server::file_cache::FileCache;
use crate::server::server::Server;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chime_server [--listen host:port] [--config path]\n\
\n\
Options:\n\
\t--listen   Bind address (default: 127.0.0.1:2586, or listen_http from config)\n\
\t--config   Config file (default: ~/.chime/server.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	listen: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		listen: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--listen" | "--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--listen must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.listen = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}
	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chime_server=debug".to_string());
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	if let Some(listen) = args.listen {
		cfg.listen_http = listen;
	}

	init_metrics(cfg.metrics_bind.as_deref());

	let cache: Arc<dyn MessageCache> = if cfg.cache_duration.is_zero() {
		info!("message cache disabled");
		Arc::new(NopCache::new())
	} else if let Some(path) = cfg.cache_file.as_deref() {
		info!(path = %path.display(), "using sqlite message cache");
		Arc::new(SqliteCache::open(path).await?)
	} else {
		info!("using in-memory message cache");
		Arc::new(MemCache::new())
	};

	let file_cache = match cfg.attachment_cache_dir.as_deref() {
		Some(dir) => {
			if cfg.base_url.is_none() {
				warn!("attachment cache dir set but base_url missing; attachments stay disabled");
			}
			info!(dir = %dir.display(), "attachments enabled");
			Some(Arc::new(FileCache::new(
				dir,
				cfg.attachment_total_size_limit,
				cfg.attachment_file_size_limit,
			)?))
		}
		None => None,
	};

	// Auth, push relay and mailer are external collaborators; this binary
	// runs without them.
	let server = Server::new(cfg, cache, file_cache, None, None, None).await?;

	let shutdown = Arc::clone(&server);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("shutting down");
			shutdown.stop();
		}
	});

	server.run().await
}
