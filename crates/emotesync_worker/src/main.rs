#![forbid(unsafe_code)]

mod cache;
mod changes;
mod config;
mod context;
mod election;
mod loader;
mod ports;
mod router;
mod subscriptions;
mod upstream;

#[cfg(test)]
mod smoke_tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::Cache;
use crate::context::WorkerContext;
use crate::election::{ElectionTiming, LocalBusNetwork, spawn_election};
use crate::loader::{BulkLoader, HttpBulkLoader, NullBulkLoader};
use crate::ports::PortRegistry;
use crate::upstream::{ConnectionConfig, spawn_connection_manager};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: emotesync_worker [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Port listener bind address (default: 127.0.0.1:18402)\n\
\t--config   Config file path (default: ~/.emotesync/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
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
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,emotesync_worker=debug".to_string());

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
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_worker_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		cfg.worker.bind = bind;
	}
	info!(
		path = %config_path.display(),
		protocol = emotesync_protocol::version::PROTOCOL_VERSION_U32,
		"loaded worker config (toml + env overrides)"
	);

	init_metrics(cfg.worker.metrics_bind.as_deref());

	let database_url = match cfg.cache.database_url.clone() {
		Some(url) => url,
		None => {
			let url = config::default_database_url()?;
			if let Some(home) = dirs::home_dir() {
				let _ = std::fs::create_dir_all(home.join(".emotesync"));
			}
			url
		}
	};
	let cache = Cache::connect(&database_url).await?;
	info!("cache ready");

	let loader: Arc<dyn BulkLoader> = match cfg.loader.base_url.as_deref() {
		Some(base) => {
			info!(base_url = %base, "bulk loader enabled");
			Arc::new(HttpBulkLoader::new(base)?)
		}
		None => {
			info!("no loader base url configured; running cache-only");
			Arc::new(NullBulkLoader)
		}
	};

	let instance_id = cfg.election.instance_id.unwrap_or_else(|| rand::rng().random());
	let bus = LocalBusNetwork::new().join(instance_id);
	let election = spawn_election(cfg.election.mode, instance_id, bus, ElectionTiming::default());

	let (events_tx, events_rx) = mpsc::unbounded_channel();
	let upstream = spawn_connection_manager(
		ConnectionConfig {
			url: cfg.upstream.url.clone(),
			heartbeat_fallback: Duration::from_millis(cfg.upstream.heartbeat_fallback_ms),
		},
		election.role_rx(),
		events_tx,
	);

	let ports = PortRegistry::new();

	let listener = TcpListener::bind(&cfg.worker.bind).await?;
	info!(bind = %cfg.worker.bind, "port listener ready");
	let (requests_tx, requests_rx) = mpsc::unbounded_channel();
	tokio::spawn(crate::ports::run_port_server(listener, requests_tx));

	// One expiry sweep per process, after a randomized startup delay.
	{
		let cache = cache.clone();
		let ports = ports.clone();
		tokio::spawn(async move {
			let delay = rand::rng().random_range(2_500..=15_000u64);
			tokio::time::sleep(Duration::from_millis(delay)).await;
			if let Ok(Some(last)) = cache.get_setting("last_sweep_at").await {
				info!(last, "previous expiry sweep");
			}
			let exempt = ports.active_channels().await;
			match cache.expire_documents(&exempt).await {
				Ok(stats) => {
					info!(?stats, "expiry sweep complete");
					let now = emotesync_domain::now_unix().to_string();
					if let Err(err) = cache.put_setting("last_sweep_at", &now).await {
						warn!(error = %err, "failed to record sweep time");
					}
				}
				Err(err) => warn!(error = %err, "expiry sweep failed"),
			}
		});
	}

	let context = WorkerContext::new(cache, loader, ports, upstream);
	let router = context.router();

	let _election = election;
	router.run(events_rx, requests_rx).await;
	Ok(())
}
