#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::debug;

use crate::election::ElectionMode;

/// Default config path: `~/.emotesync/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".emotesync").join("config.toml"))
}

/// Default cache database: `~/.emotesync/cache.db`.
pub fn default_database_url() -> anyhow::Result<String> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	let path = home.join(".emotesync").join("cache.db");
	Ok(format!("sqlite://{}?mode=rwc", path.display()))
}

/// Load the worker config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_worker_config() -> anyhow::Result<WorkerConfig> {
	let path = default_config_path()?;
	load_worker_config_from_path(&path)
}

/// Same as `load_worker_config` but with an explicit config path.
pub fn load_worker_config_from_path(path: &Path) -> anyhow::Result<WorkerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = WorkerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Worker config (v1).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
	pub worker: WorkerSettings,
	pub upstream: UpstreamSettings,
	pub cache: CacheSettings,
	pub loader: LoaderSettings,
	pub election: ElectionSettings,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
	/// Port listener bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
	/// Upstream event WebSocket URL.
	pub url: String,
	/// Heartbeat interval used until the server's HELLO advertises one, in ms.
	pub heartbeat_fallback_ms: u64,
}

/// Cache persistence settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
	/// Database URL (sqlite:). `None` resolves to the default path at startup.
	pub database_url: Option<String>,
}

/// Bulk Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
	/// REST base URL; when absent the loader is disabled.
	pub base_url: Option<String>,
}

/// Election settings.
#[derive(Debug, Clone)]
pub struct ElectionSettings {
	pub mode: ElectionMode,
	/// Instance id used in vote mode; random when absent.
	pub instance_id: Option<u64>,
}

impl WorkerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			worker: WorkerSettings {
				bind: file.worker.bind.unwrap_or_else(|| "127.0.0.1:18402".to_string()),
				metrics_bind: file.worker.metrics_bind,
			},
			upstream: UpstreamSettings {
				url: file
					.upstream
					.url
					.unwrap_or_else(|| "wss://events.example.invalid/v3".to_string()),
				heartbeat_fallback_ms: file.upstream.heartbeat_fallback_ms.unwrap_or(45_000),
			},
			cache: CacheSettings {
				database_url: file.cache.database_url,
			},
			loader: LoaderSettings {
				base_url: file.loader.base_url,
			},
			election: ElectionSettings {
				mode: file
					.election
					.mode
					.as_deref()
					.map(parse_election_mode)
					.unwrap_or(ElectionMode::Single),
				instance_id: file.election.instance_id,
			},
		}
	}
}

fn parse_election_mode(s: &str) -> ElectionMode {
	match s.trim().to_ascii_lowercase().as_str() {
		"vote" | "voting" => ElectionMode::Vote,
		_ => ElectionMode::Single,
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	worker: FileWorkerSettings,

	#[serde(default)]
	upstream: FileUpstreamSettings,

	#[serde(default)]
	cache: FileCacheSettings,

	#[serde(default)]
	loader: FileLoaderSettings,

	#[serde(default)]
	election: FileElectionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWorkerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUpstreamSettings {
	url: Option<String>,
	heartbeat_fallback_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLoaderSettings {
	base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileElectionSettings {
	mode: Option<String>,
	instance_id: Option<u64>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(text) => {
			let cfg: FileConfig = toml::from_str(&text).context("parse config TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			debug!(path = %path.display(), "no config file; using defaults");
			Ok(None)
		}
		Err(e) => Err(e.into()),
	}
}

fn apply_env_overrides(cfg: &mut WorkerConfig) {
	if let Some(v) = env_nonempty("EMOTESYNC_BIND") {
		cfg.worker.bind = v;
	}
	if let Some(v) = env_nonempty("EMOTESYNC_METRICS_BIND") {
		cfg.worker.metrics_bind = Some(v);
	}
	if let Some(v) = env_nonempty("EMOTESYNC_UPSTREAM_URL") {
		cfg.upstream.url = v;
	}
	if let Some(v) = env_nonempty("EMOTESYNC_DATABASE_URL") {
		cfg.cache.database_url = Some(v);
	}
	if let Some(v) = env_nonempty("EMOTESYNC_LOADER_BASE_URL") {
		cfg.loader.base_url = Some(v);
	}
	if let Some(v) = env_nonempty("EMOTESYNC_ELECTION_MODE") {
		cfg.election.mode = parse_election_mode(&v);
	}
	if let Some(v) = env_nonempty("EMOTESYNC_INSTANCE_ID") {
		match v.parse::<u64>() {
			Ok(id) => cfg.election.instance_id = Some(id),
			Err(_) => tracing::warn!(value = %v, "EMOTESYNC_INSTANCE_ID is not a valid u64; ignoring"),
		}
	}
}

fn env_nonempty(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
