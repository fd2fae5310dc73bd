#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use danmu_domain::RoomAlias;
use danmu_platform::longzhu::{
	DEFAULT_GIFT_CATALOG_URL, DEFAULT_GIFT_REFRESH_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_ROOM_PAGE_BASE_URL,
	DEFAULT_WS_URL, LongzhuEndpoints,
};
use danmu_platform::RoomConfig;
use danmu_util::proxy::ProxyConfig;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(45);
pub const DEFAULT_RESTART_MIN_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RESTART_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default config path: `~/.danmu/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".danmu").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);
	cfg.normalize();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub ingest: IngestSettings,
	pub longzhu: LongzhuEndpoints,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
	pub rooms: Vec<RoomAlias>,
	pub gift_refresh_interval: Duration,
	pub flush_interval: Duration,
	pub restart_min_delay: Duration,
	pub restart_max_delay: Duration,
	pub request_timeout: Duration,
	/// Proxy applied to every room without its own entry.
	pub proxy: Option<ProxyConfig>,
	/// Per-room proxy overrides keyed by alias.
	pub room_proxies: BTreeMap<String, ProxyConfig>,
}

impl Default for IngestSettings {
	fn default() -> Self {
		Self {
			rooms: Vec::new(),
			gift_refresh_interval: DEFAULT_GIFT_REFRESH_INTERVAL,
			flush_interval: DEFAULT_FLUSH_INTERVAL,
			restart_min_delay: DEFAULT_RESTART_MIN_DELAY,
			restart_max_delay: DEFAULT_RESTART_MAX_DELAY,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			proxy: None,
			room_proxies: BTreeMap::new(),
		}
	}
}

impl IngestSettings {
	/// One client config per configured room, with its effective proxy.
	pub fn room_configs(&self) -> Vec<RoomConfig> {
		self.rooms
			.iter()
			.map(|alias| {
				let proxy = self
					.room_proxies
					.get(alias.as_str())
					.or(self.proxy.as_ref())
					.cloned();
				RoomConfig::new(alias.clone()).with_proxy(proxy)
			})
			.collect()
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable persistence.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	ingest: FileIngestSettings,

	#[serde(default)]
	longzhu: FileLongzhuSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIngestSettings {
	#[serde(default)]
	rooms: Vec<String>,
	gift_refresh_interval_secs: Option<u64>,
	flush_interval_secs: Option<u64>,
	restart_min_delay_ms: Option<u64>,
	restart_max_delay_ms: Option<u64>,
	request_timeout_ms: Option<u64>,
	proxy: Option<FileProxySettings>,

	#[serde(default)]
	room_proxies: BTreeMap<String, FileProxySettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProxySettings {
	host: String,
	port: Option<u16>,
	username: Option<String>,
	password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLongzhuSettings {
	room_page_base_url: Option<String>,
	gift_catalog_url: Option<String>,
	ws_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl FileProxySettings {
	fn into_proxy(self) -> Option<ProxyConfig> {
		let host = self.host.trim();
		if host.is_empty() {
			return None;
		}
		let mut proxy = ProxyConfig::new(host, self.port);
		proxy.username = self.username.filter(|s| !s.is_empty());
		proxy.password = self.password.filter(|s| !s.is_empty());
		Some(proxy)
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let rooms = parse_rooms(file.ingest.rooms.iter().map(String::as_str))?;

		let defaults = IngestSettings::default();
		let ingest = IngestSettings {
			rooms,
			gift_refresh_interval: file
				.ingest
				.gift_refresh_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.gift_refresh_interval),
			flush_interval: file
				.ingest
				.flush_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.flush_interval),
			restart_min_delay: file
				.ingest
				.restart_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.restart_min_delay),
			restart_max_delay: file
				.ingest
				.restart_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.restart_max_delay),
			request_timeout: file
				.ingest
				.request_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.request_timeout),
			proxy: file.ingest.proxy.and_then(FileProxySettings::into_proxy),
			room_proxies: file
				.ingest
				.room_proxies
				.into_iter()
				.filter_map(|(alias, p)| p.into_proxy().map(|p| (alias.trim().to_string(), p)))
				.collect(),
		};

		let longzhu = LongzhuEndpoints {
			room_page_base_url: file
				.longzhu
				.room_page_base_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_ROOM_PAGE_BASE_URL.to_string()),
			gift_catalog_url: file
				.longzhu
				.gift_catalog_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_GIFT_CATALOG_URL.to_string()),
			ws_url: file
				.longzhu
				.ws_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
		};

		Ok(Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			ingest,
			longzhu,
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		})
	}

	/// Replace the configured room list (CLI `--room`).
	pub fn override_rooms(&mut self, rooms: Vec<RoomAlias>) {
		if !rooms.is_empty() {
			info!(rooms = rooms.len(), "ingest config: rooms overridden by command line");
			self.ingest.rooms = rooms;
		}
	}

	fn normalize(&mut self) {
		let defaults = IngestSettings::default();
		for (name, value, default) in [
			(
				"gift_refresh_interval",
				&mut self.ingest.gift_refresh_interval,
				defaults.gift_refresh_interval,
			),
			("flush_interval", &mut self.ingest.flush_interval, defaults.flush_interval),
			("request_timeout", &mut self.ingest.request_timeout, defaults.request_timeout),
		] {
			if value.is_zero() {
				warn!(setting = name, default_ms = default.as_millis(), "ingest config: zero interval; using default");
				*value = default;
			}
		}

		if self.ingest.restart_min_delay > self.ingest.restart_max_delay {
			warn!(
				min_ms = self.ingest.restart_min_delay.as_millis(),
				max_ms = self.ingest.restart_max_delay.as_millis(),
				"ingest config: restart_min_delay > restart_max_delay; swapping"
			);
			std::mem::swap(&mut self.ingest.restart_min_delay, &mut self.ingest.restart_max_delay);
		}

		let mut seen = std::collections::BTreeSet::new();
		self.ingest.rooms.retain(|alias| seen.insert(alias.clone()));
	}
}

/// Parse room aliases, rejecting malformed entries and skipping blanks.
pub fn parse_rooms<'a>(raw: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Vec<RoomAlias>> {
	raw.into_iter()
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|s| RoomAlias::new(s).with_context(|| format!("invalid room alias {s:?}")))
		.collect()
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
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("DANMU_ROOMS") {
		match parse_rooms(v.split(',')) {
			Ok(rooms) if !rooms.is_empty() => {
				info!(rooms = rooms.len(), "ingest config: rooms overridden by env");
				cfg.ingest.rooms = rooms;
			}
			Ok(_) => {}
			Err(e) => warn!(error = %e, "ingest config: ignoring invalid DANMU_ROOMS"),
		}
	}

	if let Ok(v) = std::env::var("DANMU_PROXY")
		&& !v.trim().is_empty()
	{
		match ProxyConfig::parse(&v) {
			Ok(proxy) => {
				info!(proxy = %proxy.hostport(), "ingest config: proxy overridden by env");
				cfg.ingest.proxy = Some(proxy);
			}
			Err(e) => warn!(error = %e, "ingest config: ignoring invalid DANMU_PROXY"),
		}
	}

	if let Ok(v) = std::env::var("DANMU_GIFT_REFRESH_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.ingest.gift_refresh_interval = Duration::from_secs(secs);
		info!(secs, "ingest config: gift_refresh_interval overridden by env");
	}

	if let Ok(v) = std::env::var("DANMU_FLUSH_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.ingest.flush_interval = Duration::from_secs(secs);
		info!(secs, "ingest config: flush_interval overridden by env");
	}

	if let Ok(v) = std::env::var("DANMU_RESTART_MIN_DELAY_MS")
		&& let Ok(min_ms) = v.trim().parse::<u64>()
	{
		cfg.ingest.restart_min_delay = Duration::from_millis(min_ms);
		info!(min_ms, "ingest config: restart_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("DANMU_RESTART_MAX_DELAY_MS")
		&& let Ok(max_ms) = v.trim().parse::<u64>()
	{
		cfg.ingest.restart_max_delay = Duration::from_millis(max_ms);
		info!(max_ms, "ingest config: restart_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("DANMU_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DANMU_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DANMU_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("DANMU_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
