#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use danmu_platform::longzhu::RoomClientSettings;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::sink::{LogSink, PersistenceSink, SqlDanmuSink};
use crate::server::supervisor::{RoomSupervisor, SupervisorConfig};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: danmu_server [--config path] [--room alias]...\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.danmu/config.toml)\n\
\t--room    Room alias to monitor; repeatable, replaces configured rooms\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: Option<PathBuf>,
	rooms: Vec<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: None,
		rooms: Vec::new(),
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			"--room" | "-r" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.rooms.push(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,danmu_server=debug,danmu_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("danmu_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
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

async fn build_sink(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn PersistenceSink>> {
	if !cfg.persistence.enabled {
		info!("persistence disabled; chat records are logged only");
		return Ok(Arc::new(LogSink));
	}
	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
	};
	let sink = SqlDanmuSink::connect(database_url).await?;
	info!("persistence enabled");
	Ok(Arc::new(sink))
}

fn supervisor_config(cfg: &ServerConfig) -> SupervisorConfig {
	SupervisorConfig {
		flush_interval: cfg.ingest.flush_interval,
		restart_min_delay: cfg.ingest.restart_min_delay,
		restart_max_delay: cfg.ingest.restart_max_delay,
		client_settings: RoomClientSettings {
			endpoints: cfg.longzhu.clone(),
			gift_refresh_interval: cfg.ingest.gift_refresh_interval,
			request_timeout: cfg.ingest.request_timeout,
		},
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	server_cfg.override_rooms(crate::config::parse_rooms(args.rooms.iter().map(String::as_str))?);
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let sink = build_sink(&server_cfg).await?;
	let supervisor = Arc::new(RoomSupervisor::new(supervisor_config(&server_cfg), sink));

	let rooms = server_cfg.ingest.room_configs();
	if rooms.is_empty() {
		warn!("no rooms configured; set ingest.rooms, DANMU_ROOMS or pass --room");
	}
	supervisor.start(rooms)?;

	let health_state = HealthState::new(Arc::clone(&supervisor));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}
	health_state.mark_ready();
	info!(rooms = server_cfg.ingest.rooms.len(), "danmu_server: ingest running");

	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");
	supervisor.shutdown().await;

	Ok(())
}
