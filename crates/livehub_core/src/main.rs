#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use livehub_core::config::{LivehubConfig, default_config_path, load_config_from_path};
use livehub_core::pipeline::health::{HealthState, spawn_health_server};
use livehub_core::pipeline::store::{InMemoryStatsStore, in_memory_store_opener, sql_store_opener};
use livehub_core::pipeline::{Event, EventDetail, Pipeline, StatsStore, StoreOpener};
use livehub_core::sources::DemoSource;
use livehub_domain::{BroadcastId, EventKind, PluginId, ProfileId};
use livehub_source::{LiveSource, WebSocketSource};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: livehub [--config path] [--profile name] [--identity @handle]\n\
\n\
Options:\n\
\t--config    Config file (default: ~/.livehub/config.toml)\n\
\t--profile   Profile whose stats store is used\n\
\t--identity  Broadcast to connect to on start\n\
\t--help      Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	config: Option<PathBuf>,
	profile: Option<ProfileId>,
	identity: Option<BroadcastId>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => args.config = Some(PathBuf::from(value())),
			"--profile" => {
				args.profile = Some(ProfileId::new(value()).unwrap_or_else(|e| {
					eprintln!("--profile: {e}");
					usage_and_exit();
				}))
			}
			"--identity" => {
				args.identity = Some(BroadcastId::new(value()).unwrap_or_else(|e| {
					eprintln!("--identity: {e}");
					usage_and_exit();
				}))
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
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,livehub_core=debug".to_string());

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
				let tracer = tracer_provider.tracer("livehub");
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

fn build_source(cfg: &LivehubConfig) -> anyhow::Result<Box<dyn LiveSource>> {
	if cfg.source.demo {
		info!("starting dev-only demo source (enabled by config/env)");
		return Ok(Box::new(DemoSource::new()));
	}
	let Some(ws_cfg) = cfg.websocket_config() else {
		return Err(anyhow::anyhow!(
			"no source.ws_url configured (set LIVEHUB_WS_URL or LIVEHUB_ENABLE_DEMO_SOURCE=1)"
		));
	};
	info!(ws_url = %ws_cfg.ws_url_template, session_token = ?ws_cfg.session_token, "using websocket source");
	Ok(Box::new(WebSocketSource::new(ws_cfg)))
}

/// One line per delivered event.
async fn console_subscriber(event: Arc<Event>) -> anyhow::Result<()> {
	match &event.detail {
		EventDetail::Chat { text } => info!(actor = %event.actor.display_name, %text, "chat"),
		EventDetail::Gift(g) => info!(
			actor = %event.actor.display_name,
			gift = %g.gift_name,
			count = g.repeat_count,
			value = event.value,
			"gift"
		),
		EventDetail::Like { count } => info!(actor = %event.actor.display_name, count, "like"),
		_ => info!(actor = %event.actor.display_name, kind = %event.kind, "event"),
	}
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => default_config_path()?,
	};
	let mut cfg = load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");
	if let Some(profile) = args.profile {
		cfg.profile = profile;
	}
	if let Some(identity) = args.identity {
		cfg.source.identity = Some(identity);
	}

	init_metrics(cfg.server.metrics_bind.as_deref());

	let opener: StoreOpener = if cfg.persistence.enabled {
		sql_store_opener(cfg.persistence.database_url.clone())
	} else {
		in_memory_store_opener()
	};
	let store: Arc<dyn StatsStore> = match opener(cfg.profile.clone()).await {
		Ok(store) => store,
		Err(e) => {
			warn!(profile = %cfg.profile, error = %format!("{e:#}"), "stats store unavailable; keeping stats in memory");
			Arc::new(InMemoryStatsStore::default())
		}
	};

	let source = build_source(&cfg)?;
	let handle = Pipeline::start(cfg.pipeline_config(), source, store, opener).await;

	let console = PluginId::new("console")?;
	handle.subscribe(console, EventKind::ALL, console_subscriber).await?;

	let health_state = HealthState::new(handle.watch_stats());
	health_state.track_connection(handle.watch_connection_state());
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	if cfg.source.identity.is_none() {
		warn!("no identity configured; waiting (set source.identity or --identity)");
	}

	tokio::signal::ctrl_c().await?;
	info!("ctrl-c received; shutting down");

	handle.shutdown().await?;
	let stats = handle.stats();
	info!(
		likes = stats.likes,
		gifts = stats.gifts,
		total_value = stats.total_value,
		followers = stats.followers,
		shares = stats.shares,
		"final stats"
	);
	Ok(())
}
