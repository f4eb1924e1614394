//! Broadcast host binary entry point
//!
//! Connects to a signaling relay as the broadcast host and serves every
//! viewer that joins.
//!
//! # Usage
//!
//! ```bash
//! # Connect to a local relay with defaults
//! cargo run -p beamcast-host -- --signaling-url ws://localhost:8765
//!
//! # Load a config file and override STUN servers
//! cargo run -p beamcast-host -- \
//!   --config ./beamcast.yaml \
//!   --stun-servers stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302
//!
//! # Constrained networks, JSON logs
//! RUST_LOG=beamcast_engine=debug cargo run -p beamcast-host -- --preset mobile --log-json
//! ```

use anyhow::Context;
use beamcast_engine::{
    BroadcastConfig, BroadcastHost, HostEvent, RecoveryEvent, TurnServerConfig, WebRtcEngine,
    WebSocketConnector,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Beamcast broadcast host
///
/// Streams one local source to many WebRTC viewers coordinated through a
/// WebSocket signaling relay.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(short, long, env = "BEAMCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Built-in configuration preset, used when no config file is given
    #[arg(long, default_value = "default", env = "BEAMCAST_PRESET")]
    preset: Preset,

    /// WebSocket signaling URL (overrides the config file)
    #[arg(long, env = "BEAMCAST_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// STUN servers (comma-separated, overrides the config file)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// TURN server URL
    #[arg(long, env = "BEAMCAST_TURN_URL")]
    turn_url: Option<String>,

    /// TURN username
    #[arg(long, default_value = "", env = "BEAMCAST_TURN_USERNAME")]
    turn_username: String,

    /// TURN credential
    #[arg(long, default_value = "", env = "BEAMCAST_TURN_CREDENTIAL")]
    turn_credential: String,

    /// Disable the bitrate adaptation loop
    #[arg(long, env = "BEAMCAST_NO_QUALITY")]
    no_quality: bool,

    /// Interval for logging aggregate stats in seconds (0 disables)
    #[arg(long, default_value_t = 30, env = "BEAMCAST_STATS_INTERVAL")]
    stats_interval_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "BEAMCAST_LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Preset {
    /// Balanced defaults
    Default,
    /// Lower start bitrate, tolerant thresholds, more reconnect attempts
    Mobile,
    /// Higher bitrate envelope and stricter thresholds
    HighQuality,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    let watchdog = Duration::from_millis(config.shutdown_timeout_ms) + Duration::from_secs(1);

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Ctrl+C received! Initiating shutdown...");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("   [SIGNAL] ⚠️  Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(watchdog);
            eprintln!("⚠️  [WATCHDOG] Graceful shutdown timeout ({:?}), forcing exit", watchdog);
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    // Create multi-threaded tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("beamcast-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config, args.stats_interval_secs, shutdown_flag))
}

fn load_config(args: &Args) -> anyhow::Result<BroadcastConfig> {
    let mut config = match &args.config {
        Some(path) => BroadcastConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let url = args
                .signaling_url
                .clone()
                .unwrap_or_else(|| BroadcastConfig::default().signaling.url);
            match args.preset {
                Preset::Default => BroadcastConfig::default(),
                Preset::Mobile => BroadcastConfig::mobile_network_preset(&url),
                Preset::HighQuality => BroadcastConfig::high_quality_preset(&url),
            }
        }
    };

    if let Some(url) = &args.signaling_url {
        config.signaling.url = url.clone();
    }
    if !args.stun_servers.is_empty() {
        config.ice.stun_servers = args.stun_servers.clone();
    }
    if let Some(url) = &args.turn_url {
        config.ice.turn_servers.push(TurnServerConfig {
            url: url.clone(),
            username: args.turn_username.clone(),
            credential: args.turn_credential.clone(),
        });
    }
    if args.no_quality {
        config.quality.enabled = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn async_main(
    config: BroadcastConfig,
    stats_interval_secs: u64,
    shutdown_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling_url = %config.signaling.url,
        stun_servers = config.ice.stun_servers.len(),
        turn_servers = config.ice.turn_servers.len(),
        quality = config.quality.enabled,
        "Beamcast host starting"
    );

    let root = Span::current();
    let engine = Arc::new(WebRtcEngine::new(&config.ice, &root)?);
    let host = BroadcastHost::new(
        config.clone(),
        engine.clone(),
        Arc::new(WebSocketConnector::default()),
        &root,
    )?;

    let mut events = host.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HostEvent::Recovery(RecoveryEvent::Exhausted { error, .. }) => error!("{}", error.message),
                HostEvent::PeerDropped { peer_id } => warn!("Viewer {} dropped", peer_id),
                _ => {}
            }
        }
    });

    // The relay may not be up yet; the channel keeps retrying on its own
    if let Err(e) = host.start(&config.signaling.url).await {
        warn!("Initial signaling connect failed: {}", e);
    }

    info!("Host running. Press Ctrl+C to shutdown.");

    let mut stats_tick = tokio::time::interval(Duration::from_secs(stats_interval_secs.max(1)));
    stats_tick.tick().await;
    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = stats_tick.tick(), if stats_interval_secs > 0 => {
                let stats = host.stats();
                info!(
                    active = stats.active_connections,
                    total = stats.total_connections,
                    avg_latency_ms = stats.average.latency_ms,
                    avg_bitrate = stats.average.bitrate,
                    encoder_target = ?engine.target_bitrate(),
                    "Broadcast stats"
                );
            }
        }
    }

    info!("Shutdown signal received, cleaning up...");
    host.shutdown().await?;
    info!("Beamcast host shut down gracefully");

    Ok(())
}

fn init_tracing(json: bool) {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
