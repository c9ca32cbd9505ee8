use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cam_core::camera::{CameraSource, DEFAULT_CHANNEL_CAPACITY};
use cam_core::config::ServerConfig;
use cam_core::keyframe::KeyframeCache;
use cam_core::recorder::Recorder;
use cam_core::registry::ViewerRegistry;
use cam_core::state::AppState;
use cam_core::utils::bind_tcp_listener;
use cam_core::{broadcaster::Broadcaster, web};

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Command-line overrides, layered over the config file per
/// CLI flag > config file > built-in default.
#[derive(Parser, Debug)]
#[command(name = "cam-core")]
#[command(about = "H.264 camera ingest, fan-out, and WebRTC pacing engine", long_about = None)]
struct CliArgs {
    /// Path to the `key = value` configuration file.
    #[arg(short = 'c', long, value_name = "FILE", default_value = "one-cam.conf")]
    config: PathBuf,

    /// Overrides the configured listen address.
    #[arg(short = 'a', long, value_name = "ADDR")]
    addr: Option<u16>,

    /// Shell command that launches the camera and writes raw H.264 Annex-B
    /// to its stdout. Overrides the built-in default derived from the
    /// configured width/height/framerate/rotation/bitrate.
    #[arg(long, value_name = "COMMAND")]
    camera_command: Option<String>,

    /// Log level.
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v debug, -vv trace). Overrides --log-level.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Bounded grace period the HTTP server is given to drain in-flight
/// connections before the process tears down the rest of the pipeline.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cam-core");

    let mut config = ServerConfig::load(&args.config);
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    tracing::info!(%config, "effective configuration");

    let camera_command = args
        .camera_command
        .unwrap_or_else(|| default_camera_command(&config));

    let keyframe_cache = Arc::new(KeyframeCache::new());
    let registry = Arc::new(ViewerRegistry::new());
    let camera = Arc::new(CameraSource::new(camera_command));
    let recorder = Recorder::new(
        config.recording_dir.clone(),
        config.recording_skip_conversion,
        Duration::from_secs_f64(config.recording_max_minutes as f64 * 60.0),
    )
    .await;

    let nal_rx = camera.start(DEFAULT_CHANNEL_CAPACITY).await?;

    let broadcaster = Arc::new(Broadcaster::new(keyframe_cache.clone(), registry.clone()));
    broadcaster.set_recorder(Some(recorder.clone())).await;
    let broadcaster_handle = tokio::spawn(broadcaster.run(nal_rx));
    let recorder_handle = recorder.spawn_task();

    let state = AppState::new(config.clone(), camera.clone(), keyframe_cache, registry.clone(), recorder.clone());
    let app = web::create_router(state);

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.addr);
    let listener = bind_tcp_listener(bind_addr)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!(addr = %bind_addr, "HTTP server listening");

    let shutdown_signal = async {
        shutdown_requested().await;
        tracing::info!("shutdown signal received");
    };

    tokio::select! {
        result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {e}");
            }
        }
    }

    tracing::info!("draining in-flight work before teardown");
    tokio::time::timeout(SHUTDOWN_GRACE, async {
        camera.stop().await;
        recorder.shutdown().await;
        registry.close_all().await;
    })
    .await
    .unwrap_or_else(|_| tracing::warn!("shutdown grace period elapsed before all components finished"));

    broadcaster_handle.abort();
    recorder_handle.abort();

    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves once SIGINT or SIGTERM is received (ctrl_c() alone misses
/// SIGTERM, which is how container runtimes normally ask a process to stop).
async fn shutdown_requested() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Builds the default camera invocation from the configured capture
/// parameters. `--camera-command` on the CLI overrides this entirely for
/// cameras that need a different capture tool.
fn default_camera_command(config: &ServerConfig) -> String {
    let bitrate_flag = if config.bitrate > 0 {
        format!(" --bitrate {}", config.bitrate)
    } else {
        String::new()
    };
    format!(
        "libcamera-vid -t 0 --inline --width {} --height {} --framerate {} --rotation {}{} -o -",
        config.width, config.height, config.framerate, config.rotation, bitrate_flag
    )
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "cam_core=error,tower_http=error",
        LogLevel::Warn => "cam_core=warn,tower_http=warn",
        LogLevel::Info => "cam_core=info,tower_http=info",
        LogLevel::Debug => "cam_core=debug,tower_http=debug",
        LogLevel::Trace => "cam_core=trace,tower_http=debug",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
