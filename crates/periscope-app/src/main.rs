//! Periscope - tap proxy for a fixed upstream.
//!
//! Runs the control-plane API server; the proxy and PAC listeners are
//! started and stopped on demand through `POST /api/command`.

use std::path::PathBuf;

use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use periscope_server::{Server, ServerConfig};

/// Periscope - observe and republish decoded upstream responses
#[derive(Parser, Debug)]
#[command(name = "periscope", version, about)]
struct Args {
    /// Control API port
    #[arg(long, default_value_t = periscope_server::DEFAULT_PORT)]
    port: u16,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rotated log files (defaults to the platform data dir)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log to stdout only, no log files
    #[arg(long)]
    no_file_log: bool,
}

/// Returns the default logs directory.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "periscope", "Periscope").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initializes logging with stdout output and optional file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("periscope={},warn", log_level)));

    let log_dir = if args.no_file_log {
        None
    } else {
        args.log_dir.clone().or_else(logs_dir)
    };

    if let Some(log_dir) = log_dir {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("periscope")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                return Some(guard);
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), port = args.port, "periscope starting");

    let server = Server::new(ServerConfig::default().with_port(args.port))?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}
