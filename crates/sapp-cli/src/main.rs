//! sapp - voice session client for the robot assistant

mod config;
mod replay;
mod robot;
mod ui;

use anyhow::Context;
use clap::Parser;
use sapp_session::{
    CredentialSource, Credentials, HttpCredentialFetcher, SessionEngine, StaticCredentials,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// sapp - talk to the robot assistant
#[derive(Parser, Debug)]
#[command(name = "sapp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File of newline-delimited data-channel frames to play back once connected
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Delay between replayed frames in milliseconds
    #[arg(long, default_value_t = 250)]
    frame_interval_ms: u64,

    /// Skip the backend and use fixed local credentials
    #[arg(long)]
    offline: bool,

    /// Connect immediately instead of starting muted
    #[arg(long)]
    start_unmuted: bool,

    /// Print session events as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sapp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sapp=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn offline_credentials() -> Credentials {
    Credentials {
        url: "replay://local".to_string(),
        room: "offline".to_string(),
        token: String::new(),
    }
}

fn credential_source(
    cfg: &config::Config,
    offline: bool,
) -> anyhow::Result<Arc<dyn CredentialSource>> {
    if offline {
        return Ok(Arc::new(StaticCredentials(offline_credentials())));
    }

    let backend_url = cfg
        .backend_url
        .as_deref()
        .context("No backend URL configured. Set SAPP_BACKEND_URL or pass --offline")?;
    let password = cfg
        .basic_password
        .clone()
        .context("No backend password configured. Set SAPP_BASIC_PASSWORD")?;

    let fetcher =
        HttpCredentialFetcher::new(backend_url, password).with_timeout(cfg.request_timeout());
    tracing::debug!("Using credential endpoint {}", fetcher.endpoint());
    Ok(Arc::new(fetcher))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let credentials = credential_source(&cfg, args.offline)?;

    let interval = Duration::from_millis(args.frame_interval_ms);
    let transport = match &args.replay {
        Some(path) => replay::ReplayTransport::from_file(path, interval)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?,
        None => replay::ReplayTransport::new(Vec::new(), interval),
    };
    if transport.frames().is_empty() {
        tracing::info!("No frames to replay; connections will stay silent");
    }

    let (engine, handle) = SessionEngine::new(
        cfg.engine_config(),
        credentials,
        Arc::new(transport),
        Arc::new(robot::LoggingRobot),
    );
    tracing::info!(
        "Session {} ready (debounce {:?}, history {})",
        engine.session_id(),
        engine.config().debounce,
        engine.config().history_limit
    );

    let engine_task = engine.spawn();
    let printer = tokio::spawn(ui::print_session(handle.clone(), args.json));

    if args.start_unmuted {
        handle.unmute()?;
    }

    let result = ui::run_commands(&handle).await;

    handle.shutdown();
    engine_task.await?;
    printer.await?;
    result
}
