use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use gordon::config::Config;
use gordon::engine::Engine;
use gordon::output::Output;
use gordon::queue::RedisQueue;
use gordon::stats::Stats;
use gordon::{basepath, stats, VERSION};

const DEFAULT_CONFIG: &str = "./gordon.config.toml";
const SYSTEM_CONFIG: &str = "/etc/gordon.config.toml";

/// Task-queue dispatcher draining Redis lists into scripts and webhooks.
#[derive(Parser)]
#[command(name = "gordon", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long = "conf")]
    conf: Option<PathBuf>,

    /// Validate the configuration file and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose/debugging output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Write output to this file instead of stdout ("-": use the configured value)
    #[arg(long = "logfile", default_value = "-")]
    logfile: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.conf.clone().unwrap_or_else(default_config_path);
    let loaded = Config::from_file(&config_path);

    if cli.test {
        // exits 0 either way so scripted checks can read the message
        match loaded {
            Ok(_) => println!("Configuration is valid"),
            Err(err) => println!("Configuration is invalid: {err}"),
        }
        return ExitCode::SUCCESS;
    }

    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let logfile = match cli.logfile.as_str() {
        "-" => config.logfile.clone(),
        path => basepath::with(path),
    };
    if let Err(err) = init_tracing(cli.verbose, &logfile) {
        eprintln!("logfile: {err}");
        return ExitCode::FAILURE;
    }

    let output = Output::new(&config.error_script, &config.temp_dir);
    let queue = Arc::new(RedisQueue::new(
        &config.redis_network,
        &config.redis_address,
    ));
    let stats = Arc::new(Stats::new(VERSION));

    let mut engine = match Engine::new(config.clone(), queue, stats.clone(), output.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("engine: {err}");
            return ExitCode::FAILURE;
        }
    };

    if config.stats.is_set() {
        let stats_config = config.stats.clone();
        let stats = stats.clone();
        let output = output.clone();
        tokio::spawn(async move {
            if let Err(err) = stats::serve(stats, &stats_config).await {
                output.notify_error(format!("serving stats failed: {err}"));
            }
        });
    }

    engine.start();
    tracing::info!(version = VERSION, "gordon started");

    // forward the first termination signal into a graceful shutdown
    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining workers");
        shutdown.shutdown();
    });

    engine.wait().await;
    tracing::info!("shutdown complete");

    ExitCode::SUCCESS
}

fn default_config_path() -> PathBuf {
    let local = PathBuf::from(basepath::with(DEFAULT_CONFIG));
    if local.exists() {
        local
    } else {
        PathBuf::from(SYSTEM_CONFIG)
    }
}

fn init_tracing(verbose: bool, logfile: &str) -> std::io::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if logfile.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
