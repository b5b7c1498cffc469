use clap::Parser;
use marketsync::application::supervisor::{InitialSyncMode, Supervisor};
use marketsync::config::Config;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marketsync", about = "Market data ingestion pipeline")]
struct Cli {
    /// Env file with configuration overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// start | test-sync | sync-once | status
    #[arg(long, default_value = "start")]
    action: String,

    /// Syncer name, required for sync-once
    #[arg(long)]
    syncer: Option<String>,

    /// skip | ordered | random
    #[arg(long, default_value = "ordered")]
    initial_sync_mode: String,
}

fn main() {
    let cli = Cli::parse();

    // Load env config before anything reads it
    match &cli.config {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                eprintln!("Failed to load config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return 1;
        }
    };

    let mode: InitialSyncMode = match cli.initial_sync_mode.parse() {
        Ok(mode) => mode,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    match cli.action.as_str() {
        "start" => {
            let mut supervisor = match Supervisor::build(config).await {
                Ok(supervisor) => supervisor,
                Err(e) => {
                    error!("Failed to build supervisor: {}", e);
                    return 1;
                }
            };

            if let Err(e) = supervisor.start(mode).await {
                error!("Failed to start pipeline: {}", e);
                return 1;
            }

            info!("marketsync running; Ctrl-C to stop");
            let _ = tokio::signal::ctrl_c().await;
            supervisor.shutdown().await;
            0
        }
        "test-sync" => {
            let supervisor = match Supervisor::build(config).await {
                Ok(supervisor) => supervisor,
                Err(e) => {
                    error!("Failed to build supervisor: {}", e);
                    return 1;
                }
            };
            let mut failures = 0;
            for name in supervisor.syncer_names() {
                if let Err(e) = supervisor.sync_once(name).await {
                    error!("test-sync: {} failed: {}", name, e);
                    failures += 1;
                }
            }
            info!("test-sync complete ({} failures)", failures);
            if failures > 0 { 1 } else { 0 }
        }
        "sync-once" => {
            let Some(name) = cli.syncer else {
                error!("--syncer is required for sync-once");
                return 1;
            };
            let supervisor = match Supervisor::build(config).await {
                Ok(supervisor) => supervisor,
                Err(e) => {
                    error!("Failed to build supervisor: {}", e);
                    return 1;
                }
            };
            match supervisor.sync_once(&name).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("sync-once failed: {}", e);
                    1
                }
            }
        }
        "status" => {
            let supervisor = match Supervisor::build(config).await {
                Ok(supervisor) => supervisor,
                Err(e) => {
                    error!("Failed to build supervisor: {}", e);
                    return 1;
                }
            };
            match supervisor.status().await {
                Ok(summary) => {
                    println!("{}", summary);
                    0
                }
                Err(e) => {
                    error!("status failed: {}", e);
                    1
                }
            }
        }
        other => {
            error!("Unknown action: {}", other);
            1
        }
    }
}
