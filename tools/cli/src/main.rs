//! driveshare CLI - serve the transfer gate and inspect storage drivers.
//!
//! Drivers are configured in a JSON file keyed by driver kind. The `serve`
//! command mounts every configured driver's signed proxy endpoints; the
//! remaining commands exercise one driver from the command line.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use driveshare_common::DrivePath;
use driveshare_gate::TransferGate;
use driveshare_storage::create_default_registry;
use driveshare_storage::token::DAILY_REFRESH;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "driveshare")]
#[command(about = "driveshare - Unified storage drivers behind a signed transfer gate")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the signed proxy endpoints of every configured driver.
    Serve {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the file tree below a path.
    Walk {
        #[arg(short, long)]
        config: PathBuf,

        /// Configured driver kind.
        #[arg(short, long)]
        driver: String,

        /// Directory to walk.
        #[arg(default_value = "/")]
        path: String,
    },

    /// Run the connectivity self-test of configured drivers.
    Check {
        #[arg(short, long)]
        config: PathBuf,

        /// Only check this driver.
        #[arg(short, long)]
        driver: Option<String>,
    },

    /// Mint a transfer URL for a path.
    Sign {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        driver: String,

        /// Operation the URL authorizes.
        #[arg(short, long, value_enum)]
        op: SignOp,

        /// File path on the driver.
        path: String,
    },

    /// Print the configuration schema of every driver kind.
    Drivers,
}

#[derive(Clone, Copy, ValueEnum)]
enum SignOp {
    Upload,
    Delete,
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve { config } => cmd_serve(&config).await,

        Commands::Walk {
            config,
            driver,
            path,
        } => cmd_walk(&config, &driver, &path).await,

        Commands::Check { config, driver } => cmd_check(&config, driver.as_deref()).await,

        Commands::Sign {
            config,
            driver,
            op,
            path,
        } => cmd_sign(&config, &driver, op, &path).await,

        Commands::Drivers => cmd_drivers(),
    }
}

/// Run the transfer gate until interrupted.
async fn cmd_serve(config_path: &PathBuf) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let loaded = config.load_drivers()?;
    if loaded.is_empty() {
        anyhow::bail!("No drivers configured in {}", config_path.display());
    }

    let mut gate = TransferGate::new();
    if let Some(timeout) = config.transfer_timeout() {
        gate = gate.with_transfer_timeout(timeout);
    }

    let mut refreshers = Vec::new();
    for driver in loaded {
        let name = driver.name().to_string();
        gate.register_routes(driver.clone())
            .with_context(|| format!("Failed to mount driver '{}'", name))?;

        if let Some(handle) = driver.spawn_token_refresh(DAILY_REFRESH) {
            refreshers.push(handle);
        }
        if let Some(mut rotations) = driver.subscribe_refresh_token() {
            let name = name.clone();
            refreshers.push(tokio::spawn(async move {
                while rotations.changed().await.is_ok() {
                    info!("Refresh token of {} rotated; persist it to keep access", name);
                }
            }));
        }
        info!("Driver {} ready", name);
    }

    let router = match config.nest_prefix() {
        Some(prefix) => axum::Router::new().nest(&prefix, gate.router()),
        None => gate.router(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(
        "Transfer gate listening on {} under {}",
        config.bind, config.route_prefix
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("Transfer gate failed")?;

    for handle in refreshers {
        handle.abort();
    }
    info!("Transfer gate stopped");
    Ok(())
}

/// Print the tree below a path as JSON.
async fn cmd_walk(config_path: &PathBuf, name: &str, path: &str) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let driver = config.load_driver(name)?;
    let path = DrivePath::parse(path).context("Invalid path")?;

    let tree = driver
        .walk_dir(&path)
        .await
        .with_context(|| format!("Failed to walk {} on {}", path, name))?;

    info!("{} entries below {}", tree.descendant_count(), path);
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

/// Self-test one or all configured drivers.
async fn cmd_check(config_path: &PathBuf, only: Option<&str>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let loaded = match only {
        Some(name) => vec![config.load_driver(name)?],
        None => config.load_drivers()?,
    };

    let mut failed = 0;
    for driver in &loaded {
        match driver.check().await {
            Ok(()) => println!("  [OK]   {}", driver.name()),
            Err(e) => {
                failed += 1;
                println!("  [FAIL] {}: {}", driver.name(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} drivers failed the check", failed, loaded.len());
    }
    Ok(())
}

/// Print a transfer URL for a path.
async fn cmd_sign(config_path: &PathBuf, name: &str, op: SignOp, path: &str) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let driver = config.load_driver(name)?;
    let path = DrivePath::parse(path).context("Invalid path")?;

    match op {
        SignOp::Upload => {
            let url = driver
                .pre_upload_url(&path)
                .await
                .context("Failed to mint upload URL")?;
            println!("{}", url);
        }
        SignOp::Delete => {
            let url = driver
                .pre_delete_url(&path)
                .await
                .context("Failed to mint delete URL")?;
            println!("{}", url);
        }
        SignOp::Download => {
            let urls = driver
                .download_url(&path, &config.mirrors)
                .await
                .context("Failed to mint download URLs")?;
            println!("{}", serde_json::to_string_pretty(&urls)?);
        }
    }

    Ok(())
}

/// Print every driver kind's configuration schema as JSON.
fn cmd_drivers() -> Result<()> {
    let registry = create_default_registry();
    let schemas = registry.schemas();
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}
