//! Binary entrypoint for the Meshtastic collector.
//!
//! Commands:
//! - `start [--port <path>]` - collect from a serial radio into PostgreSQL
//! - `replay --file <jsonl> [--dry-run]` - feed a packet capture through the pipeline
//! - `check-db` - one health round-trip against the configured database
//! - `init` - write a starter `config.toml`
//!
//! See the library crate docs for module-level details: `meshtastic_collector::`.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;

use meshtastic_collector::collector::{Collector, CollectorError, RunOutcome};
use meshtastic_collector::config::Config;
use meshtastic_collector::meshtastic::replay::ReplaySource;
use meshtastic_collector::meshtastic::DeviceSource;
use meshtastic_collector::storage::memory::MemoryStore;
use meshtastic_collector::storage::postgres::PostgresStore;
use meshtastic_collector::storage::Store;

#[derive(Parser)]
#[command(name = "meshtastic-collector")]
#[command(about = "Collects Meshtastic mesh traffic into PostgreSQL/TimescaleDB")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start collecting from a serial device
    Start {
        /// Meshtastic device port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Replay a JSON-lines packet capture through the pipeline
    Replay {
        /// Capture file, one packet per line
        #[arg(short, long)]
        file: String,
        /// Use an in-memory store and print a summary instead of writing to the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Check database connectivity
    CheckDb,
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Start { port } => {
            let mut config = Config::load_with_env(&cli.config).await?;
            if let Some(p) = port {
                config.meshtastic.port = p;
            }
            info!("Starting Meshtastic Collector v{}", env!("CARGO_PKG_VERSION"));
            let store: Arc<dyn Store> = Arc::new(PostgresStore::new(&config.database)?);
            let source = serial_source(&config)?;
            let collector = Collector::new(&config, store);
            finish(collector.run(source).await);
        }
        Commands::Replay { file, dry_run } => {
            let config = match Config::load_with_env(&cli.config).await {
                Ok(c) => c,
                Err(e) if dry_run => {
                    warn!("{:#}; using defaults for dry run", e);
                    Config::default()
                }
                Err(e) => return Err(e),
            };
            info!("Replaying {}{}", file, if dry_run { " (dry run)" } else { "" });
            let memory = Arc::new(MemoryStore::new());
            let store: Arc<dyn Store> = if dry_run {
                memory.clone()
            } else {
                Arc::new(PostgresStore::new(&config.database)?)
            };
            let collector = Collector::new(&config, store);
            let result = collector.run(Box::new(ReplaySource::new(&file))).await;
            if dry_run && result.is_ok() {
                let s = collector.stats().snapshot();
                let summary = serde_json::json!({
                    "file": file,
                    "received": s.received,
                    "stored": s.stored,
                    "rejected": s.rejected,
                    "errors": s.errors,
                    "nodes_created": s.nodes_created,
                    "nodes_updated": s.nodes_updated,
                    "nodeinfo_triggers": s.nodeinfo_triggers,
                    "nodes": memory.nodes(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            finish(result);
        }
        Commands::CheckDb => {
            let config = Config::load_with_env(&cli.config).await?;
            let store = PostgresStore::new(&config.database)?;
            let result = store.ping().await;
            let status = serde_json::json!({
                "database": format!(
                    "{}@{}:{}/{}",
                    config.database.user,
                    config.database.host,
                    config.database.port,
                    config.database.name
                ),
                "healthy": result.is_ok(),
                "error": result.as_ref().err().map(|e| e.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            store.close().await;
            if result.is_err() {
                std::process::exit(1);
            }
        }
        Commands::Init => {
            Config::create_default(&cli.config)
                .await
                .with_context(|| format!("Failed to initialize {}", cli.config))?;
            println!("Created default configuration at {}", cli.config);
            println!("Edit the [database] section, then run `meshtastic-collector check-db`.");
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
fn serial_source(config: &Config) -> Result<Box<dyn DeviceSource>> {
    use meshtastic_collector::meshtastic::serial::SerialDevice;
    Ok(Box::new(SerialDevice::new(&config.meshtastic)))
}

#[cfg(not(feature = "serial"))]
fn serial_source(_config: &Config) -> Result<Box<dyn DeviceSource>> {
    anyhow::bail!("this build has no serial support; rebuild with --features serial")
}

/// Exit with the code the run-loop outcome maps to.
fn finish(result: Result<RunOutcome, CollectorError>) {
    match result {
        Ok(RunOutcome::Graceful) => info!("Collector stopped"),
        Ok(outcome @ RunOutcome::Forced { .. }) => {
            warn!("Collector stopped with forced shutdown: {:?}", outcome);
            std::process::exit(outcome.exit_code());
        }
        Err(e) => {
            error!("Fatal: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // -v / -vv override the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Under systemd stdout is not a TTY, so only the file gets the line.
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    // The Postgres driver is chatty at debug level.
    builder.filter_module("tokio_postgres", log::LevelFilter::Info);
    let _ = builder.try_init();
}
