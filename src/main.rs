use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemd::anomaly::LogSink;
use telemd::config::{load_config, ConfigKey, DaemonSettings};
use telemd::event::LogEvent;
use telemd::storage::{RestrictedStore, SqliteStore};
use telemd::TelemetryService;
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

/// Telemetry daemon configuration compiler and replay tool
#[derive(Parser)]
#[command(name = "telemd")]
#[command(about = "Compile telemetry configs, replay events and query restricted metrics", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Daemon settings file (TOML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a config and report whether it is valid
    Validate {
        /// Config document (.yaml, .yml, .json or .toml)
        config: PathBuf,
    },
    /// Route events from a JSON lines file through a config and print the report
    Replay {
        #[arg(short = 'c', long)]
        config: PathBuf,

        /// One JSON encoded event per line
        #[arg(short = 'e', long)]
        events: PathBuf,

        /// Directory for restricted metric databases
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long, default_value = "0")]
        uid: i32,

        /// Clear reported data after dumping
        #[arg(long)]
        erase: bool,
    },
    /// Run a read-only SQL statement against a restricted store
    Query {
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        config_id: i64,

        #[arg(long, default_value = "0")]
        uid: i32,

        #[arg(long)]
        sql: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = load_settings(cli.settings.as_deref());

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let configured_level = match (&settings, cli.verbose) {
        (Ok(settings), 0) => settings.log_level.clone(),
        _ => None,
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_level.as_deref().unwrap_or(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2) // Show target module for -vv and above
        .with_thread_ids(cli.verbose >= 3) // Show thread IDs for -vvv
        .with_line_number(cli.verbose >= 3) // Show line numbers for -vvv
        .init();

    debug!("telemd started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match settings {
        Ok(settings) => match cli.command {
            Commands::Validate { config } => run_validate(&config).await,
            Commands::Replay {
                config,
                events,
                data_dir,
                uid,
                erase,
            } => run_replay(settings, &config, &events, data_dir, uid, erase).await,
            Commands::Query {
                data_dir,
                config_id,
                uid,
                sql,
            } => run_query(settings, data_dir, ConfigKey::new(uid, config_id), &sql).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<DaemonSettings> {
    match path {
        Some(path) => DaemonSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => {
            let mut settings = DaemonSettings::default();
            settings.merge_env_vars();
            Ok(settings)
        }
    }
}

async fn run_validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)
        .await
        .with_context(|| format!("failed to load {}", path.display()))?;
    let key = ConfigKey::new(0, config.id);
    let graph = telemd::compiler::compile(&config, key, 0, 0)
        .map_err(|reason| anyhow::anyhow!("Invalid config: {}", reason))?;
    println!(
        "OK: config {} compiled ({} matchers, {} conditions, {} metrics)",
        config.id,
        graph.matchers.len(),
        graph.conditions.len(),
        graph.producers.len()
    );
    Ok(())
}

async fn run_replay(
    mut settings: DaemonSettings,
    config_path: &Path,
    events_path: &Path,
    data_dir: Option<PathBuf>,
    uid: i32,
    erase: bool,
) -> anyhow::Result<()> {
    if let Some(dir) = data_dir {
        settings.data_dir = dir;
    }
    let config = load_config(config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let key = ConfigKey::new(uid, config.id);

    let service = TelemetryService::with_sqlite(settings, Arc::new(LogSink));
    service
        .add_config(key, &config, 0, TelemetryService::wall_ns())
        .await?;

    let content = tokio::fs::read_to_string(events_path)
        .await
        .with_context(|| format!("failed to read {}", events_path.display()))?;
    let mut last_ns = 0;
    let mut routed = 0;
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: LogEvent = serde_json::from_str(line)
            .with_context(|| format!("invalid event on line {}", line_no + 1))?;
        last_ns = last_ns.max(event.elapsed_timestamp_ns);
        service.on_log_event(&event);
        routed += 1;
    }
    info!("Replayed {} events", routed);

    let rows = service.flush_restricted().await;
    if rows > 0 {
        info!("Wrote {} restricted rows to {}", rows, service.settings().data_dir.display());
    }
    let report = service.dump_report(key, last_ns, erase)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_query(
    settings: DaemonSettings,
    data_dir: Option<PathBuf>,
    key: ConfigKey,
    sql: &str,
) -> anyhow::Result<()> {
    let store = SqliteStore::new(data_dir.unwrap_or(settings.data_dir));
    let result = store.query(key, sql).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
