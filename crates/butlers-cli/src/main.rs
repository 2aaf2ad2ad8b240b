//! The `butlers` command-line interface.
//!
//! Exit codes: 0 success, 2 validation error, 3 unreachable dependency,
//! 1 anything else.

use butlers_config::{DbSettings, RosterConfig, load_roster};
use butlers_daemon::{ButlerRpcClient, Daemon, StorageMode};
use butlers_runtime::CliAdapter;
use butlers_storage::{Database, MigrationRunner, butler_chain, core_chain};
use butlers_telemetry::{LogConfig, LogFormat, setup_logging};
use clap::{Parser, Subcommand};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

const EXIT_VALIDATION: u8 = 2;
const EXIT_UNREACHABLE: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "butlers", about = "Butler orchestration core", version)]
struct Cli {
    /// Path to the roster file.
    #[arg(long, default_value = "roster.toml", global = true)]
    roster: PathBuf,

    /// Log format.
    #[arg(long, default_value = "compact", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start all butlers in one process.
    Up {
        /// Use in-memory stores instead of Postgres (development).
        #[arg(long)]
        mem: bool,
    },
    /// Run the schema chain for one butler.
    Migrate {
        /// The butler to migrate.
        butler: String,
    },
    /// Fire one butler's scheduler once (testing/ops).
    Tick {
        /// The butler to tick.
        butler: String,
    },
    /// Submit an `ingest.v1` envelope from stdin.
    Ingest,
}

/// Failure classes that map onto the documented exit codes.
#[derive(Debug)]
enum CliFailure {
    Validation(String),
    Unreachable(String),
    Other(String),
}

impl std::fmt::Display for CliFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) | Self::Unreachable(msg) | Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl CliFailure {
    const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => EXIT_VALIDATION,
            Self::Unreachable(_) => EXIT_UNREACHABLE,
            Self::Other(_) => 1,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = match cli.log_format.as_str() {
        "json" => LogFormat::Json,
        "pretty" => LogFormat::Pretty,
        _ => LogFormat::Compact,
    };
    if let Err(e) = setup_logging(&LogConfig::new("info").with_format(format)) {
        eprintln!("logging setup failed: {e}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime build failed: {e}");
            return ExitCode::FAILURE;
        },
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.exit_code())
        },
    }
}

async fn run(cli: Cli) -> Result<(), CliFailure> {
    let roster =
        load_roster(&cli.roster).map_err(|e| CliFailure::Validation(e.to_string()))?;

    match cli.command {
        Command::Up { mem } => up(&roster, mem).await,
        Command::Migrate { butler } => migrate(&roster, &butler).await,
        Command::Tick { butler } => tick(&roster, &butler).await,
        Command::Ingest => ingest(&roster).await,
    }
}

async fn up(roster: &RosterConfig, mem: bool) -> Result<(), CliFailure> {
    let mode = if mem {
        StorageMode::Memory
    } else {
        let settings =
            DbSettings::from_env().map_err(|e| CliFailure::Validation(e.to_string()))?;
        StorageMode::Postgres(settings)
    };

    let adapter = Arc::new(
        CliAdapter::discover(roster.daemon.adapter)
            .map_err(|e| CliFailure::Unreachable(e.to_string()))?,
    );

    let daemon = Daemon::start(roster, &mode, adapter, &HashMap::new())
        .await
        .map_err(|e| CliFailure::Unreachable(e.to_string()))?;

    info!("fleet running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CliFailure::Other(e.to_string()))?;
    daemon.shutdown().await;
    Ok(())
}

async fn migrate(roster: &RosterConfig, butler: &str) -> Result<(), CliFailure> {
    let config = roster
        .butler(&butler.into())
        .ok_or_else(|| CliFailure::Validation(format!("unknown butler '{butler}'")))?;
    let settings = DbSettings::from_env().map_err(|e| CliFailure::Validation(e.to_string()))?;

    let db = Database::connect(&settings, &config.schema)
        .await
        .map_err(|e| CliFailure::Unreachable(e.to_string()))?;
    let runner = MigrationRunner::new(db.pool().clone());

    let mut applied = runner
        .run_chain("core", &core_chain())
        .await
        .map_err(|e| CliFailure::Other(e.to_string()))?;
    applied += runner
        .run_chain(&format!("butler:{}", config.schema), &butler_chain(&config.schema))
        .await
        .map_err(|e| CliFailure::Other(e.to_string()))?;

    println!("{applied} migrations applied for {butler}");
    db.close().await;
    Ok(())
}

fn mesh_client(roster: &RosterConfig, butler: &str) -> Result<HttpClient, CliFailure> {
    let config = roster
        .butler(&butler.into())
        .ok_or_else(|| CliFailure::Validation(format!("unknown butler '{butler}'")))?;
    HttpClientBuilder::default()
        .build(format!("http://127.0.0.1:{}", config.port))
        .map_err(|e| CliFailure::Unreachable(e.to_string()))
}

async fn tick(roster: &RosterConfig, butler: &str) -> Result<(), CliFailure> {
    let client = mesh_client(roster, butler)?;
    let report = client
        .tick()
        .await
        .map_err(|e| CliFailure::Unreachable(e.to_string()))?;
    println!(
        "fired: {:?}, lost race: {:?}, failed: {:?}",
        report.fired, report.lost_race, report.failed
    );
    Ok(())
}

async fn ingest(roster: &RosterConfig) -> Result<(), CliFailure> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| CliFailure::Other(e.to_string()))?;
    let envelope: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| CliFailure::Validation(e.to_string()))?;

    let client = mesh_client(roster, "switchboard")?;
    let response = client.ingest(envelope).await.map_err(|e| {
        // The server reports validation failures in-band; transport
        // failures mean the daemon is down.
        let text = e.to_string();
        if text.contains("validation") || text.contains("unsupported schema") {
            CliFailure::Validation(text)
        } else {
            CliFailure::Unreachable(text)
        }
    })?;

    println!(
        "request_id={} duplicate={} status={}",
        response.request_id, response.duplicate, response.status
    );
    Ok(())
}
