//! mousetrace CLI
//!
//! Local input activity recorder.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mousetrace::{
    collector::{check_permission, default_probe, Collector},
    config::Config,
    sandbox::{QueryOutcome, QuerySandbox},
    stats::CaptureStats,
    store::{Store, RESET_CONFIRMATION},
    summary, CaptureError, CaptureService, CAPTURE_DECLARATION, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mousetrace")]
#[command(version = VERSION)]
#[command(about = "Record pointer, keyboard and application activity to a local database", long_about = None)]
struct Cli {
    /// Database file (overrides the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema, or migrate an existing one
    InitDb,

    /// Capture activity until Ctrl+C
    Run {
        /// Foreground application polls per second
        #[arg(long)]
        poll_hz: Option<f64>,

        /// Maximum pointer-move samples per second
        #[arg(long)]
        move_hz: Option<f64>,

        /// Close the session after this many seconds without input
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Do not record pointer moves
        #[arg(long)]
        no_moves: bool,

        /// Do not record keyboard events
        #[arg(long)]
        no_keys: bool,

        /// Stop automatically after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Analyze recorded activity
    Analyze {
        /// Print totals and rates
        #[arg(long)]
        summary: bool,

        /// Print the database schema
        #[arg(long)]
        schema: bool,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run a read-only SQL query
    Query {
        sql: String,

        /// Maximum rows to return
        #[arg(long)]
        limit: Option<usize>,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete all captured data
    Reset {
        /// Required; there is no undo
        #[arg(long)]
        yes_i_am_sure: bool,
    },

    /// Show configuration
    Config {
        /// Write the current configuration to the config file
        #[arg(long)]
        save: bool,
    },

    /// Show permission, database and last-run status
    Status,

    /// Display capture declaration
    Declaration,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: could not load config ({e}), using defaults");
            Config::default()
        }
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    init_logging(&config.log_level);

    let result = match cli.command {
        Commands::InitDb => cmd_init_db(&config),
        Commands::Run {
            poll_hz,
            move_hz,
            idle_timeout,
            no_moves,
            no_keys,
            duration,
        } => {
            if let Some(hz) = poll_hz {
                config.poll_hz = hz;
            }
            if let Some(hz) = move_hz {
                config.move_hz = hz;
            }
            if let Some(secs) = idle_timeout {
                config.idle_timeout = Some(Duration::from_secs(secs));
            }
            config.record_moves &= !no_moves;
            config.record_keys &= !no_keys;
            cmd_run(&config, duration.map(Duration::from_secs))
        }
        Commands::Analyze {
            summary,
            schema,
            json,
        } => cmd_analyze(&config, summary, schema, json),
        Commands::Query { sql, limit, json } => cmd_query(&config, &sql, limit, json),
        Commands::Reset { yes_i_am_sure } => cmd_reset(&config, yes_i_am_sure),
        Commands::Config { save } => cmd_config(&config, save),
        Commands::Status => cmd_status(&config),
        Commands::Declaration => {
            println!("{CAPTURE_DECLARATION}");
            Ok(())
        }
    };

    if let Err(e) = result {
        if matches!(e.downcast_ref::<CaptureError>(), Some(CaptureError::PermissionDenied)) {
            print_permission_help();
        }
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_init_db(config: &Config) -> anyhow::Result<()> {
    let mut store = Store::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let applied = store.initialize().context("initializing schema")?;
    let version = store.schema_version()?;

    if applied == 0 {
        println!("Database is up to date (schema version {version})");
    } else {
        println!("Applied {applied} migration(s), schema version {version}");
    }
    println!("  {}", config.db_path.display());
    Ok(())
}

fn cmd_run(config: &Config, duration: Option<Duration>) -> anyhow::Result<()> {
    println!("mousetrace v{VERSION}");
    println!();

    if !check_permission() {
        return Err(CaptureError::PermissionDenied.into());
    }

    println!("Starting capture...");
    println!("  Database: {}", config.db_path.display());
    println!("  Poll rate: {} Hz", config.poll_hz);
    println!(
        "  Pointer moves: {}",
        if config.record_moves {
            format!("{} Hz", config.move_hz)
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  Keyboard: {}",
        if config.record_keys {
            "enabled"
        } else {
            "disabled"
        }
    );
    match config.idle_timeout {
        Some(idle) => println!("  Idle timeout: {}s", idle.as_secs()),
        None => println!("  Idle timeout: disabled"),
    }

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let source = Collector::new(config.collector_config());
    let service = CaptureService::start(config, Box::new(source), default_probe())?;
    for recovered in service.recovered_sessions() {
        println!(
            "  Recovered session {} (ended {})",
            recovered.id,
            recovered.ended_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        if !service.is_healthy() {
            eprintln!("Capture pipeline stopped unexpectedly");
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    println!();
    println!("Stopping capture...");
    let report = service.stop()?;

    println!();
    println!("{}", report.stats);
    Ok(())
}

fn cmd_analyze(config: &Config, show_summary: bool, schema: bool, json: bool) -> anyhow::Result<()> {
    if !config.db_path.exists() {
        bail!(
            "no database at {} (run `mousetrace init-db` first)",
            config.db_path.display()
        );
    }

    if schema {
        let store = Store::open(&config.db_path)?;
        println!("{}", store.schema_text()?);
    }

    if show_summary || !schema {
        let summary = summary::summarize(&config.db_path)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("Activity Summary");
            println!("================");
            println!();
            print!("{summary}");
        }
    }
    Ok(())
}

fn cmd_query(config: &Config, sql: &str, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    let sandbox = QuerySandbox::from_config(config);
    let outcome = sandbox.execute(sql, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        QueryOutcome::Accepted(result) => {
            println!("{}", result.columns.join("\t"));
            for row in &result.rows {
                let cells: Vec<String> = result
                    .columns
                    .iter()
                    .map(|c| match row.get(c) {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Null) | None => "NULL".to_string(),
                        Some(other) => other.to_string(),
                    })
                    .collect();
                println!("{}", cells.join("\t"));
            }
            if result.truncated {
                eprintln!("(truncated at {} rows)", result.rows.len());
            }
            Ok(())
        }
        QueryOutcome::Rejected(rejection) => bail!("{rejection}"),
    }
}

fn cmd_reset(config: &Config, confirmed: bool) -> anyhow::Result<()> {
    if !confirmed {
        bail!("refusing to delete data without --yes-i-am-sure");
    }
    let mut store = Store::open(&config.db_path)?;
    store.reset(RESET_CONFIRMATION)?;
    println!("All captured data deleted from {}", config.db_path.display());
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);

    if save {
        config.save()?;
        println!();
        println!("Saved.");
    }
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("mousetrace Status");
    println!("=================");
    println!();

    println!(
        "Input Monitoring Permission: {}",
        if check_permission() {
            "Granted ✓"
        } else {
            "Not Granted ✗"
        }
    );
    println!();

    println!("Database: {}", config.db_path.display());
    if config.db_path.exists() {
        let store = Store::open(&config.db_path)?;
        println!("  Schema version: {}", store.schema_version()?);
        println!("  Open sessions: {}", store.open_session_count()?);
    } else {
        println!("  (not created yet)");
    }
    println!();

    match CaptureStats::load_last(&config.stats_path())? {
        Some(last) => {
            println!("Last run (updated {}):", last.last_updated.format("%Y-%m-%d %H:%M:%S"));
            println!("{}", last.stats);
        }
        None => println!("No previous run found."),
    }
    Ok(())
}

fn print_permission_help() {
    eprintln!("Input Monitoring permission not granted.");
    eprintln!();
    eprintln!("To grant permission:");
    eprintln!("1. Open System Settings > Privacy & Security");
    eprintln!("2. Select 'Input Monitoring'");
    eprintln!("3. Add this application to the allowed list");
    eprintln!("4. Restart the application");
    eprintln!();
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");
}
