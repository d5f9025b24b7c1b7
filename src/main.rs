//! lexd - a snappy command-line dictionary.
//!
//! Lookups go through a persistent local cache first; misses are served by
//! a background daemon that keeps a warm connection to the remote source.
//! The daemon starts on demand and restarts when the config changes.

mod cache;
mod client;
mod config;
mod daemon;
mod error;
mod protocol;
mod query;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::daemon::{process, DaemonLifecycle, DaemonServer};
use crate::error::Error;
use crate::query::{QueryPipeline, QueryResult};

/// How long the CLI waits for the background frequency count before giving
/// up on the alert. Missing an alert beats hanging the exit.
const HISTORY_WAIT: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "lexd")]
#[command(author, version, about = "A crystal-clean command-line dictionary")]
struct Cli {
    /// The word or phrase to look up
    #[arg(value_name = "TEXT")]
    words: Vec<String>,

    /// Skip the local cache and fetch a fresh result
    #[arg(short = 'n', long)]
    nocache: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the lexd daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Stop the running daemon
    Stop,
    /// Check daemon status
    Status,
    /// Run the daemon in the foreground (for debugging)
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Daemon { action }) => handle_daemon(action).await,
        None => handle_query(cli.words, cli.nocache).await,
    }
}

/// Handle daemon subcommands.
async fn handle_daemon(action: DaemonAction) -> Result<()> {
    match action {
        DaemonAction::Start => start_daemon().await,
        DaemonAction::Stop => stop_daemon().await,
        DaemonAction::Status => daemon_status().await,
        DaemonAction::Run => run_daemon_foreground().await,
    }
}

/// Start the daemon in the background.
/// Note: output goes to stderr so stdout stays clean for results.
async fn start_daemon() -> Result<()> {
    let config = Config::load()?;
    let lifecycle = DaemonLifecycle::new(config);

    match lifecycle.ensure_running().await {
        Ok(info) => {
            eprintln!("Daemon ready (PID {}, port {})", info.pid, info.port);
            Ok(())
        }
        Err(Error::PortInUse { port }) => {
            eprintln!(
                "Port {port} is already in use by another process.\n\
                 Change `port` in {} and try again.",
                Config::config_path()?.display()
            );
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

/// Stop the running daemon.
async fn stop_daemon() -> Result<()> {
    let config = Config::load()?;

    if process::locate(&config).await?.is_none() {
        println!("Daemon is not running");
        return Ok(());
    }

    DaemonLifecycle::new(config).stop().await?;
    println!("Daemon stopped");
    Ok(())
}

/// Show daemon status and the paths that matter.
async fn daemon_status() -> Result<()> {
    let config = Config::load()?;

    match process::locate(&config).await? {
        Some(info) => {
            println!("Daemon: running");
            println!("PID: {}", info.pid);
            println!("Port: {}", info.port);
            if let Some(started) = chrono::DateTime::from_timestamp(info.started_at, 0) {
                println!("Started: {}", started.to_rfc3339());
            }
        }
        None => {
            println!("Daemon: not running");
            println!("Start with: lexd daemon start");
        }
    }
    println!("Config: {}", Config::config_path()?.display());
    println!("Data: {}", Config::data_dir()?.display());
    Ok(())
}

/// Run the daemon in the foreground.
async fn run_daemon_foreground() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lexd=info".parse().unwrap())
                .add_directive("reqwest=warn".parse().unwrap()),
        )
        .init();

    info!("Starting lexd daemon...");

    let config = Config::load().context("Failed to load configuration")?;
    let server = DaemonServer::new(config)?;

    if let Err(err) = server.run().await {
        if let Some(Error::PortInUse { port }) = err.downcast_ref::<Error>() {
            eprintln!(
                "Port {port} is already in use by another process.\n\
                 Change `port` in {} and try again.",
                Config::config_path()?.display()
            );
            std::process::exit(1);
        }
        return Err(err);
    }
    Ok(())
}

/// Handle a lookup from the command line.
async fn handle_query(words: Vec<String>, nocache: bool) -> Result<()> {
    if words.is_empty() {
        show_prompt();
        return Ok(());
    }
    let text = words.join(" ");

    let config = Config::load()?;
    let store = CacheStore::open(Config::cache_db_path()?)
        .context("cannot open the local cache store")?;
    let pipeline = QueryPipeline::new(config.clone(), store);

    restart_daemon_if_stale(&config).await?;

    let outcome = pipeline.query(&text, nocache).await;

    let status = match outcome {
        Ok(result) => {
            report_result(result, config.freq_alert).await;
            Ok(())
        }
        // Reported once by the anyhow boundary after cleanup runs.
        Err(err) => Err(err.into()),
    };

    // All spawned counter updates finish (or are abandoned) before the
    // store handle drops on the way out, error path included.
    pipeline.join_background().await;
    status
}

/// A daemon older than the config file serves stale settings; bounce it.
async fn restart_daemon_if_stale(config: &Config) -> Result<()> {
    let Some(info) = process::locate(config).await? else {
        return Ok(());
    };
    if !config.modified_after(info.started_at) {
        return Ok(());
    }

    eprintln!("Configuration changed, restarting daemon...");
    let lifecycle = DaemonLifecycle::new(config.clone());
    if let Err(err) = lifecycle.stop().await {
        // Reported but not fatal; the query itself may still succeed.
        eprintln!("Warning: {err}");
        return Ok(());
    }
    if let Err(err) = lifecycle.ensure_running().await {
        eprintln!("Warning: {err}");
    }
    Ok(())
}

/// Print the result and, when enabled, the monthly-frequency warning.
async fn report_result(result: QueryResult, freq_alert: bool) {
    let QueryResult {
        query,
        found,
        entries,
        prompt,
        history,
    } = result;

    if freq_alert {
        if let Some(count) = history.read(HISTORY_WAIT).await {
            if count > 3 {
                eprintln!("Lookup #{count} of `{query}` this month");
            }
        }
    }

    if !found {
        match prompt {
            Some(prompt) => eprintln!("{prompt}"),
            None => println!("Not found :("),
        }
        return;
    }

    for entry in entries {
        match &entry.phonetic {
            Some(phonetic) => println!("{}  {}", entry.word, phonetic),
            None => println!("{}", entry.word),
        }
        for sense in entry.senses {
            println!("  [{}]", sense.part_of_speech);
            for (i, definition) in sense.definitions.iter().enumerate() {
                println!("  {}. {}", i + 1, definition);
            }
        }
    }
}

fn show_prompt() {
    println!("lexd <text>    look up a word or phrase");
    println!("lexd -h        show detailed help");
}
