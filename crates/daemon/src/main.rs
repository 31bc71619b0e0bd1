//! Clawdeck Daemon
//!
//! Serves pty-backed shell sessions over HTTP, and talks to a running daemon
//! from the command line.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::client::ControlClient;
use daemon::config::Config;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use futures_util::StreamExt;
use protocol::{Event, SessionSummary};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Log file name prefix inside `daemon.log_dir`.
const LOG_FILE_PREFIX: &str = "clawdeck-daemon.log";

/// Clawdeck Daemon - interactive shell sessions streamed over HTTP.
#[derive(Parser, Debug)]
#[command(name = "clawdeck-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Show the status of a running daemon
    Status,

    /// Manage sessions on a running daemon
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Follow a session's output until the shell exits
    Attach {
        /// Session ID to follow
        session_id: String,
    },

    /// Print the effective configuration
    Config,
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Spawn a new shell session
    Create,

    /// Kill a session
    Kill {
        /// Session ID to kill
        session_id: String,
    },

    /// Send a line of input to a session
    Send {
        /// Session ID to write to
        session_id: String,

        /// Text to send
        data: String,

        /// Do not append a newline
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    // Handle commands
    match cli.command {
        Commands::Start { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            config.validate()?;

            tracing::info!("Clawdeck daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_foreground(&mut orchestrator).await?;
        }
        Commands::Status => {
            let client = ControlClient::from_config(&config)?;
            match client.health().await {
                Ok(health) => {
                    println!("Daemon Status: running (v{})", health.version);
                    println!("  Address:  {}", client.base_url());
                    println!("  Sessions: {} ({} alive)", health.sessions, health.alive);
                }
                Err(e) => {
                    eprintln!("Daemon is not reachable at {}: {}", client.base_url(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(cmd) => {
            let client = ControlClient::from_config(&config)?;
            match cmd {
                SessionsCommands::List { json } => match client.list().await {
                    Ok(sessions) => {
                        if json {
                            println!("{}", serde_json::to_string_pretty(&sessions)?);
                        } else {
                            print_sessions_table(&sessions);
                        }
                    }
                    Err(e) => {
                        eprintln!("Failed to list sessions: {}", e);
                        std::process::exit(1);
                    }
                },
                SessionsCommands::Create => match client.create().await {
                    Ok(session_id) => println!("{}", session_id),
                    Err(e) => {
                        eprintln!("Failed to create session: {}", e);
                        std::process::exit(1);
                    }
                },
                SessionsCommands::Kill { session_id } => match client.kill(&session_id).await {
                    Ok(()) => println!("Session {} killed", session_id),
                    Err(e) => {
                        eprintln!("Failed to kill session {}: {}", session_id, e);
                        std::process::exit(1);
                    }
                },
                SessionsCommands::Send {
                    session_id,
                    data,
                    raw,
                } => {
                    let data = if raw { data } else { format!("{}\n", data) };
                    if let Err(e) = client.input(&session_id, &data).await {
                        eprintln!("Failed to send input to {}: {}", session_id, e);
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Attach { session_id } => {
            let client = ControlClient::from_config(&config)?;
            attach(&client, &session_id).await?;
        }
        Commands::Config => {
            print!("{}", config.to_redacted_toml()?);
        }
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `--verbose` forces debug.
/// When `daemon.log_dir` is set, logs are also written to a daily file and
/// the returned guard must stay alive to flush it.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.daemon.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (file_writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(file_writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Run the daemon until SIGINT or SIGTERM.
async fn run_foreground(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    // Subscribe before starting so the startup events are logged
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!("Terminal API available at http://{}/api/terminal", addr);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Print a session's output until its shell exits or Ctrl-C is pressed.
async fn attach(client: &ControlClient, session_id: &str) -> anyhow::Result<()> {
    let events = client.attach(session_id);
    tokio::pin!(events);
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => break,
        };

        match event {
            Some(Ok(Event::Output { text })) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            Some(Ok(Event::Status { alive: false })) => break,
            Some(Ok(Event::Status { alive: true } | Event::Ping)) => {}
            Some(Err(e)) => anyhow::bail!("Failed to follow session {}: {}", session_id, e),
            None => break,
        }
    }

    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    // Calculate column widths
    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    // Print header
    println!(
        "{:<id_width$}  {:<6}  {:>12}",
        "ID",
        "STATE",
        "AGE",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 22));

    // Print rows
    for session in sessions {
        println!(
            "{:<id_width$}  {:<6}  {:>12}",
            session.id,
            if session.alive { "alive" } else { "exited" },
            format_duration(session.age_seconds),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
