#![forbid(unsafe_code)]

//! `session-runner`: drive agent sessions from the command line.
//!
//! Runs the startup recovery sweep, then either starts a session and streams
//! its events as JSON lines, reports the sweep, or replays a logged session.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_session_runner::models::event::StreamItem;
use agent_session_runner::models::session::StrategyKind;
use agent_session_runner::orchestrator::service::{ReplayFrom, SessionService};
use agent_session_runner::runner::hub::Subscription;
use agent_session_runner::{AppError, Result, RunnerConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "session-runner", about = "Agent session runner", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session and stream its events; stdin lines become follow-ups.
    Run {
        /// Owning project id.
        #[arg(long)]
        project: String,
        /// Initial prompt.
        #[arg(long)]
        prompt: String,
        /// Execution strategy (streaming or resume).
        #[arg(long)]
        strategy: Option<StrategyKind>,
    },
    /// Run the recovery sweep and print a summary.
    Recover,
    /// Print a logged session's events from an offset.
    Replay {
        /// Owning project id.
        #[arg(long)]
        project: String,
        /// Session id.
        #[arg(long)]
        session: String,
        /// First event id to print.
        #[arg(long, default_value_t = 0)]
        from: u64,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => RunnerConfig::load_from_path(path)?,
        None => {
            let mut config = RunnerConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // ── Recovery runs inside bootstrap, before any admission ──
    let service = SessionService::bootstrap(config)?;

    match args.command {
        Command::Run {
            project,
            prompt,
            strategy,
        } => run_session(&service, &project, &prompt, strategy).await,
        Command::Recover => {
            let report = service.recovery_report();
            println!(
                "{}",
                json!({
                    "scanned": report.scanned,
                    "stopped": report.stopped,
                    "failed": report.failed,
                    "errors": report.errors,
                })
            );
            Ok(())
        }
        Command::Replay {
            project,
            session,
            from,
        } => {
            let subscription = service.subscribe(&project, &session, ReplayFrom::Offset(from))?;
            print_until_done(subscription).await
        }
    }
}

async fn run_session(
    service: &SessionService,
    project: &str,
    prompt: &str,
    strategy: Option<StrategyKind>,
) -> Result<()> {
    let session_id = service.start_session(project, prompt, strategy)?;
    info!(session_id = %session_id, "session started");
    let mut subscription = service.subscribe(project, &session_id, ReplayFrom::Start)?;

    // ── Follow-up messages from stdin ───────────────────
    let input_service = service.clone();
    let input_session = session_id.clone();
    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(err) = input_service.send_message(&input_session, &line).await {
                        warn!(%err, "follow-up rejected");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "failed to read stdin");
                    break;
                }
            }
        }
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut stopping = false;
    loop {
        tokio::select! {
            () = &mut shutdown, if !stopping => {
                info!("shutdown signal received");
                stopping = true;
                service.shutdown().await;
            }
            item = subscription.next() => {
                let Some(item) = item else { break };
                if !print_item(&item)? {
                    break;
                }
            }
        }
    }

    input.abort();
    Ok(())
}

async fn print_until_done(mut subscription: Subscription) -> Result<()> {
    while let Some(item) = subscription.next().await {
        if !print_item(&item)? {
            break;
        }
    }
    Ok(())
}

/// Print one stream item; returns `false` once `done` has been printed.
fn print_item(item: &StreamItem) -> Result<bool> {
    match item {
        StreamItem::Event(event) => {
            let line = serde_json::to_string(event)
                .map_err(|err| AppError::Parse(format!("failed to encode event: {err}")))?;
            println!("{line}");
            Ok(true)
        }
        StreamItem::Keepalive => Ok(true),
        StreamItem::Done(done) => {
            println!("{}", json!({ "done": done }));
            if let Some(err) = &done.error {
                error!(status = ?done.status, error = %err, "session ended with error");
            }
            Ok(false)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
