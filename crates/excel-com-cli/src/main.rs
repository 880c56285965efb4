//! xlhost - runs the Excel session engine and talks to it over the status channel

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use excel_com_session::status::{default_endpoint, StatusClient, StatusError, StatusServer};
use excel_com_session::{
    BridgeConfig, BridgeLauncher, ClosePolicy, EngineConfig, SessionManager, SessionRequest,
    StatusConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STOP_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "xlhost")]
#[command(author, version, about = "Excel host session engine")]
struct Cli {
    /// Status channel endpoint (default: per-user socket or pipe)
    #[arg(long, global = true)]
    endpoint: Option<PathBuf>,

    /// Machine-readable output; logs stay off unless XLHOST_LOG is set
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run, check or stop the engine service
    #[command(subcommand)]
    Service(ServiceCommand),

    /// Inspect and close sessions of a running engine
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// Run the engine in the foreground until Ctrl-C
    Run(RunArgs),

    /// Check whether an engine is listening
    Status {
        /// Print a JSON object instead of a sentence
        #[arg(long)]
        json: bool,
    },

    /// Ask a running engine to close its sessions and exit
    Stop,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// List active sessions
    #[command(alias = "ls")]
    List {
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Close a session
    Close {
        /// Session id as shown by `session list`
        session_id: String,

        /// Save the workbook before closing
        #[arg(short, long)]
        save: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Workbooks to open at startup (created if missing)
    #[arg(long = "open", value_name = "FILE")]
    open: Vec<PathBuf>,

    /// Show Excel windows for the workbooks opened at startup
    #[arg(long)]
    visible: bool,

    /// Path to excel-com-bridge.exe
    #[arg(long, value_name = "PATH")]
    bridge_exe: Option<PathBuf>,

    /// Wine binary used to run the bridge on non-Windows hosts
    #[arg(long, value_name = "PATH")]
    wine: Option<PathBuf>,

    /// WINEPREFIX for the bridge process
    #[arg(long, value_name = "DIR")]
    wine_prefix: Option<PathBuf>,

    /// Default batch timeout in seconds
    #[arg(long, default_value = "120", value_name = "SECS")]
    timeout: u64,

    /// Let close requests wait this many seconds for running batches
    /// instead of failing fast
    #[arg(long, value_name = "SECS")]
    wait_for_idle: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    let endpoint = cli.endpoint.unwrap_or_else(default_endpoint);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Commands::Service(ServiceCommand::Run(args)) => runtime.block_on(run_service(args, endpoint)),
        Commands::Service(ServiceCommand::Status { json }) => {
            runtime.block_on(service_status(endpoint, json || cli.quiet))
        }
        Commands::Service(ServiceCommand::Stop) => runtime.block_on(stop_service(endpoint, cli.quiet)),
        Commands::Session(SessionCommand::List { json }) => {
            runtime.block_on(list_sessions(endpoint, json || cli.quiet))
        }
        Commands::Session(SessionCommand::Close { session_id, save }) => {
            runtime.block_on(close_session(endpoint, &session_id, save))
        }
    }
}

fn init_tracing(quiet: bool) {
    let fallback = if quiet { "off" } else { "info" };
    let filter = EnvFilter::try_from_env("XLHOST_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_service(args: RunArgs, endpoint: PathBuf) -> Result<()> {
    let mut bridge = BridgeConfig {
        bridge_exe_path: args.bridge_exe,
        wine_prefix: args.wine_prefix,
        ..BridgeConfig::default()
    };
    if let Some(wine) = args.wine {
        bridge.wine_path = wine;
    }

    let config = EngineConfig {
        default_timeout: Duration::from_secs(args.timeout),
        close_policy: match args.wait_for_idle {
            Some(secs) => ClosePolicy::WaitForIdle(Duration::from_secs(secs)),
            None => ClosePolicy::FailFast,
        },
        ..EngineConfig::default()
    };

    let manager = Arc::new(SessionManager::new(
        Arc::new(BridgeLauncher::new(bridge)),
        config,
    ));

    let server = StatusServer::bind(
        Arc::clone(&manager),
        StatusConfig {
            endpoint: Some(endpoint.clone()),
            ..StatusConfig::default()
        },
    )
    .with_context(|| format!("Failed to bind status channel at '{}'", endpoint.display()))?;

    for file in args.open {
        let opener = Arc::clone(&manager);
        let request = SessionRequest::new(&file).visible(args.visible);
        let session = tokio::task::spawn_blocking(move || opener.open(request))
            .await
            .context("Session open task failed")?
            .with_context(|| format!("Failed to open '{}'", file.display()))?;
        println!("{}\t{}", session.id(), session.file());
    }

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Status channel failed")?;

    info!("shutting down sessions");
    tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .context("Shutdown task failed")?;
    Ok(())
}

/// `{"running":true,...}` on one line, matched verbatim by scripts.
fn status_json(endpoint: &Path, session_count: Option<usize>) -> serde_json::Value {
    match session_count {
        Some(count) => json!({
            "running": true,
            "endpoint": endpoint.display().to_string(),
            "sessionCount": count,
        }),
        None => json!({
            "running": false,
            "endpoint": endpoint.display().to_string(),
        }),
    }
}

async fn service_status(endpoint: PathBuf, json: bool) -> Result<()> {
    match StatusClient::new(&endpoint).list().await {
        Ok(list) if json => {
            println!("{}", status_json(&endpoint, Some(list.count)));
            Ok(())
        }
        Ok(list) => {
            println!(
                "running on {} ({} session{})",
                endpoint.display(),
                list.count,
                if list.count == 1 { "" } else { "s" }
            );
            Ok(())
        }
        Err(StatusError::NotRunning(path)) => {
            if json {
                println!("{}", status_json(&path, None));
            }
            bail!("not running (no listener at '{}')", path.display())
        }
        Err(e) => Err(e).context("Status request failed"),
    }
}

async fn stop_service(endpoint: PathBuf, quiet: bool) -> Result<()> {
    let client = StatusClient::new(&endpoint);
    match client.stop().await {
        Ok(response) if response.stopping => {}
        Ok(_) => bail!("engine at '{}' refused to stop", endpoint.display()),
        Err(StatusError::NotRunning(path)) => bail!("not running (no listener at '{}')", path.display()),
        Err(e) => return Err(e).context("Stop request failed"),
    }

    // The engine drops its endpoint once it stops accepting connections.
    let deadline = tokio::time::Instant::now() + STOP_WAIT;
    while !matches!(client.list().await, Err(StatusError::NotRunning(_))) {
        if tokio::time::Instant::now() >= deadline {
            bail!("engine at '{}' is still listening after {STOP_WAIT:?}", endpoint.display());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if quiet {
        println!("{}", json!({"stopped": true}));
    } else {
        println!("Stopped engine at {}", endpoint.display());
    }
    Ok(())
}

async fn list_sessions(endpoint: PathBuf, json: bool) -> Result<()> {
    let list = StatusClient::new(endpoint)
        .list()
        .await
        .context("Failed to list sessions")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&list).context("Failed to encode response")?
        );
        return Ok(());
    }
    if list.sessions.is_empty() {
        eprintln!("No active sessions");
        return Ok(());
    }

    println!("{:<10} {:>6} {:>8} {:>9}  FILE", "ID", "OPS", "VISIBLE", "CLOSABLE");
    for session in &list.sessions {
        println!(
            "{:<10} {:>6} {:>8} {:>9}  {}",
            session.session_id,
            session.active_operations,
            yes_no(session.is_visible),
            yes_no(session.can_close),
            session.file_path
        );
    }
    Ok(())
}

async fn close_session(endpoint: PathBuf, session_id: &str, save: bool) -> Result<()> {
    let response = StatusClient::new(endpoint)
        .close(session_id, save)
        .await
        .with_context(|| format!("Failed to close session '{session_id}'"))?;

    if !response.success {
        bail!(
            "{}",
            response
                .error_message
                .unwrap_or_else(|| format!("Session '{session_id}' was not closed"))
        );
    }
    if response.saved {
        println!("Saved and closed session '{session_id}'");
    } else {
        println!("Closed session '{session_id}'");
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
