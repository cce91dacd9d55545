//! # driftline
//!
//! Starts a dev session for the pack or app in the current directory and
//! prints the session event stream until interrupted.
//!
//! ```text
//! driftline [--type pack|app] [--dir PATH] [--config FILE] [--link ID]
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use driftline_core::{LocalProjectLink, ProjectType, SessionEvent};
use driftline_sync::{DevConfig, DevSession, EventSink, LinkFile, SessionFailure, SessionOrchestrator};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "driftline",
    version,
    about = "Keep a local pack or app in sync with the remote service",
    long_about = None,
)]
struct Cli {
    /// Kind of project in the directory.
    #[arg(long = "type", default_value = "pack")]
    project_type: ProjectType,

    /// Project root. Defaults to the current directory.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Config file. Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Link an unlinked directory to this remote project (id or full name).
    #[arg(long)]
    link: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = DevConfig::load(cli.config.clone()).context("loading configuration")?;
    let root = match cli.dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("reading current directory")?,
    };

    let (events, rx) = EventSink::channel();
    let printer = tokio::spawn(print_events(rx));

    let outcome = start_linking_if_asked(&cli, config, &root, &events).await;
    let result = match outcome {
        Ok(session) => {
            tokio::select! {
                _ = session.wait() => warn!("Connection closed for good"),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            session.shutdown().await;
            Ok(())
        }
        Err(e) => Err(e),
    };

    drop(events);
    let _ = printer.await;
    result
}

async fn start(
    config: DevConfig,
    root: &Path,
    project_type: ProjectType,
    events: &EventSink,
) -> Result<DevSession, SessionFailure> {
    SessionOrchestrator::new(config, root, project_type)?
        .with_events(events.clone())
        .run()
        .await
}

/// Starts the session; on `NotLinked` with `--link`, writes the link file and
/// tries once more.
async fn start_linking_if_asked(
    cli: &Cli,
    config: DevConfig,
    root: &Path,
    events: &EventSink,
) -> Result<DevSession> {
    let candidates = match start(config.clone(), root, cli.project_type, events).await {
        Ok(session) => return Ok(session),
        Err(SessionFailure::NotLinked { candidates, .. }) if cli.link.is_some() => candidates,
        Err(failure) => return Err(explain(failure)),
    };

    let wanted = cli.link.as_deref().unwrap_or_default();
    let Some(chosen) = candidates
        .iter()
        .find(|c| c.id == wanted || c.identity == wanted)
    else {
        bail!("no {} named {wanted} is available to link", cli.project_type);
    };

    let link = LocalProjectLink {
        remote_id: chosen.id.clone(),
        project_type: cli.project_type,
        display_name: chosen.display_name.clone(),
    };
    LinkFile::in_root(root)
        .write(&link)
        .context("writing link file")?;
    info!(remote_id = %link.remote_id, "Linked project");

    start(config, root, cli.project_type, events)
        .await
        .map_err(explain)
}

/// Turns a named outcome into something a developer can act on.
fn explain(failure: SessionFailure) -> anyhow::Error {
    match failure {
        SessionFailure::NotLinked {
            project_type,
            candidates,
        } => {
            let listing: Vec<String> = candidates
                .iter()
                .map(|c| format!("  {}  {} ({})", c.id, c.identity, c.display_name))
                .collect();
            anyhow!(
                "this directory is not linked to a {project_type}. \
                 Run again with --link <ID> using one of:\n{}",
                listing.join("\n")
            )
        }
        SessionFailure::UnrecognizedCredentials(reason) => {
            anyhow!("{reason}. Log in to create a keychain first")
        }
        other => anyhow!(other),
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        let line = match &event.detail {
            Some(detail) => format!("[{}] {}", event.kind, detail),
            None => format!("[{}]", event.kind),
        };
        if event.is_problem() {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}
