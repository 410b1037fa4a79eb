//! blueprint-queue: unattended installer queue
//!
//! Accepts blueprint artifacts over a Unix socket (and optionally from a drop
//! directory), queues them and installs them one at a time, answering the
//! installer's interactive prompts and streaming progress back to the
//! submitter.
//!
//! Usage:
//!   BLUEPRINT_QUEUE_TOKEN=... blueprint-queue --install-root /var/www/pterodactyl

// Allow dead code - this binary has public API components that may not be used internally
#![allow(dead_code)]

mod artifact;
mod controller;
mod error;
mod inbox;
mod intake;
mod matcher;
mod progress;
mod protocol;
mod queue;
mod socket;
mod supervisor;
mod trigger;

use anyhow::{bail, Result};
use clap::Parser;
use controller::DrainController;
use inbox::Inbox;
use matcher::PromptMatcher;
use progress::BroadcastSink;
use protocol::Config;
use socket::{ConnectionContext, SocketServer};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::CommandLauncher;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Unattended installer queue with interactive prompt answering
#[derive(Parser, Debug)]
#[command(name = "blueprint-queue")]
#[command(about = "Unattended installer queue with interactive prompt answering")]
#[command(version)]
struct Args {
    /// Unix socket path
    #[arg(short, long, default_value = "/tmp/blueprint-queue.sock")]
    socket: String,

    /// Directory the installer runs in; artifacts are copied here
    #[arg(long, default_value = "/var/www/pterodactyl")]
    install_root: PathBuf,

    /// Directory for transient working copies (default: system temp dir)
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Installer executable
    #[arg(long, default_value = "blueprint")]
    installer: String,

    /// Flag passed to the installer before the artifact name
    #[arg(long, default_value = "-i", allow_hyphen_values = true)]
    install_flag: String,

    /// Accepted artifact extension (repeatable)
    #[arg(long = "extension", default_value = ".blueprint")]
    extensions: Vec<String>,

    /// Maximum jobs in queue before submissions are rejected
    #[arg(long, default_value = "500")]
    queue_max: usize,

    /// Seconds between periodic drain cycles
    #[arg(long, default_value = "300")]
    run_interval: u64,

    /// Seconds to wait between two installs
    #[arg(long, default_value = "10")]
    cooldown: u64,

    /// Minimum milliseconds between progress updates
    #[arg(long, default_value = "500")]
    progress_interval: u64,

    /// Maximum characters of installer output per status update
    #[arg(long, default_value = "1900")]
    output_limit: usize,

    /// Kill an installer that runs longer than this many seconds (default: no limit)
    #[arg(long)]
    install_timeout: Option<u64>,

    /// Start a drain cycle as soon as an artifact is queued
    #[arg(long)]
    run_on_submit: bool,

    /// Additional prompt answered affirmatively (repeatable)
    #[arg(long = "affirm-pattern")]
    affirm_patterns: Vec<String>,

    /// Additional prompt answered with a bare Enter (repeatable)
    #[arg(long = "enter-pattern")]
    enter_patterns: Vec<String>,

    /// Word sent to answer yes/no prompts
    #[arg(long, default_value = "yes")]
    affirm_response: String,

    /// Drop directory whose artifact files are queued automatically
    #[arg(long)]
    inbox: Option<PathBuf>,

    /// Jobs listed by status queries without an explicit limit
    #[arg(long, default_value = "10")]
    status_limit: usize,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Platform credential; the service refuses to start without it
    #[arg(long, env = "BLUEPRINT_QUEUE_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Args {
    fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            socket_path: self.socket.clone(),
            install_root: self.install_root.clone(),
            staging_dir: self.staging_dir.clone().unwrap_or(defaults.staging_dir),
            installer_binary: self.installer.clone(),
            install_flag: self.install_flag.clone(),
            extensions: self.extensions.clone(),
            queue_max: self.queue_max,
            run_interval: Duration::from_secs(self.run_interval),
            cooldown: Duration::from_secs(self.cooldown),
            progress_interval: Duration::from_millis(self.progress_interval),
            output_limit: self.output_limit,
            install_timeout: self.install_timeout.map(Duration::from_secs),
            run_on_submit: self.run_on_submit,
            status_limit: self.status_limit,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("blueprint-queue v{}", env!("CARGO_PKG_VERSION"));

    if args
        .token
        .as_deref()
        .map_or(true, |token| token.trim().is_empty())
    {
        bail!("BLUEPRINT_QUEUE_TOKEN must be set (or pass --token)");
    }

    let config = Arc::new(args.config());
    info!("Socket: {}", config.socket_path);
    info!("Install root: {}", config.install_root.display());
    info!(
        "Installer: {} {} <artifact>",
        config.installer_binary, config.install_flag
    );
    if !config.install_root.is_dir() {
        warn!(
            "Install root {} does not exist yet",
            config.install_root.display()
        );
    }

    let matcher = PromptMatcher::with_defaults(
        &args.affirm_response,
        &args.affirm_patterns,
        &args.enter_patterns,
    );
    info!("Answering {} prompt pattern(s)", matcher.rules().len());
    for rule in matcher.rules() {
        debug!("Prompt {:?}: {:?}", rule.pattern(), rule.action());
    }

    // Create channels
    // Broadcast channel for job updates (socket connections subscribe to this)
    let (events_tx, _events_rx) = broadcast::channel(256);
    let sink = Arc::new(BroadcastSink::new(events_tx.clone()));
    let (intake_tx, intake_rx) = intake::channel(64);
    let (ready_tx, ready_rx) = oneshot::channel();
    let shutdown = CancellationToken::new();

    let launcher = Arc::new(CommandLauncher::new(
        config.installer_binary.clone(),
        config.install_flag.clone(),
    ));
    let controller = Arc::new(DrainController::new(&config, launcher, matcher, sink));

    // Start intake consumer
    let intake_handle = tokio::spawn(intake::run_intake(
        intake_rx,
        Arc::clone(&controller),
        config.run_on_submit,
    ));

    // Start socket server
    let socket_server = SocketServer::new(
        config.socket_path.clone(),
        ConnectionContext {
            config: Arc::clone(&config),
            controller: Arc::clone(&controller),
            intake: intake_tx.clone(),
            events: events_tx,
            shutdown: shutdown.clone(),
        },
    );
    let listener = socket_server.bind()?;
    let socket_handle = tokio::spawn(socket_server.serve(listener));

    // Start periodic trigger
    let periodic_handle = tokio::spawn(trigger::run_periodic(
        Arc::clone(&controller),
        config.run_interval,
        ready_rx,
        shutdown.clone(),
    ));

    // Start inbox watcher
    let inbox_handle = if let Some(path) = &args.inbox {
        let mut inbox = Inbox::new(path.clone(), config.extensions.clone());
        match inbox.start() {
            Ok(()) => Some(tokio::spawn(inbox.run(intake_tx.clone(), shutdown.clone()))),
            Err(e) => {
                warn!("Failed to start inbox watcher: {}", e);
                None
            }
        }
    } else {
        None
    };
    drop(intake_tx);

    // Socket is bound: the service is ready
    let _ = ready_tx.send(());
    info!("Ready");

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown requested");
        }
        _ = sigint.recv() => {
            info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
        }
    }

    // Graceful shutdown: no new cycles, let the current install finish
    shutdown.cancel();
    if controller.close() {
        info!("Waiting for the current installation to finish");
    }
    controller.wait_idle().await;

    let _ = periodic_handle.await;
    let _ = socket_handle.await;
    if let Some(handle) = inbox_handle {
        let _ = handle.await;
    }
    intake_handle.abort();

    let remaining = controller.snapshot(0).await.length;
    if remaining > 0 {
        info!("{} job(s) left in queue", remaining);
    }
    info!("blueprint-queue exiting");
    Ok(())
}
