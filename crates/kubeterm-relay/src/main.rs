//! kubeterm
//!
//! Opens one relayed session against a pod and renders it on this terminal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubeterm_core::config::load_config;
use kubeterm_core::tracing_init::{default_filter, init_tracing};
use kubeterm_relay::console::{ConsoleViewer, RawModeGuard, spawn_input_reader};
use kubeterm_relay::{
    Connection, ConnectionMode, IdleReaper, KubeBackend, SessionId, SessionRegistry, Target,
};

#[derive(Parser, Debug)]
#[command(name = "kubeterm")]
#[command(version, about = "Relay a pod shell or log stream to this terminal")]
struct Args {
    /// Pod to connect to.
    pod: String,

    /// Namespace of the pod. Defaults to the configured namespace.
    #[arg(short, long)]
    namespace: Option<String>,

    /// Container within the pod.
    #[arg(short, long)]
    container: Option<String>,

    /// interactive, stdout, stderr, logs or follow-logs.
    #[arg(long, default_value = "interactive")]
    mode: ConnectionMode,

    /// Command to exec, split on whitespace. Defaults to the configured shell.
    #[arg(long)]
    command: Option<String>,

    /// Cluster API server URL.
    #[arg(long, env = "KUBETERM_API_SERVER")]
    api_server: Option<String>,

    /// Bearer token for the API server.
    #[arg(long, env = "KUBETERM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// PEM bundle of the cluster CA.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir().ok();
    let mut config = load_config(cwd.as_deref())?;
    if let Some(api_server) = args.api_server.clone() {
        config.cluster.api_server = api_server;
    }
    if let Some(token) = args.token.clone() {
        config.cluster.token = Some(token);
    }
    if let Some(ca_cert) = args.ca_cert.clone() {
        config.cluster.ca_cert_path = Some(ca_cert);
    }

    init_tracing(
        &default_filter("kubeterm_relay", &config.logging.level),
        args.log_json || config.logging.json,
    );

    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| config.cluster.default_namespace.clone());
    let mut target = Target::new(namespace, args.pod.clone())
        .with_command(args.command.as_deref().and_then(Target::parse_command));
    if let Some(container) = args.container.clone() {
        target = target.with_container(container);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api_server = %config.cluster.api_server,
        workload = %target,
        mode = %args.mode,
        "Starting kubeterm"
    );

    let backend = KubeBackend::new(&config.cluster, config.relay.channel_capacity)?;
    let registry = SessionRegistry::new();
    let shutdown = CancellationToken::new();

    let reaper = config.relay.idle_timeout().map(|idle_timeout| {
        IdleReaper::new(registry.clone(), idle_timeout, config.relay.reaper_interval())
            .spawn(shutdown.clone())
    });

    let id = SessionId::new_v4();
    let (session, _) = registry
        .get_or_create(id, || {
            Connection::new(id, target, args.mode, config.relay.clone())
        })
        .await;

    let result = run(&session, &backend).await;

    shutdown.cancel();
    registry.close_all().await;
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    info!("kubeterm stopped");
    result
}

async fn run(session: &Arc<Connection>, backend: &KubeBackend) -> anyhow::Result<()> {
    session.open(backend).await?;

    let interactive = session.mode().is_interactive();
    let raw_mode = interactive.then(RawModeGuard::enter);
    debug!(
        raw_mode = raw_mode.as_ref().is_some_and(RawModeGuard::is_enabled),
        "Terminal prepared"
    );

    session.attach(Arc::new(ConsoleViewer::new())).await;

    let input_cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    if interactive {
        let (rows, cols) = ConsoleViewer::size();
        session.resize(rows, cols).await;
        match spawn_input_reader(std::io::stdin(), input_cancel.clone()) {
            Ok(input) => tasks.push(tokio::spawn(forward_input(Arc::clone(session), input))),
            Err(e) => warn!(error = %e, "Cannot read stdin, session is output-only"),
        }
        tasks.extend(watch_window_size(Arc::clone(session)));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Interrupted");
        }
        () = session.remote_lost() => info!("Remote session ended"),
    }

    input_cancel.cancel();
    for task in tasks {
        task.abort();
    }
    session.detach();
    Ok(())
}

async fn forward_input(session: Arc<Connection>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = input.recv().await {
        session.write(&bytes).await;
    }
    debug!("Stdin closed");
}

#[cfg(unix)]
fn watch_window_size(session: Arc<Connection>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!(error = %e, "Cannot watch window size");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let (rows, cols) = ConsoleViewer::size();
            session.resize(rows, cols).await;
        }
    }))
}

#[cfg(not(unix))]
fn watch_window_size(_session: Arc<Connection>) -> Option<JoinHandle<()>> {
    None
}
