use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;

use cody_core::{
    config, BackendError, BranchName, CommitEvent, CommitId, Notifier, PublishTarget,
    PublisherConfig, RepositoryName, StatusKey, StatusStore,
};
use cody_publish::{
    Backends, DrainOutcome, GitCliSource, IngestOutcome, Publisher, DRAIN_TRIGGER,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{socket_path, INGEST_QUEUE_CAPACITY};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Branch used when a commit request names none.
pub const DEFAULT_BRANCH: &str = "main";

// ---------------------------------------------------------------------------
// Drain notifications
// ---------------------------------------------------------------------------

/// [`Notifier`] that feeds the daemon's drain task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn trigger(&self) -> Result<(), BackendError> {
        self.tx
            .send(DRAIN_TRIGGER.to_string())
            .map_err(|_| BackendError::Unavailable {
                service: "drain channel",
                message: "daemon is shutting down".to_string(),
            })
    }
}

/// Running totals of drain invocations since the daemon started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub invocations: u64,
    pub executed: u64,
    pub skipped: u64,
    pub stale: u64,
    pub race_lost: u64,
    pub finalized: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_finalized_at_unix: u64,
}

impl DrainStats {
    fn record(&mut self, outcome: &DrainOutcome) {
        self.invocations += 1;
        match outcome {
            DrainOutcome::Ignored | DrainOutcome::Idle => {}
            DrainOutcome::Stale { .. } => self.stale += 1,
            DrainOutcome::RaceLost { .. } => self.race_lost += 1,
            DrainOutcome::Completed {
                executed,
                finalized,
                ..
            } => {
                if *executed {
                    self.executed += 1;
                } else {
                    self.skipped += 1;
                }
                if *finalized {
                    self.finalized += 1;
                    self.last_finalized_at_unix = unix_seconds_now();
                }
            }
        }
    }

    fn record_failure(&mut self, error: String) {
        self.invocations += 1;
        self.failures += 1;
        self.last_error = Some(error);
    }
}

// ---------------------------------------------------------------------------
// Ingest jobs
// ---------------------------------------------------------------------------

/// A commit to ingest; `commit: None` resolves the branch head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub repository: String,
    pub branch: String,
    pub commit: Option<String>,
}

struct IngestJob {
    request: CommitRequest,
    respond_to: oneshot::Sender<Result<CommitSummary, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitSummary {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    /// `published` (empty diff) or `staged`.
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<u64>,
    pub actions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded: Option<String>,
    pub duration_ms: u128,
}

impl CommitSummary {
    fn new(event: &CommitEvent, outcome: &IngestOutcome, duration: Duration) -> Self {
        let (label, batch, superseded) = match outcome {
            IngestOutcome::Published { superseded, .. } => ("published", None, superseded),
            IngestOutcome::Staged {
                batch, superseded, ..
            } => ("staged", Some(*batch), superseded),
        };
        Self {
            repository: event.repository.to_string(),
            branch: event.branch.to_string(),
            commit: outcome.commit_id().to_string(),
            outcome: label.to_string(),
            batch,
            actions: outcome.action_count(),
            superseded: superseded.as_ref().map(CommitId::to_string),
            duration_ms: duration.as_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared daemon state
// ---------------------------------------------------------------------------

/// State shared by every daemon task.
pub struct DaemonState {
    publisher: Publisher,
    status: Arc<dyn StatusStore>,
    resolver: GitCliSource,
    stats: RwLock<DrainStats>,
    started_at_unix: u64,
    socket: PathBuf,
}

impl DaemonState {
    pub fn new(home: &Path, config: &PublisherConfig, backends: Backends) -> Self {
        Self {
            status: backends.status.clone(),
            publisher: Publisher::new(backends, config),
            resolver: GitCliSource::new(config.repositories_root_at(home)),
            stats: RwLock::new(DrainStats::default()),
            started_at_unix: unix_seconds_now(),
            socket: socket_path(home),
        }
    }

    pub async fn stats(&self) -> DrainStats {
        self.stats.read().await.clone()
    }

    /// Ingest one commit on the calling (blocking) thread.
    fn ingest_blocking(&self, request: &CommitRequest) -> Result<(CommitEvent, IngestOutcome), DaemonError> {
        let repository = RepositoryName::from(request.repository.as_str());
        let branch = BranchName::from(request.branch.as_str());
        let commit_id = match &request.commit {
            Some(commit) => CommitId::from(commit.as_str()),
            None => self.resolver.resolve_branch(&repository, &branch)?,
        };
        let event = CommitEvent {
            repository,
            branch,
            commit_id,
        };
        let outcome = self.publisher.ingestor.ingest_commit(&event)?;
        Ok((event, outcome))
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon over the durable backends under `home`.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = config::load_at(&home)?;
    ensure_runtime_dirs(&home)?;

    let (notify_tx, notify_rx) = mpsc::unbounded_channel::<String>();
    let notifier = Arc::new(ChannelNotifier::new(notify_tx.clone()));
    let backends = Backends::durable(&home, &config, notifier);
    let state = Arc::new(DaemonState::new(&home, &config, backends));

    run_with_state(home, state, &config, notify_tx, notify_rx).await
}

/// Run the daemon tasks over `state`. `notify_tx` must feed `notify_rx` and
/// be the channel behind the state's notifier.
pub async fn run_with_state(
    home: PathBuf,
    state: Arc<DaemonState>,
    config: &PublisherConfig,
    notify_tx: mpsc::UnboundedSender<String>,
    notify_rx: mpsc::UnboundedReceiver<String>,
) -> Result<(), DaemonError> {
    let (ingest_tx, ingest_rx) = mpsc::channel::<IngestJob>(INGEST_QUEUE_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    // Pick up whatever a previous run left in the queue.
    let _ = notify_tx.send(DRAIN_TRIGGER.to_string());

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = ingest_processor_task(state, ingest_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let drain_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = drain_task(state, notify_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let redelivery_handle = {
        let shutdown = shutdown_tx.clone();
        let notify_tx = notify_tx.clone();
        let poll = config.queue.redelivery_poll();
        tokio::spawn(async move {
            let result = redelivery_task(notify_tx, poll, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                state,
                ingest_tx,
                notify_tx,
                shutdown.clone(),
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!("daemon started");
    let (processor_result, drain_result, redelivery_result, socket_result, signal_result) = tokio::join!(
        processor_handle,
        drain_handle,
        redelivery_handle,
        socket_handle,
        signal_handle
    );

    handle_join("ingest_processor", processor_result)?;
    handle_join("drain", drain_result)?;
    handle_join("redelivery", redelivery_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn ingest_processor_task(
    state: Arc<DaemonState>,
    mut ingest_rx: mpsc::Receiver<IngestJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = ingest_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let started = Instant::now();

                let request = job.request.clone();
                let state = state.clone();
                let result = tokio::task::spawn_blocking(move || state.ingest_blocking(&request))
                    .await
                    .map_err(|err| DaemonError::Protocol(format!("ingest task join error: {err}")))?;

                let outcome = match result {
                    Ok((event, outcome)) => {
                        let summary = CommitSummary::new(&event, &outcome, started.elapsed());
                        tracing::info!(
                            repository = %summary.repository,
                            branch = %summary.branch,
                            commit = %summary.commit,
                            outcome = %summary.outcome,
                            actions = summary.actions,
                            duration_ms = summary.duration_ms,
                            "commit ingested",
                        );
                        Ok(summary)
                    }
                    Err(err) => {
                        tracing::error!(
                            repository = %job.request.repository,
                            branch = %job.request.branch,
                            error = %err,
                            "commit ingest failed",
                        );
                        Err(err.to_string())
                    }
                };
                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(())
}

/// One [`DrainWorker::handle`](cody_publish::DrainWorker::handle) per
/// notification, strictly one at a time.
async fn drain_task(
    state: Arc<DaemonState>,
    mut notify_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            payload = notify_rx.recv() => {
                let Some(payload) = payload else { break };
                let worker_state = state.clone();
                let result = tokio::task::spawn_blocking(move || {
                    worker_state.publisher.worker.handle(&payload)
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("drain task join error: {err}")))?;

                let mut stats = state.stats.write().await;
                match result {
                    Ok(outcome) => stats.record(&outcome),
                    Err(err) => {
                        // The message stays leased; the redelivery tick retries it.
                        tracing::warn!(error = %err, transient = err.is_transient(), "drain step failed");
                        stats.record_failure(err.to_string());
                    }
                }
            }
        }
    }
    Ok(())
}

async fn redelivery_task(
    notify_tx: mpsc::UnboundedSender<String>,
    poll: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                if notify_tx.send(DRAIN_TRIGGER.to_string()).is_err() {
                    break;
                }
                tracing::trace!("redelivery tick");
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    state: Arc<DaemonState>,
    ingest_tx: mpsc::Sender<IngestJob>,
    notify_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let ingest_tx = ingest_tx.clone();
                let notify_tx = notify_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_socket_client(stream, state, ingest_tx, notify_tx, shutdown_tx).await
                    {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    ingest_tx: mpsc::Sender<IngestJob>,
    notify_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = handle_request(&request, &state, &ingest_tx, &notify_tx, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn handle_request(
    request: &DaemonRequest,
    state: &Arc<DaemonState>,
    ingest_tx: &mpsc::Sender<IngestJob>,
    notify_tx: &mpsc::UnboundedSender<String>,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => match build_status_payload(state.clone()).await {
            Ok(payload) => DaemonResponse::ok(payload),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "commit" => {
            let Some(repository) = request.repository.clone() else {
                return DaemonResponse::error("commit request needs a repository");
            };
            let commit = CommitRequest {
                repository,
                branch: request
                    .branch
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
                commit: request.commit.clone(),
            };
            match enqueue_ingest(ingest_tx, commit).await {
                Ok(summary) => DaemonResponse::ok(json!(summary)),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "drain" => match notify_tx.send(DRAIN_TRIGGER.to_string()) {
            Ok(()) => DaemonResponse::ok(json!({ "triggered": true })),
            Err(_) => DaemonResponse::error("drain channel closed"),
        },
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

async fn enqueue_ingest(
    ingest_tx: &mpsc::Sender<IngestJob>,
    request: CommitRequest,
) -> Result<CommitSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    ingest_tx
        .send(IngestJob {
            request,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("ingest queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("ingest response"))?;
    outcome.map_err(DaemonError::Protocol)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub fn target_summary(key: &StatusKey, record: &PublishTarget) -> Value {
    json!({
        "repository": key.repository.as_str(),
        "branch": key.branch.as_str(),
        "state": record.state().to_string(),
        "published_commit": record.published_commit_id.as_ref().map(CommitId::as_str),
        "new_commit": record.new_commit_id.as_ref().map(CommitId::as_str),
        "remaining_actions": record.remaining_actions,
        "batch": record.batch,
        "updated_at": record.updated_at.map(|t| t.to_rfc3339()),
    })
}

async fn build_status_payload(state: Arc<DaemonState>) -> Result<Value, DaemonError> {
    let store = state.status.clone();
    let records = tokio::task::spawn_blocking(move || store.list())
        .await
        .map_err(|err| DaemonError::Protocol(format!("status task join error: {err}")))??;
    let targets: Vec<Value> = records
        .iter()
        .map(|(key, record)| target_summary(key, record))
        .collect();
    let drain = state.stats().await;

    Ok(json!({
        "running": true,
        "started_at_unix": state.started_at_unix,
        "socket": state.socket.display().to_string(),
        "stale_actions": state.publisher.worker.stale_policy(),
        "drain": drain,
        "targets": targets,
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Refuse to bind over a live daemon; clear a socket file left by a dead one.
fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }
    if let Err(err) = StdUnixStream::connect(socket) {
        tracing::warn!(socket = %socket.display(), error = %err, "clearing stale daemon socket");
        return match fs::remove_file(socket) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(io_err(socket, err)),
            _ => Ok(()),
        };
    }
    Err(DaemonError::Protocol(format!(
        "another daemon is listening on {}",
        socket.display()
    )))
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [
        config::cody_root(home),
        config::status_dir_at(home),
        config::queue_dir_at(home),
    ] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(|e| io_err("daemon socket write", e))?;
    writer.flush().await.map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG` filter (default `info`); `CODY_LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CODY_LOG_FORMAT").is_ok_and(|format| format == "json");
    let _ = if json {
        fmt().json().with_env_filter(filter).with_target(false).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
