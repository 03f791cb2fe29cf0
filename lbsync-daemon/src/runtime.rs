use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;

use lbsync_core::{config, manifest};
use lbsync_sync::timer::StageTick;
use lbsync_sync::{ClusterCache, Orchestrator, PassReport, StageTimer};

use crate::error::{io_err, task_err, DaemonError};
use crate::manifests::ManifestIndex;
use crate::paths::{lbsync_root, manifests_dir, socket_path, DEBOUNCE_WINDOW, RESYNC_INTERVAL};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// State shared by every daemon task.
struct Daemon {
    home: PathBuf,
    orchestrator: Orchestrator,
    last_pass: RwLock<Option<PassSummary>>,
    started_at_unix: u64,
}

impl Daemon {
    fn cache(&self) -> &ClusterCache {
        self.orchestrator.cache()
    }
}

struct SyncJob {
    source: &'static str,
    respond_to: Option<oneshot::Sender<Result<PassSummary, String>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub source: String,
    #[serde(flatten)]
    pub report: PassReport,
    pub fingerprint: String,
    pub timings: Vec<StageTick>,
    pub duration_ms: u128,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let (daemon, index) = prepare(home)?;

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    // the first pass is a full sync of whatever was on disk at startup
    sync_tx
        .send(SyncJob {
            source: "startup",
            respond_to: None,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(daemon, index, sync_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(daemon, sync_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let resync_handle = {
        let shutdown = shutdown_tx.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = resync_task(sync_tx, RESYNC_INTERVAL, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(daemon, sync_tx, shutdown.clone(), shutdown.subscribe()).await;
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
                        Err(err) => Err(task_err("signal_handler", err)),
                    }
                }
            }
        })
    };
    drop(sync_tx);

    let (watcher_result, processor_result, resync_result, socket_result, signal_result) = tokio::join!(
        watcher_handle,
        processor_handle,
        resync_handle,
        socket_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("resync", resync_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Load configuration and the manifests directory into a fresh cache.
fn prepare(home: PathBuf) -> Result<(Arc<Daemon>, ManifestIndex), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let options = Arc::new(config::load_at(&home)?);
    let cache = Arc::new(ClusterCache::new(&options));

    let dir = canonical_manifests_dir(&home);
    let mut index = ManifestIndex::new();
    let stats = index.load_dir(&cache, &dir)?;
    tracing::info!(
        dir = %dir.display(),
        files = index.file_count(),
        objects = stats.applied,
        "loaded manifests",
    );

    let daemon = Daemon {
        home,
        orchestrator: Orchestrator::new(cache, options),
        last_pass: RwLock::new(None),
        started_at_unix: unix_seconds_now(),
    };
    Ok((Arc::new(daemon), index))
}

// Canonicalize so that watcher paths (which may arrive as real paths, e.g.
// /private/var/... on macOS) match the paths the index was loaded with.
fn canonical_manifests_dir(home: &Path) -> PathBuf {
    let dir = manifests_dir(home);
    fs::canonicalize(&dir).unwrap_or(dir)
}

async fn watcher_task(
    daemon: Arc<Daemon>,
    mut index: ManifestIndex,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let dir = canonical_manifests_dir(&daemon.home);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %dir.display(), "watching manifests directory");

    let mut debounce = Debounce::new(DEBOUNCE_WINDOW);

    loop {
        let deadline = debounce.deadline().unwrap_or_else(Instant::now);
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep_until(deadline), if debounce.deadline().is_some() => {
                if debounce.take_due(Instant::now()) {
                    trigger(&sync_tx, "watcher").await?;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error, forcing full sync");
                        daemon.cache().resync_required();
                        debounce.arm(Instant::now());
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if !path.starts_with(&dir) || !manifest::is_manifest_file(&path) {
                        continue;
                    }
                    match index.reload(daemon.cache(), &path) {
                        Ok(stats) => {
                            tracing::debug!(
                                path = %path.display(),
                                applied = stats.applied,
                                deleted = stats.deleted,
                                "manifest file reloaded",
                            );
                            if stats.applied + stats.deleted > 0 {
                                debounce.arm(Instant::now());
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "manifest file rejected, keeping previous objects");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn sync_processor_task(
    daemon: Arc<Daemon>,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };

                // everything queued while the previous pass ran is served by one pass
                let source = job.source;
                let mut waiting: Vec<_> = job.respond_to.into_iter().collect();
                while let Ok(queued) = sync_rx.try_recv() {
                    waiting.extend(queued.respond_to);
                }

                let outcome = run_pass(daemon.clone(), source).await;
                match &outcome {
                    Ok(summary) => tracing::info!(
                        source = %summary.source,
                        full_sync = summary.report.full_sync,
                        notifications = summary.report.notifications,
                        duration_ms = summary.duration_ms,
                        "sync pass completed",
                    ),
                    Err(err) => tracing::error!(error = %err, "sync pass failed"),
                }

                let outcome = outcome.map_err(|err| err.to_string());
                for respond_to in waiting {
                    let _ = respond_to.send(outcome.clone());
                }
            }
        }
    }

    Ok(())
}

async fn run_pass(daemon: Arc<Daemon>, source: &'static str) -> Result<PassSummary, DaemonError> {
    let started = Instant::now();
    let worker = daemon.clone();
    let (report, timer, fingerprint) = tokio::task::spawn_blocking(move || {
        let mut timer = StageTimer::new();
        let report = worker.orchestrator.sync(&mut timer)?;
        let fingerprint = worker.orchestrator.with_target(|target| target.fingerprint())?;
        Ok::<_, DaemonError>((report, timer, fingerprint))
    })
    .await
    .map_err(|err| task_err("sync_pass", err))??;

    tracing::debug!(stages = %timer.summary(), "pass timings");
    let summary = PassSummary {
        source: source.to_string(),
        report,
        fingerprint,
        timings: timer.ticks().to_vec(),
        duration_ms: started.elapsed().as_millis(),
    };
    *daemon.last_pass.write().await = Some(summary.clone());
    Ok(summary)
}

async fn resync_task(
    sync_tx: mpsc::Sender<SyncJob>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => trigger(&sync_tx, "resync").await?,
        }
    }
    Ok(())
}

async fn socket_server_task(
    daemon: Arc<Daemon>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&daemon.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = daemon.clone();
                let sync_tx = sync_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon, sync_tx, shutdown_tx).await {
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
    daemon: Arc<Daemon>,
    sync_tx: mpsc::Sender<SyncJob>,
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

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&daemon).await),
            "sync" => match enqueue_sync(&sync_tx, "socket").await {
                Ok(summary) => DaemonResponse::ok(json!(summary)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "config" => match current_config(daemon.clone()).await {
                Ok(config) => DaemonResponse::ok(config),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(daemon: &Daemon) -> Value {
    let cache = daemon.cache();
    let last_pass = daemon.last_pass.read().await.clone();

    json!({
        "running": true,
        "started_at_unix": daemon.started_at_unix,
        "socket": socket_path(&daemon.home).display().to_string(),
        "manifests_dir": manifests_dir(&daemon.home).display().to_string(),
        "objects": cache.snapshot().len(),
        "pending_notifications": cache.accumulator().pending_len(),
        "full_sync_pending": cache.accumulator().full_sync_pending(),
        "last_pass": last_pass,
    })
}

/// The target is locked for the whole of a running pass, so read it off the
/// async workers.
async fn current_config(daemon: Arc<Daemon>) -> Result<Value, DaemonError> {
    tokio::task::spawn_blocking(move || {
        daemon
            .orchestrator
            .with_target(|target| serde_json::to_value(target))
            .map_err(DaemonError::from)
    })
    .await
    .map_err(|err| task_err("config_read", err))?
}

async fn trigger(sync_tx: &mpsc::Sender<SyncJob>, source: &'static str) -> Result<(), DaemonError> {
    sync_tx
        .send(SyncJob {
            source,
            respond_to: None,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))
}

async fn enqueue_sync(
    sync_tx: &mpsc::Sender<SyncJob>,
    source: &'static str,
) -> Result<PassSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            source,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
    outcome.map_err(DaemonError::Remote)
}

/// Trailing-edge debounce: every change pushes the deadline out by `window`.
#[derive(Debug)]
struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `true` once per quiet period, when the deadline has passed.
    fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::AlreadyRunning {
                socket: socket.to_path_buf(),
            });
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [lbsync_root(home), manifests_dir(home)] {
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
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(task_err(task, err)),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG` filters (default `info`); `LBSYNC_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if std::env::var_os("LBSYNC_LOG_JSON").is_some() {
        builder.json().try_init()
    } else {
        builder.try_init()
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
