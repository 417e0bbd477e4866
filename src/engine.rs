//! Sync Engine: the driver that owns the journal, status bus, upload
//! registry, local-state cache, and every worker pool, and runs the
//! periodic reconciliation loop plus the watcher/event-channel consumers
//! (§4.1, §5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};

use crate::acl_staging::ACLStagingManager;
use crate::batch::{self, BatchContext};
use crate::config::Config;
use crate::events::Events;
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::journal::Journal;
use crate::local_scanner::{compute_local_etag, LocalScanner};
use crate::markers;
use crate::model::{ConflictState, FileMetadata, PathStatus, ReconcileOperation, StagedACL, SyncPath};
use crate::priority::{self, PriorityContext};
use crate::reconciler::{self, ReconcileInputs};
use crate::scheduler::AdaptiveScheduler;
use crate::status::StatusBus;
use crate::uploader::UploadRegistry;
use crate::watcher::{FilterPredicate, IgnoreOnceMap, WatchEvent, Watcher};
use crate::wsproto::Decoded;

const MIN_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DELETE_CHUNK_SIZE: usize = 50;
const DELETE_MAX_WORKERS: usize = 8;

/// Returned by `run_sync` when another pass already holds the non-reentrant
/// sync lock (§4.1, §5).
#[derive(Debug)]
pub struct AlreadyRunning;

impl std::fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a reconcile pass is already running")
    }
}

impl std::error::Error for AlreadyRunning {}

/// Owns every long-lived piece of per-datasite sync state and the three
/// cooperating background tasks (reconciliation timer, watcher consumer,
/// event-channel consumer). One instance per running daemon.
pub struct SyncEngine {
    cfg: Config,
    api: Arc<ApiClient>,
    filters: SyncFilters,
    datasites_root: PathBuf,
    journal: Arc<AsyncMutex<Journal>>,
    status: Arc<StatusBus>,
    registry: Arc<UploadRegistry>,
    acl_staging: Arc<ACLStagingManager>,
    scheduler: Arc<AdaptiveScheduler>,
    scanner: AsyncMutex<LocalScanner>,
    events: Arc<Events>,
    events_outbound: AsyncMutex<Option<crate::events::EventsOutbound>>,
    ignore_once: IgnoreOnceMap,
    watcher: AsyncMutex<Option<Watcher>>,
    run_sync_notify: Arc<Notify>,
    shutdown: Arc<Notify>,
    sync_lock: tokio::sync::Mutex<()>,
    first_sync: AtomicBool,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    pub async fn new(cfg: Config, api: ApiClient, filters: SyncFilters) -> Result<Arc<Self>> {
        let datasites_root = cfg.data_dir.join("datasites");
        let journal = Arc::new(AsyncMutex::new(Journal::open(&cfg.data_dir)?));
        let status = Arc::new(StatusBus::new());
        let registry = Arc::new(UploadRegistry::new());
        let scheduler = Arc::new(AdaptiveScheduler::new());
        let api = Arc::new(api);
        let token = api.current_access_token().await;
        let (events, events_outbound) = Events::new(&cfg.server_url, token)?;
        let ignore_once = IgnoreOnceMap::new();

        let acl_journal = journal.clone();
        let acl_status = status.clone();
        let acl_ignore_once = ignore_once.clone();
        let acl_datasites_root = datasites_root.clone();
        let acl_staging = Arc::new(ACLStagingManager::new(move |datasite, acls| {
            let journal = acl_journal.clone();
            let status = acl_status.clone();
            let ignore_once = acl_ignore_once.clone();
            let datasites_root = acl_datasites_root.clone();
            tokio::spawn(async move {
                apply_staged_acls(&datasites_root, &journal, &status, &ignore_once, &datasite, acls).await;
            });
        }));

        Ok(Arc::new(Self {
            cfg,
            api,
            filters,
            datasites_root,
            journal,
            status,
            registry,
            acl_staging,
            scheduler,
            scanner: AsyncMutex::new(LocalScanner::new()),
            events: Arc::new(events),
            events_outbound: AsyncMutex::new(Some(events_outbound)),
            ignore_once,
            watcher: AsyncMutex::new(None),
            run_sync_notify: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            first_sync: AtomicBool::new(true),
            tasks: AsyncMutex::new(Vec::new()),
        }))
    }

    pub fn status(&self) -> Arc<StatusBus> {
        self.status.clone()
    }

    pub fn registry(&self) -> Arc<UploadRegistry> {
        self.registry.clone()
    }

    /// Opens the journal (already done in `new`), runs an initial full sync
    /// synchronously, starts the watcher, connects the event channel, then
    /// spawns the three cooperating tasks. Returns once all three are running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        workspace_precheck(&self.cfg.data_dir)?;

        self.run_sync().await.context("initial sync")?;

        let drop_predicate = self.watcher_drop_predicate();
        let watcher = Watcher::start(&self.datasites_root, drop_predicate).context("start watcher")?;
        {
            let mut guard = self.watcher.lock().await;
            *guard = Some(watcher);
        }

        let events_outbound = self
            .events_outbound
            .lock()
            .await
            .take()
            .expect("start called more than once");

        let mut tasks = Vec::new();

        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            events.run(events_outbound, shutdown).await;
        }));

        {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move { engine.run_event_consumer().await }));
        }
        {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move { engine.run_watcher_consumer().await }));
        }
        {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move { engine.run_reconcile_timer().await }));
        }

        *self.tasks.lock().await = tasks;
        Ok(())
    }

    /// Stops the watcher first, then waits up to 5s for in-flight tasks to
    /// drain, then drops the status bus and journal handles.
    pub async fn stop(&self) {
        {
            let mut guard = self.watcher.lock().await;
            guard.take();
        }
        self.shutdown.notify_waiters();

        let tasks = { std::mem::take(&mut *self.tasks.lock().await) };
        let join_all = futures_util::future::join_all(tasks);
        if tokio::time::timeout(STOP_DRAIN_TIMEOUT, join_all).await.is_err() {
            crate::logging::error("sync engine stop: tasks did not drain within 5s");
        }

        let mut journal = self.journal.lock().await;
        let _ = journal.save();
    }

    /// Attempts to acquire the non-reentrant sync lock and run one
    /// reconciliation pass. Returns `AlreadyRunning` if a pass is already in
    /// flight.
    pub async fn run_sync(&self) -> Result<()> {
        let _guard = self
            .sync_lock
            .try_lock()
            .map_err(|_| anyhow::Error::new(AlreadyRunning))?;
        self.run_sync_locked().await
    }

    async fn run_sync_locked(&self) -> Result<()> {
        let remote = self.fetch_remote().await?;

        let local = {
            let mut scanner = self.scanner.lock().await;
            let ignore = &self.filters.ignore;
            scanner.scan(&self.datasites_root, &|key: &str| {
                ignore.should_ignore_rel(Path::new(key), false) || SyncFilters::is_marked_rel_path(key)
            })?
        };

        self.refresh_marker_status()?;

        {
            let mut journal = self.journal.lock().await;
            journal.refresh().context("refresh journal")?;
            if journal.count() == 0 {
                journal.rebuild_if_empty(&local, &remote);
                journal.save().ok();
            }
        }

        let result = {
            let journal = self.journal.lock().await;
            let status_snapshot: HashMap<SyncPath, PathStatus> =
                self.status.snapshot().into_iter().collect();
            let now = chrono::Utc::now().timestamp();
            reconciler::reconcile(ReconcileInputs {
                local: &local,
                remote: &remote,
                journal: journal.all(),
                status: &status_snapshot,
                owner_email: &self.cfg.email,
                now,
                is_ignored: &|p: &str| self.filters.ignore.should_ignore_rel(Path::new(p), false),
            })
        };

        let changed_paths = result.remote_writes.len()
            + result.local_writes.len()
            + result.local_deletes.len()
            + result.remote_deletes.len()
            + result.conflicts.len();
        self.scheduler.record_pass(changed_paths);

        let batch_ctx = self.batch_context();
        tokio::join!(
            batch::batch_download(&batch_ctx, result.local_writes),
            batch::batch_upload(&batch_ctx, result.remote_writes),
            self.execute_conflicts(result.conflicts),
            self.execute_remote_deletes(result.remote_deletes),
            self.execute_local_deletes(result.local_deletes),
        );

        let mut journal = self.journal.lock().await;
        for path in &result.cleanups {
            journal.delete(path);
        }
        journal.save().ok();
        Ok(())
    }

    async fn fetch_remote(&self) -> Result<HashMap<SyncPath, FileMetadata>> {
        let resp = self.api.datasite_view().await.context("fetch remote datasite view")?;
        Ok(resp
            .files
            .into_iter()
            .map(|b| {
                (
                    b.key,
                    FileMetadata {
                        etag: b.etag,
                        local_etag: String::new(),
                        size: b.size,
                        last_modified: b.last_modified.timestamp(),
                        version: String::new(),
                        completed_at: 0,
                    },
                )
            })
            .collect())
    }

    /// Step 3 of the reconcile algorithm: on the first sync after start,
    /// seed a `PathStatus` for every on-disk marked file. On every
    /// subsequent sync, drop status entries for markers that no longer
    /// exist (the user deleted/resolved them).
    fn refresh_marker_status(&self) -> Result<()> {
        let is_first = self.first_sync.swap(false, Ordering::SeqCst);
        let mut current: std::collections::HashSet<SyncPath> = std::collections::HashSet::new();

        for entry in walkdir::WalkDir::new(&self.datasites_root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".data")
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || !markers::is_marked_path(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.datasites_root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if is_first {
                if rel.contains(".rejected") {
                    self.status.set_rejected(&rel);
                } else {
                    self.status.set_conflicted(&rel);
                }
            }
            current.insert(rel);
        }

        if !is_first {
            for (path, status) in self.status.snapshot() {
                if status.conflict_state != ConflictState::None && !current.contains(&path) {
                    self.status.set_completed_and_remove(&path);
                }
            }
        }
        Ok(())
    }

    /// §4.1 truth-table row "both created, no shared ancestor": the local
    /// copy is relabeled `.conflict` and the path is dropped from the
    /// journal so the next pass treats the renamed file as a fresh local
    /// create and the remote copy as a fresh download.
    async fn execute_conflicts(&self, conflicts: HashMap<SyncPath, ReconcileOperation>) {
        for path in conflicts.keys() {
            let abs = self.datasites_root.join(path);
            self.ignore_once.ignore_once(&abs, None);
            match markers::mark_conflict(&abs) {
                Ok(_) => {
                    self.status.set_conflicted(path);
                    self.journal.lock().await.delete(path);
                }
                Err(err) => self.status.set_error(path, err.to_string()),
            }
        }
    }

    /// Deletes remote objects in 50-item batches with up to 8 concurrent
    /// workers (§5).
    async fn execute_remote_deletes(&self, ops: HashMap<SyncPath, ReconcileOperation>) {
        if ops.is_empty() {
            return;
        }
        let keys: Vec<SyncPath> = ops.into_keys().collect();
        let chunks: Vec<Vec<SyncPath>> = keys.chunks(DELETE_CHUNK_SIZE).map(|c| c.to_vec()).collect();
        let workers = chunks.len().min(DELETE_MAX_WORKERS).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let permit = semaphore.clone();
            let api = self.api.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let result = api.delete_blobs(&chunk).await;
                (chunk, result)
            }));
        }

        for task in tasks {
            let Ok((chunk, result)) = task.await else { continue };
            match result {
                Ok(()) => {
                    let mut journal = self.journal.lock().await;
                    for key in &chunk {
                        journal.delete(key);
                        self.status.set_completed_and_remove(key);
                    }
                    journal.save().ok();
                }
                Err(err) => {
                    for key in &chunk {
                        self.status.set_error(key, err.to_string());
                    }
                }
            }
        }
    }

    async fn execute_local_deletes(&self, ops: HashMap<SyncPath, ReconcileOperation>) {
        for path in ops.keys() {
            let abs = self.datasites_root.join(path);
            self.ignore_once.ignore_once(&abs, None);
            let removed = std::fs::remove_file(&abs);
            if removed.is_ok() || !abs.exists() {
                self.journal.lock().await.delete(path);
                self.status.set_completed_and_remove(path);
            } else if let Err(err) = removed {
                self.status.set_error(path, err.to_string());
            }
        }
    }

    fn priority_context(&self) -> PriorityContext {
        PriorityContext {
            events: self.events.clone(),
            status: self.status.clone(),
            journal: self.journal.clone(),
            ignore_once: self.ignore_once.clone(),
            acl_staging: self.acl_staging.clone(),
            datasites_root: self.datasites_root.clone(),
            owner_email: self.cfg.email.clone(),
            run_sync_notify: self.run_sync_notify.clone(),
        }
    }

    fn batch_context(&self) -> BatchContext {
        BatchContext {
            api: self.api.clone(),
            status: self.status.clone(),
            journal: self.journal.clone(),
            registry: self.registry.clone(),
            ignore_once: self.ignore_once.clone(),
            datasites_root: self.datasites_root.clone(),
            data_dir: self.cfg.data_dir.clone(),
            owner_email: self.cfg.email.clone(),
        }
    }

    /// §4.5 `FilterPaths`: drop ignored paths, non-priority paths (the
    /// watcher only forwards priority files onward to the fast path, since
    /// everything else is picked up by the next reconcile pass), marked
    /// paths, and temp files (the ignore list already matches temp patterns).
    fn watcher_drop_predicate(&self) -> FilterPredicate {
        let datasites_root = self.datasites_root.clone();
        let ignore = self.filters.ignore.clone();
        let priority = self.filters.priority.clone();
        Arc::new(move |abs: &Path| {
            let rel = abs.strip_prefix(&datasites_root).unwrap_or(abs);
            if markers::is_marked_path(abs) {
                return true;
            }
            if ignore.should_ignore_rel(rel, false) {
                return true;
            }
            !priority.should_prioritize_rel(rel, false)
        })
    }

    async fn run_watcher_consumer(self: Arc<Self>) {
        loop {
            let event = {
                let mut guard = self.watcher.lock().await;
                let Some(watcher) = guard.as_mut() else { return };
                watcher.recv().await
            };
            let Some(WatchEvent { path }) = event else { return };
            let Ok(rel) = path.strip_prefix(&self.datasites_root) else { continue };
            let rel = rel.to_string_lossy().replace('\\', "/");

            self.scheduler.note_priority_activity();
            let ctx = self.priority_context();
            if let Err(err) = priority::handle_priority_upload(&ctx, &rel).await {
                crate::logging::error(format!("priority upload failed for {rel}: {err:#}"));
            }
        }
    }

    async fn run_event_consumer(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                received = rx.recv() => {
                    match received {
                        Ok(decoded) => self.dispatch_event(&decoded).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn dispatch_event(&self, decoded: &Decoded) {
        match decoded {
            Decoded::System => {}
            Decoded::Ack(_) | Decoded::Nack(_) => {}
            Decoded::FileWrite(msg) => {
                self.scheduler.note_priority_activity();
                let ctx = self.priority_context();
                if let Err(err) = priority::handle_priority_download(&ctx, msg.clone()).await {
                    crate::logging::error(format!("priority download failed for {}: {err:#}", msg.path));
                }
            }
            Decoded::FileDelete(del) => {
                self.scheduler.note_priority_activity();
                let abs = self.datasites_root.join(&del.path);
                self.ignore_once.ignore_once(&abs, None);
                let _ = std::fs::remove_file(&abs);
                self.journal.lock().await.delete(&del.path);
                self.status.set_completed_and_remove(&del.path);
            }
            Decoded::Error(err) => {
                self.scheduler.note_priority_activity();
                let ctx = self.priority_context();
                priority::handle_priority_error(&ctx, err.clone()).await;
            }
            Decoded::AclManifest(manifest) => {
                self.scheduler.note_priority_activity();
                self.acl_staging.set_manifest(manifest.clone());
            }
            Decoded::Http(_) | Decoded::Other { .. } => {}
        }
    }

    async fn run_reconcile_timer(self: Arc<Self>) {
        loop {
            let interval = self.scheduler.next_interval();
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(interval) => {}
                _ = self.run_sync_notify.notified() => {}
            }
            if let Err(err) = self.run_sync().await {
                if err.downcast_ref::<AlreadyRunning>().is_none() {
                    crate::logging::error(format!("reconcile pass failed: {err:#}"));
                }
            }
        }
    }
}

fn workspace_precheck(data_dir: &Path) -> Result<()> {
    crate::workspace::ensure_writable(data_dir)?;
    crate::workspace::ensure_free_space(data_dir, MIN_FREE_BYTES)?;
    Ok(())
}

/// ACL staging completion callback body: writes every staged file in
/// manifest order, each through the same ignore-once + atomic-write path a
/// priority download uses (§4.9).
async fn apply_staged_acls(
    datasites_root: &Path,
    journal: &Arc<AsyncMutex<Journal>>,
    status: &Arc<StatusBus>,
    ignore_once: &IgnoreOnceMap,
    _datasite: &str,
    acls: Vec<StagedACL>,
) {
    for acl in acls {
        let abs = datasites_root.join(&acl.path);
        ignore_once.ignore_once(&abs, None);
        if let Err(err) = crate::atomic_write::write_atomic_verified(&abs, &acl.content, &acl.etag) {
            status.set_error(&acl.path, err.to_string());
            continue;
        }
        let local_etag = match compute_local_etag(&abs, acl.content.len() as i64) {
            Ok(e) => e,
            Err(err) => {
                status.set_error(&acl.path, err.to_string());
                continue;
            }
        };
        let now = chrono::Utc::now().timestamp();
        let mut meta = FileMetadata::new(acl.etag.clone(), acl.content.len() as i64, now);
        meta.local_etag = local_etag;
        meta.completed_at = now;
        {
            let mut journal = journal.lock().await;
            journal.set(acl.path.clone(), meta);
            journal.save().ok();
        }
        status.set_completed(&acl.path);
    }
}
