//! Batch Download/Upload: bounded-concurrency transfer of everything the
//! reconciler routed to `local_writes`/`remote_writes` (§4.7, §4.8).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::atomic_write::ensure_parent_dirs;
use crate::http::{ApiClient, PresignedParams};
use crate::journal::Journal;
use crate::markers;
use crate::model::{FileMetadata, ReconcileOperation};
use crate::status::StatusBus;
use crate::uploader::{upload_blob_smart, UploadRegistry};
use crate::watcher::IgnoreOnceMap;

const DOWNLOAD_WORKERS: usize = 8;
const UPLOAD_WORKERS: usize = 8;
const PRESIGN_CHUNK_SIZE: usize = 100;
const STALE_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct BatchContext {
    pub api: Arc<ApiClient>,
    pub status: Arc<StatusBus>,
    pub journal: Arc<AsyncMutex<Journal>>,
    pub registry: Arc<UploadRegistry>,
    pub ignore_once: IgnoreOnceMap,
    pub datasites_root: PathBuf,
    pub data_dir: PathBuf,
    pub owner_email: String,
}

fn priority_rank(owner_email: &str, path: &str, size: i64) -> (u8, i64) {
    if path.starts_with(&format!("{owner_email}/")) {
        return (0, 0);
    }
    if path.ends_with("syft.pub.yaml") {
        return (1, 0);
    }
    if path.split('/').any(|seg| seg == "rpc") {
        return (2, 0);
    }
    (3, size + path.len() as i64)
}

struct EtagGroup {
    etag: String,
    representative: String,
    targets: Vec<String>,
    meta: FileMetadata,
}

fn group_by_etag(
    ctx: &BatchContext,
    ops: &HashMap<String, ReconcileOperation>,
) -> Vec<EtagGroup> {
    let mut groups: HashMap<String, EtagGroup> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (path, op) in ops {
        let Some(remote) = &op.remote else { continue };
        match groups.get_mut(&remote.etag) {
            Some(g) => g.targets.push(path.clone()),
            None => {
                groups.insert(
                    remote.etag.clone(),
                    EtagGroup {
                        etag: remote.etag.clone(),
                        representative: path.clone(),
                        targets: vec![path.clone()],
                        meta: remote.clone(),
                    },
                );
                order.push(remote.etag.clone());
            }
        }
    }

    let mut groups: Vec<EtagGroup> = order.into_iter().filter_map(|e| groups.remove(&e)).collect();
    groups.sort_by_key(|g| priority_rank(&ctx.owner_email, &g.representative, g.meta.size));
    groups
}

/// Downloads every `local_writes` operation, deduplicating by remote etag
/// and fanning the single downloaded blob out to every path that shares it.
pub async fn batch_download(
    ctx: &BatchContext,
    ops: HashMap<String, ReconcileOperation>,
) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }

    let scratch = ctx.data_dir.join(".syft-tmp").join(format!("batch-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&scratch).await.ok();

    let groups = group_by_etag(ctx, &ops);
    for chunk in groups.chunks(PRESIGN_CHUNK_SIZE) {
        let keys: Vec<String> = chunk.iter().map(|g| g.representative.clone()).collect();
        let presigned = match ctx.api.get_blob_presigned(&PresignedParams { keys }).await {
            Ok(p) => p,
            Err(err) => {
                // Presigned-URL generation failed for the whole chunk: every
                // path in it is a transient content failure (§7), not an error.
                for group in chunk {
                    for target in &group.targets {
                        ctx.status.set_completed_and_remove(target);
                    }
                }
                crate::logging::error(format!("batch download presign failed: {err:#}"));
                continue;
            }
        };

        let url_by_key: HashMap<String, String> =
            presigned.urls.into_iter().map(|u| (u.key, u.url)).collect();

        let semaphore = Arc::new(Semaphore::new(DOWNLOAD_WORKERS));
        let mut tasks: Vec<Option<tokio::task::JoinHandle<(String, PathBuf, Result<()>)>>> =
            Vec::with_capacity(chunk.len());
        for group in chunk {
            let Some(url) = url_by_key.get(&group.representative).cloned() else {
                for target in &group.targets {
                    ctx.status.set_completed_and_remove(target);
                }
                tasks.push(None);
                continue;
            };
            let permit = semaphore.clone();
            let api = ctx.api.clone();
            let scratch = scratch.clone();
            let etag = group.etag.clone();
            tasks.push(Some(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let tmp = scratch.join(sanitize_etag(&etag));
                let result = download_to_path(&api, &url, &tmp).await;
                (etag, tmp, result)
            })));
        }

        for (group, task) in chunk.iter().zip(tasks) {
            let Some(task) = task else { continue };
            let (etag, tmp, result) = task.await.unwrap_or_else(|e| {
                (group.etag.clone(), scratch.join(sanitize_etag(&group.etag)), Err(anyhow::anyhow!("{e}")))
            });
            if let Err(err) = result {
                for target in &group.targets {
                    ctx.status.set_error(target, err.to_string());
                }
                continue;
            }

            for target in &group.targets {
                let dest = ctx.datasites_root.join(target);
                match prepare_target(&dest, group.meta.last_modified) {
                    Ok(false) => continue, // local copy is newer than the remote write; skip
                    Ok(true) => {}
                    Err(err) => {
                        ctx.status.set_error(target, err.to_string());
                        continue;
                    }
                }
                ctx.ignore_once.ignore_once(&dest, None);
                if let Err(err) = copy_into_place(&tmp, &dest) {
                    ctx.status.set_error(target, err.to_string());
                    continue;
                }

                let local_etag = crate::local_scanner::compute_local_etag(&dest, group.meta.size)
                    .unwrap_or_else(|_| etag.clone());
                let now = Utc::now().timestamp();
                let mut meta = group.meta.clone();
                meta.local_etag = local_etag;
                meta.completed_at = now;
                {
                    let mut journal = ctx.journal.lock().await;
                    journal.set(target.clone(), meta);
                    journal.save().ok();
                }
                ctx.status.set_completed(target);
            }
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }

    tokio::fs::remove_dir_all(&scratch).await.ok();
    Ok(())
}

fn sanitize_etag(etag: &str) -> String {
    etag.trim_matches('"').replace(['/', '\\'], "_")
}

async fn download_to_path(api: &ApiClient, url: &str, dest: &Path) -> Result<()> {
    let resp = api.http().get(url).send().await.context("presigned GET")?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("download failed: {status} {text}");
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        api.stats().on_recv(bytes.len() as i64);
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Target preparation (§4.7): resolve a file-vs-directory conflict at `dest`
/// before the download lands, preferring the remote write only if it is
/// newer than whatever is blocking it locally. Returns `Ok(false)` when the
/// download should be skipped this cycle because the local copy wins.
fn prepare_target(dest: &Path, remote_last_modified: i64) -> Result<bool> {
    if let Some(parent) = dest.parent() {
        if parent.exists() && parent.is_file() {
            if !remote_is_newer(parent, remote_last_modified) {
                return Ok(false);
            }
            markers::mark_conflict(parent)?;
            std::fs::create_dir_all(parent)?;
        }
    }
    if dest.exists() && dest.is_dir() {
        if !remote_is_newer(dest, remote_last_modified) {
            return Ok(false);
        }
        markers::mark_conflict(dest)?;
    }
    ensure_parent_dirs(dest)?;
    Ok(true)
}

fn remote_is_newer(local_path: &Path, remote_last_modified: i64) -> bool {
    std::fs::metadata(local_path)
        .and_then(|m| m.modified())
        .map(|mtime| {
            let local_secs = mtime
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            remote_last_modified > local_secs
        })
        .unwrap_or(true)
}

fn copy_into_place(tmp: &Path, dest: &Path) -> Result<()> {
    let bytes = std::fs::read(tmp).with_context(|| format!("read {}", tmp.display()))?;
    crate::atomic_write::write_atomic(dest, &bytes)
}

/// Uploads every `remote_writes` operation with bounded concurrency,
/// delegating the transfer itself to `upload_blob_smart` (§4.8).
pub async fn batch_upload(
    ctx: &BatchContext,
    ops: HashMap<String, ReconcileOperation>,
) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }

    cleanup_stale_sessions(&ctx.data_dir).await;

    let semaphore = Arc::new(Semaphore::new(UPLOAD_WORKERS));
    let mut tasks = Vec::new();
    for (path, op) in ops {
        let Some(local) = op.local.clone() else { continue };
        if local.size == 0 {
            continue;
        }
        if !ctx.journal.lock().await.contents_changed(&path, &local.etag) {
            continue;
        }
        if let Some(remote) = &op.remote {
            if remote.etag == local.etag {
                ctx.journal.lock().await.delete(&path);
                continue;
            }
        }
        let abs = ctx.datasites_root.join(&path);
        if !abs.exists() {
            ctx.journal.lock().await.delete(&path);
            continue;
        }

        if markers::rejected_marker_exists(&abs) {
            ctx.status.set_rejected(&path);
            ctx.journal.lock().await.delete(&path);
            continue;
        }

        if !is_well_formed_datasite_path(&path) {
            if path.starts_with(&format!("{}/", ctx.owner_email)) {
                markers::mark_rejected(&abs).ok();
                ctx.status.set_rejected(&path);
            }
            ctx.journal.lock().await.delete(&path);
            continue;
        }

        let permit = semaphore.clone();
        let api = ctx.api.clone();
        let status = ctx.status.clone();
        let registry = ctx.registry.clone();
        let data_dir = ctx.data_dir.clone();
        let journal = ctx.journal.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = permit.acquire_owned().await.ok();
            let result = upload_blob_smart(&api, &status, &registry, &data_dir, &path, &abs).await;
            match result {
                Ok(()) => {
                    let now = Utc::now().timestamp();
                    let mut meta = FileMetadata::new(local.etag.clone(), local.size, now);
                    meta.local_etag = local.etag.clone();
                    meta.completed_at = now;
                    let mut journal = journal.lock().await;
                    journal.set(path.clone(), meta);
                    journal.save().ok();
                }
                Err(ref err) => {
                    crate::logging::error(format!("batch upload failed for {path}: {err:#}"));
                }
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn is_well_formed_datasite_path(path: &str) -> bool {
    match path.split_once('/') {
        Some((root, rest)) => root.contains('@') && !rest.is_empty(),
        None => false,
    }
}

async fn cleanup_stale_sessions(data_dir: &Path) {
    let dir = data_dir.join(".data").join("upload-sessions");
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };
    let now = std::time::SystemTime::now();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else { continue };
        let Ok(modified) = meta.modified() else { continue };
        if now.duration_since(modified).unwrap_or_default() > STALE_SESSION_MAX_AGE {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}
