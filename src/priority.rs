//! Priority Path: low-latency upload/download of small RPC envelopes
//! (`*.request`/`*.response`) and ACL files over the event channel,
//! bypassing the full reconcile loop (§4.6).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

use crate::acl_staging::ACLStagingManager;
use crate::events::Events;
use crate::journal::Journal;
use crate::local_scanner::compute_local_etag;
use crate::markers;
use crate::model::FileMetadata;
use crate::status::StatusBus;
use crate::watcher::IgnoreOnceMap;
use crate::wsproto::{self, Decoded, ErrorMsg, FileWrite};

const MAX_PRIORITY_SIZE: i64 = 4 * 1024 * 1024;
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const PUSH_NOTIFY_DEADLINE: Duration = Duration::from_secs(30);

/// Shared handles the priority upload/download/error paths need. One
/// instance is built by the engine and handed to every priority task.
pub struct PriorityContext {
    pub events: Arc<Events>,
    pub status: Arc<StatusBus>,
    pub journal: Arc<AsyncMutex<Journal>>,
    pub ignore_once: IgnoreOnceMap,
    pub acl_staging: Arc<ACLStagingManager>,
    pub datasites_root: std::path::PathBuf,
    pub owner_email: String,
    /// Triggers an out-of-band reconcile pass for a `FileNotify` push.
    pub run_sync_notify: Arc<Notify>,
}

fn is_acl_path(rel_path: &str) -> bool {
    rel_path.ends_with("syft.pub.yaml")
}

fn datasite_of(rel_path: &str) -> &str {
    rel_path.split('/').next().unwrap_or(rel_path)
}

fn abs_path(ctx: &PriorityContext, rel_path: &str) -> std::path::PathBuf {
    ctx.datasites_root.join(rel_path)
}

/// Re-stats and sends `rel_path` through the event channel (§4.6 upload).
pub async fn handle_priority_upload(ctx: &PriorityContext, rel_path: &str) -> Result<()> {
    let path = abs_path(ctx, rel_path);

    if markers::rejected_marker_exists(&path) {
        ctx.status.set_rejected(rel_path);
        ctx.journal.lock().await.delete(rel_path);
        return Ok(());
    }

    let meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(_) => return Ok(()), // file vanished between the watcher event and now
    };
    if !meta.is_file() {
        return Ok(());
    }
    let size = meta.len() as i64;
    if size > MAX_PRIORITY_SIZE {
        ctx.status
            .set_error(rel_path, format!("priority file exceeds {MAX_PRIORITY_SIZE} bytes"));
        return Ok(());
    }

    let etag = compute_local_etag(&path, size)?;

    let is_acl = is_acl_path(rel_path);
    if !is_acl {
        let unchanged = {
            let journal = ctx.journal.lock().await;
            !journal.contents_changed(rel_path, &etag)
        };
        if unchanged {
            return Ok(());
        }
    }

    let content = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let id = Events::new_message_id();
    let frame = wsproto::encode_file_write(&id, rel_path, &etag, size, content)?;

    match ctx.events.send_with_ack(&id, frame, ACK_TIMEOUT).await {
        Ok(()) => {
            let now = chrono::Utc::now().timestamp();
            let mut meta = FileMetadata::new(etag.clone(), size, now);
            meta.local_etag = etag;
            meta.completed_at = now;
            {
                let mut journal = ctx.journal.lock().await;
                journal.set(rel_path, meta);
                journal.save().ok();
            }
            ctx.status.set_completed(rel_path);
            Ok(())
        }
        Err(err) => {
            let message = err.to_string();
            if message.contains("AccessDenied") || message.contains("DatasiteInvalidPath") {
                reject_path(ctx, rel_path, &path).await;
            } else {
                ctx.status.set_error(rel_path, message.clone());
            }
            Err(err)
        }
    }
}

/// Applies content received over the event channel for a priority path
/// (§4.6 download). `content.is_none()` (or zero length) is a push
/// notification, not a write.
pub async fn handle_priority_download(ctx: &PriorityContext, msg: FileWrite) -> Result<()> {
    let content = match &msg.content {
        Some(c) if !c.is_empty() => c,
        _ => {
            let notify = ctx.run_sync_notify.clone();
            tokio::spawn(async move {
                tokio::time::timeout(PUSH_NOTIFY_DEADLINE, async {
                    notify.notify_one();
                })
                .await
                .ok();
            });
            return Ok(());
        }
    };

    let datasite = datasite_of(&msg.path).to_string();
    if is_acl_path(&msg.path) && ctx.acl_staging.has_pending_manifest(&datasite) {
        ctx.acl_staging
            .stage_acl(&datasite, &msg.path, content.clone(), msg.etag.clone());
        return Ok(());
    }

    let path = abs_path(ctx, &msg.path);
    ctx.ignore_once.ignore_once(&path, None);

    if let Err(err) = crate::atomic_write::write_atomic_verified(&path, content, &msg.etag) {
        ctx.status.set_error(&msg.path, err.to_string());
        return Err(err);
    }

    let local_etag = compute_local_etag(&path, content.len() as i64)?;
    let now = chrono::Utc::now().timestamp();
    let mut metadata = FileMetadata::new(msg.etag.clone(), msg.length, now);
    metadata.local_etag = local_etag;
    metadata.completed_at = now;
    {
        let mut journal = ctx.journal.lock().await;
        journal.set(msg.path.clone(), metadata);
        journal.save().ok();
    }
    ctx.status.set_completed(&msg.path);
    Ok(())
}

/// Applies a `.rejected` marker and status=rejected for an error-coded path
/// (§4.6 priority error, §7 auth/invalid-path policy).
pub async fn handle_priority_error(ctx: &PriorityContext, err: ErrorMsg) {
    if err.code != "403" && !err.code.eq_ignore_ascii_case("AccessDenied") {
        ctx.status.set_error(&err.path, err.message.clone());
        return;
    }
    let path = abs_path(ctx, &err.path);
    reject_path(ctx, &err.path, &path).await;
}

async fn reject_path(ctx: &PriorityContext, rel_path: &str, abs: &Path) {
    if let Err(e) = markers::mark_rejected(abs) {
        ctx.status.set_error(rel_path, e.to_string());
        return;
    }
    ctx.status.set_rejected(rel_path);
    ctx.journal.lock().await.delete(rel_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datasite_of_takes_first_path_segment() {
        assert_eq!(datasite_of("alice@x/public/a.request"), "alice@x");
    }

    #[test]
    fn is_acl_path_matches_syft_pub_yaml_only() {
        assert!(is_acl_path("alice@x/public/syft.pub.yaml"));
        assert!(!is_acl_path("alice@x/public/a.request"));
    }
}
