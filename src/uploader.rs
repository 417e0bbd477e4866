//! Upload Session Registry: resumable multipart uploads. Sessions persist as
//! one JSON file per upload under `<data_dir>/.data/upload-sessions/<id>.json`
//! so a killed daemon can resume mid-transfer; small blobs skip the registry
//! entirely and go through a single PUT.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::ETAG;

use crate::http::{
    AbortMultipartUploadRequest, ApiClient, CompleteMultipartUploadRequest, CompletedPart,
    MultipartUploadRequest,
};
use crate::model::{UploadInfo, UploadState, UploadStateWrapper};
use crate::status::StatusBus;

const DEFAULT_MULTIPART_PART_SIZE: i64 = 64 * 1024 * 1024;
const MIN_MULTIPART_PART_SIZE: i64 = 5 * 1024 * 1024;
const MAX_MULTIPART_PARTS: i64 = 10_000;
const MULTIPART_THRESHOLD: i64 = 32 * 1024 * 1024;

/// In-memory command a caller can issue against a running or paused upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCommand {
    Pause,
    Resume,
    Restart,
}

/// Tracks live upload state machines by session id, so the control surface
/// can pause/resume/restart an in-flight upload. Persistence of the
/// resumable part progress itself lives in the per-session JSON file, not
/// here; this registry only holds the in-memory command channel.
#[derive(Default)]
pub struct UploadRegistry {
    commands: Mutex<HashMap<String, UploadCommand>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, session_id: &str, cmd: UploadCommand) {
        self.commands
            .lock()
            .unwrap()
            .insert(session_id.to_string(), cmd);
    }

    fn take(&self, session_id: &str) -> Option<UploadCommand> {
        self.commands.lock().unwrap().remove(session_id)
    }

    fn peek(&self, session_id: &str) -> Option<UploadCommand> {
        self.commands.lock().unwrap().get(session_id).copied()
    }
}

/// Uploads `path` to `key`, choosing a single PUT for blobs at or below the
/// multipart threshold and a resumable multipart session above it.
pub async fn upload_blob_smart(
    api: &ApiClient,
    status: &StatusBus,
    registry: &UploadRegistry,
    data_dir: &Path,
    key: &str,
    path: &Path,
) -> Result<()> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let size = meta.len() as i64;

    if size <= MULTIPART_THRESHOLD {
        status.set_syncing(key, 0.0);
        if let Err(err) = api.upload_blob(key, path).await {
            status.set_error(key, err.to_string());
            return Err(err);
        }
        status.set_completed(key);
        return Ok(());
    }

    ResumableUploader::new(api, status, registry, data_dir, key, path, size)?
        .upload()
        .await
}

struct ResumableUploader<'a> {
    api: &'a ApiClient,
    status: &'a StatusBus,
    registry: &'a UploadRegistry,
    key: String,
    file_path: PathBuf,
    size: i64,
    resume_dir: PathBuf,
    info: UploadInfo,
    part_client: reqwest::Client,
}

impl<'a> ResumableUploader<'a> {
    fn new(
        api: &'a ApiClient,
        status: &'a StatusBus,
        registry: &'a UploadRegistry,
        data_dir: &Path,
        key: &str,
        file_path: &Path,
        size: i64,
    ) -> Result<Self> {
        let resume_dir = data_dir.join(".data").join("upload-sessions");
        fs::create_dir_all(&resume_dir).ok();

        let (part_size, part_count) = select_part_size(size, parse_part_size_env());
        let info = UploadInfo {
            id: UploadInfo::session_id(key, &file_path.to_string_lossy()),
            key: key.to_string(),
            local_path: file_path.to_string_lossy().to_string(),
            size,
            part_size,
            part_count,
            completed: Default::default(),
            state: UploadStateWrapper(UploadState::Pending),
            uploaded_bytes: 0,
            progress: 0.0,
            started_at: 0,
            updated_at: 0,
            error: None,
        };

        let part_client = reqwest::Client::builder()
            .timeout(parse_part_upload_timeout_env())
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            api,
            status,
            registry,
            key: key.to_string(),
            file_path: file_path.to_path_buf(),
            size,
            resume_dir,
            info,
            part_client,
        })
    }

    async fn upload(mut self) -> Result<()> {
        self.load_or_init_session()?;
        self.info.state = UploadStateWrapper(UploadState::Uploading);
        self.save_session()?;
        self.status.set_syncing(&self.key, self.progress());

        loop {
            let remaining = self.info.remaining_parts();
            if remaining.is_empty() {
                break;
            }

            let resp = self
                .api
                .upload_multipart_urls(&MultipartUploadRequest {
                    key: self.key.clone(),
                    size: self.size,
                    part_size: self.info.part_size,
                    upload_id: None,
                    part_numbers: remaining.clone(),
                })
                .await?;

            self.info.part_size = resp.part_size;
            self.info.part_count = resp.part_count;
            self.save_session()?;

            if self.upload_parts(resp.urls).await? {
                continue; // restart requested: fresh multipart session
            }
        }

        let parts = self
            .info
            .completed
            .iter()
            .map(|(n, etag)| CompletedPart {
                part_number: *n,
                etag: etag.clone(),
            })
            .collect::<Vec<_>>();

        let result = self
            .api
            .upload_multipart_complete(&CompleteMultipartUploadRequest {
                key: self.key.clone(),
                upload_id: String::new(),
                parts,
            })
            .await;

        match result {
            Ok(_) => {
                self.cleanup_session();
                self.status.set_completed(&self.key);
                Ok(())
            }
            Err(err) => {
                self.status.set_error(&self.key, err.to_string());
                Err(err)
            }
        }
    }

    async fn upload_parts(&mut self, urls: HashMap<i64, String>) -> Result<bool> {
        let mut parts = urls.keys().copied().collect::<Vec<_>>();
        parts.sort_unstable();

        let mut file = fs::File::open(&self.file_path)
            .with_context(|| format!("open {}", self.file_path.display()))?;

        for part in parts {
            if self.wait_if_paused_or_restarted().await? {
                return Ok(true);
            }

            let url = urls
                .get(&part)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing url for part {part}"))?;

            let offset = (part - 1) * self.info.part_size;
            let chunk_size = self.part_size_for(part);
            if chunk_size <= 0 {
                continue;
            }
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0u8; chunk_size as usize];
            file.read_exact(&mut buf)?;

            let resp = self
                .part_client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(buf)
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(err) => {
                    self.status.set_error(&self.key, err.to_string());
                    return Err(err.into());
                }
            };

            let status_code = resp.status();
            if !status_code.is_success() {
                let text = resp.text().await.unwrap_or_default();
                let err = anyhow::anyhow!("upload part {part} failed: {status_code} {text}");
                self.status.set_error(&self.key, err.to_string());
                return Err(err);
            }

            let etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{part}-{chunk_size}"));

            self.info.completed.insert(part, etag);
            self.save_session()?;

            self.api.stats().on_send(chunk_size);
            self.status.set_progress(&self.key, self.progress());
        }

        Ok(false)
    }

    fn progress(&self) -> f32 {
        if self.size == 0 {
            return 100.0;
        }
        (self.info.completed_bytes() as f32 * 100.0 / self.size as f32).min(100.0)
    }

    async fn wait_if_paused_or_restarted(&mut self) -> Result<bool> {
        loop {
            match self.registry.peek(&self.info.id) {
                Some(UploadCommand::Pause) => {
                    self.info.state = UploadStateWrapper(UploadState::Paused);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Some(UploadCommand::Resume) => {
                    self.registry.take(&self.info.id);
                    self.info.state = UploadStateWrapper(UploadState::Uploading);
                    return Ok(false);
                }
                Some(UploadCommand::Restart) => {
                    self.registry.take(&self.info.id);
                    self.restart_session()?;
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }
    }

    fn restart_session(&mut self) -> Result<()> {
        self.cleanup_session();
        self.info.completed.clear();
        self.info.state = UploadStateWrapper(UploadState::Uploading);
        self.save_session()?;
        self.status.set_syncing(&self.key, 0.0);
        Ok(())
    }

    fn part_size_for(&self, part: i64) -> i64 {
        let offset = (part - 1) * self.info.part_size;
        if offset >= self.size {
            return 0;
        }
        (self.size - offset).min(self.info.part_size)
    }

    fn session_path(&self) -> PathBuf {
        self.resume_dir.join(format!("{}.json", self.info.id))
    }

    fn load_or_init_session(&mut self) -> Result<()> {
        let p = self.session_path();
        let Ok(data) = fs::read(&p) else {
            return self.save_session();
        };

        let loaded: UploadInfo = serde_json::from_slice(&data).context("decode upload session")?;
        if loaded.key != self.key || loaded.local_path != self.file_path.to_string_lossy().as_ref()
            || loaded.size != self.size
        {
            let _ = fs::remove_file(&p);
            return self.save_session();
        }

        // state=paused on load, per spec: no live cancel handle survives a restart.
        self.info = UploadInfo {
            state: UploadStateWrapper(UploadState::Paused),
            ..loaded
        };
        Ok(())
    }

    fn save_session(&self) -> Result<()> {
        let p = self.session_path();
        let data = serde_json::to_vec(&self.info).context("encode upload session")?;
        fs::write(&p, data).with_context(|| format!("write {}", p.display()))?;
        Ok(())
    }

    fn cleanup_session(&self) {
        let _ = fs::remove_file(self.session_path());
    }

    #[allow(dead_code)]
    async fn abort(&self, upload_id: &str) -> Result<()> {
        if upload_id.is_empty() {
            return Ok(());
        }
        self.api
            .upload_multipart_abort(&AbortMultipartUploadRequest {
                key: self.key.clone(),
                upload_id: upload_id.to_string(),
            })
            .await
    }
}

fn select_part_size(size: i64, override_part_size: Option<i64>) -> (i64, i64) {
    let mut part_size = override_part_size.unwrap_or(DEFAULT_MULTIPART_PART_SIZE);
    if part_size < MIN_MULTIPART_PART_SIZE {
        part_size = MIN_MULTIPART_PART_SIZE;
    }
    let mut part_count = divide_and_ceil(size, part_size);
    while part_count > MAX_MULTIPART_PARTS {
        part_size *= 2;
        part_count = divide_and_ceil(size, part_size);
    }
    (part_size, part_count)
}

fn divide_and_ceil(n: i64, d: i64) -> i64 {
    if d <= 0 {
        return 0;
    }
    let mut q = n / d;
    if n % d != 0 {
        q += 1;
    }
    q
}

fn parse_part_size_env() -> Option<i64> {
    let v = std::env::var("PART_SIZE").ok()?;
    parse_bytes(&v)
}

const DEFAULT_PART_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Per-part HTTP timeout, overridable via `PART_UPLOAD_TIMEOUT` (§6.6).
/// Accepts suffixed durations (`30s`, `5m`, `2h`) or, for compatibility with
/// the legacy ms-only config, a bare integer interpreted as milliseconds.
fn parse_part_upload_timeout_env() -> Duration {
    std::env::var("PART_UPLOAD_TIMEOUT")
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(DEFAULT_PART_UPLOAD_TIMEOUT)
}

fn parse_duration(s: &str) -> Option<Duration> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    if let Some(n) = lower.strip_suffix("ms") {
        return n.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(n) = lower.strip_suffix('h') {
        return n.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 3600));
    }
    if let Some(n) = lower.strip_suffix('m') {
        return n.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 60));
    }
    if let Some(n) = lower.strip_suffix('s') {
        return n.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    // Legacy fallback: a bare integer is milliseconds.
    lower.parse::<u64>().ok().map(Duration::from_millis)
}

fn parse_bytes(s: &str) -> Option<i64> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    let upper = raw.to_uppercase();
    let (num, mult) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024_i64 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024_i64 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024_i64)
    } else {
        (upper.as_str(), 1_i64)
    };
    let n: i64 = num.trim().parse().ok()?;
    if n <= 0 {
        return None;
    }
    Some(n.saturating_mul(mult))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_part_size_respects_minimum() {
        let (part_size, _) = select_part_size(1024, Some(1024));
        assert_eq!(part_size, MIN_MULTIPART_PART_SIZE);
    }

    #[test]
    fn select_part_size_doubles_until_under_max_parts() {
        let size = MAX_MULTIPART_PARTS * MIN_MULTIPART_PART_SIZE * 3;
        let (part_size, part_count) = select_part_size(size, Some(MIN_MULTIPART_PART_SIZE));
        assert!(part_count <= MAX_MULTIPART_PARTS);
        assert!(part_size > MIN_MULTIPART_PART_SIZE);
    }

    #[test]
    fn parse_duration_accepts_suffixed_and_legacy_ms() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("not-a-duration"), None);
    }

    #[test]
    fn registry_commands_round_trip() {
        let registry = UploadRegistry::new();
        registry.issue("abcd1234", UploadCommand::Pause);
        assert_eq!(registry.peek("abcd1234"), Some(UploadCommand::Pause));
        assert_eq!(registry.take("abcd1234"), Some(UploadCommand::Pause));
        assert_eq!(registry.peek("abcd1234"), None);
    }
}
