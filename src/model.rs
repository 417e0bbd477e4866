//! Shared data model for the sync engine: metadata, reconcile results,
//! path status, upload sessions, and ACL staging manifests.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// A normalized, POSIX-style relative path inside the datasite tree.
/// Invariant: no leading slash, forward slashes only, first segment is an
/// email-shaped datasite identifier.
pub type SyncPath = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub etag: String,
    #[serde(default)]
    pub local_etag: String,
    pub size: i64,
    pub last_modified: i64,
    #[serde(default)]
    pub version: String,
    /// Epoch seconds when this key last completed a sync operation (race-guard window, §4.1).
    #[serde(default)]
    pub completed_at: i64,
}

impl FileMetadata {
    pub fn new(etag: impl Into<String>, size: i64, last_modified: i64) -> Self {
        Self {
            etag: etag.into(),
            local_etag: String::new(),
            size,
            last_modified,
            version: String::new(),
            completed_at: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    WriteRemote,
    WriteLocal,
    DeleteRemote,
    DeleteLocal,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct ReconcileOperation {
    pub op_type: OperationType,
    pub path: SyncPath,
    pub local: Option<FileMetadata>,
    pub remote: Option<FileMetadata>,
    pub last_synced: Option<FileMetadata>,
}

/// Output of one reconciler pass. Every input path appears in exactly one bucket.
#[derive(Debug, Default)]
pub struct ReconcileResult {
    pub remote_writes: HashMap<SyncPath, ReconcileOperation>,
    pub local_writes: HashMap<SyncPath, ReconcileOperation>,
    pub local_deletes: HashMap<SyncPath, ReconcileOperation>,
    pub remote_deletes: HashMap<SyncPath, ReconcileOperation>,
    pub conflicts: HashMap<SyncPath, ReconcileOperation>,
    pub unchanged: HashSet<SyncPath>,
    pub cleanups: HashSet<SyncPath>,
    pub ignored: HashSet<SyncPath>,
}

impl ReconcileResult {
    pub fn total_paths(&self) -> usize {
        self.remote_writes.len()
            + self.local_writes.len()
            + self.local_deletes.len()
            + self.remote_deletes.len()
            + self.conflicts.len()
            + self.unchanged.len()
            + self.cleanups.len()
            + self.ignored.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Syncing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictState {
    None,
    Conflicted,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct PathStatus {
    pub sync_state: SyncState,
    pub conflict_state: ConflictState,
    pub progress: f32,
    pub error: Option<String>,
    pub error_count: u32,
    pub last_updated: i64,
}

impl Default for PathStatus {
    fn default() -> Self {
        Self {
            sync_state: SyncState::Pending,
            conflict_state: ConflictState::None,
            progress: 0.0,
            error: None,
            error_count: 0,
            last_updated: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Uploading,
    Paused,
    Completed,
    Error,
}

/// Resumable multipart upload session. Durably persisted as one JSON file
/// per session under `<metadata>/upload-sessions/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    #[serde(rename = "uploadId")]
    pub id: String,
    pub key: String,
    #[serde(rename = "filePath")]
    pub local_path: String,
    pub size: i64,
    pub part_size: i64,
    pub part_count: i64,
    /// part number -> part etag
    pub completed: std::collections::BTreeMap<i64, String>,
    #[serde(skip)]
    pub state: UploadStateWrapper,
    #[serde(skip)]
    pub uploaded_bytes: i64,
    #[serde(skip)]
    pub progress: f32,
    #[serde(skip)]
    pub started_at: i64,
    #[serde(skip)]
    pub updated_at: i64,
    #[serde(skip)]
    pub error: Option<String>,
}

/// Wraps `UploadState` with a `Default` impl so it round-trips through
/// `#[serde(skip)]` fields (see §3: `state=paused` on load from disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadStateWrapper(pub UploadState);

impl Default for UploadStateWrapper {
    fn default() -> Self {
        UploadStateWrapper(UploadState::Paused)
    }
}

impl UploadInfo {
    pub fn session_id(key: &str, local_path: &str) -> String {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(local_path.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }

    pub fn remaining_parts(&self) -> Vec<i64> {
        (1..=self.part_count)
            .filter(|p| !self.completed.contains_key(p))
            .collect()
    }

    pub fn completed_bytes(&self) -> i64 {
        let full_parts = self.completed.len() as i64;
        if full_parts == 0 {
            return 0;
        }
        if full_parts == self.part_count {
            return self.size;
        }
        full_parts.saturating_mul(self.part_size).min(self.size)
    }
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ACLEntry {
    pub path: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ACLManifest {
    #[serde(default = "default_manifest_version")]
    pub version: u32,
    pub datasite: String,
    /// Hash of the principal the manifest was generated for; present for
    /// parity with the wire protocol even though staging only keys on `datasite`.
    #[serde(default)]
    pub principal_hash: String,
    #[serde(default)]
    pub generated: String,
    #[serde(rename = "order")]
    pub acl_order: Vec<ACLEntry>,
}

fn default_manifest_version() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct StagedACL {
    pub path: String,
    pub content: Vec<u8>,
    pub etag: String,
}
