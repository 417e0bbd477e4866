//! Durable, single-writer key-value store mapping a `SyncPath` to the
//! `FileMetadata` last agreed between local disk and the remote object
//! store. Backed by SQLite; `set`/`delete` write through to disk immediately.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::params;

use crate::model::{FileMetadata, SyncPath};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_journal (
    path TEXT PRIMARY KEY,
    etag TEXT NOT NULL,
    local_etag TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL,
    size INTEGER NOT NULL,
    last_modified TEXT NOT NULL,
    completed_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_journal_path ON sync_journal(path);
CREATE INDEX IF NOT EXISTS idx_journal_etag ON sync_journal(etag);
CREATE INDEX IF NOT EXISTS idx_journal_last_modified ON sync_journal(last_modified);
"#;

/// Durable KV store, one row per synced path. Not thread-safe on its own;
/// the engine owns a single `Journal` guarded by its own task. `set`/`delete`
/// write straight through to disk so a crash right after either call never
/// loses the mutation (§4.3: "individually durable (synchronous write
/// path)").
pub struct Journal {
    db_path: PathBuf,
    conn: rusqlite::Connection,
    entries: HashMap<SyncPath, FileMetadata>,
}

impl Journal {
    /// Opens (creating if absent) the journal database under
    /// `<data_dir>/.data/sync.db` and loads its full contents into memory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(".data").join("sync.db");
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = rusqlite::Connection::open(&db_path)
            .with_context(|| format!("open journal {}", db_path.display()))?;
        init_schema(&conn)?;

        let entries = load_all(&conn)?;
        Ok(Journal { db_path, conn, entries })
    }

    /// Re-reads the full table from disk. Since `set`/`delete` are
    /// write-through there is never unsaved in-memory state to discard; this
    /// exists to pick up rows written by a concurrent writer (e.g. a
    /// priority-path download committing out of band). Called at the start
    /// of every reconcile pass (§4.1 step 5).
    pub fn refresh(&mut self) -> Result<()> {
        self.entries = load_all(&self.conn)?;
        Ok(())
    }

    /// Write-through journal: every `set`/`delete` is already durable by the
    /// time it returns, so this is a no-op kept for call sites written
    /// against the older batched-flush contract.
    pub fn save(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileMetadata> {
        self.entries.get(path)
    }

    /// `contentsChanged(path, etag)` (§4.3): true if the journal has no
    /// entry for `path`, or its recorded `etag` differs from `etag`.
    pub fn contents_changed(&self, path: &str, etag: &str) -> bool {
        match self.entries.get(path) {
            Some(meta) => meta.etag != etag,
            None => true,
        }
    }

    pub fn set(&mut self, path: impl Into<SyncPath>, meta: FileMetadata) {
        let path = path.into();
        if let Err(err) = self.conn.execute(
            "INSERT OR REPLACE INTO sync_journal
             (path, size, etag, local_etag, version, last_modified, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                path,
                meta.size,
                meta.etag,
                meta.local_etag,
                meta.version,
                epoch_to_rfc3339(meta.last_modified),
                meta.completed_at,
            ],
        ) {
            crate::logging::error(format!("journal: failed to persist {path}: {err:#}"));
        }
        self.entries.insert(path, meta);
    }

    pub fn delete(&mut self, path: &str) {
        if let Err(err) = self
            .conn
            .execute("DELETE FROM sync_journal WHERE path = ?1", params![path])
        {
            crate::logging::error(format!("journal: failed to delete {path}: {err:#}"));
        }
        self.entries.remove(path);
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn all(&self) -> &HashMap<SyncPath, FileMetadata> {
        &self.entries
    }

    /// Closes the journal and renames its backing file to
    /// `<name>.<timestamp>.bak`, for callers that need to discard a
    /// corrupted or stale database and start fresh on the next `open`.
    pub fn destroy(self) -> Result<()> {
        let bak = self
            .db_path
            .with_file_name(format!(
                "{}.{}.bak",
                self.db_path.file_name().and_then(|n| n.to_str()).unwrap_or("sync.db"),
                chrono::Utc::now().timestamp()
            ));
        if self.db_path.exists() {
            fs::rename(&self.db_path, &bak)
                .with_context(|| format!("rename {} to {}", self.db_path.display(), bak.display()))?;
        }
        Ok(())
    }

    /// Called once, on a fresh journal with no rows: seeds an entry for
    /// every path where the local and remote copies already agree, so the
    /// next reconcile pass doesn't treat an already-converged tree as an
    /// unresolvable local/remote create pair.
    pub fn rebuild_if_empty(
        &mut self,
        local: &HashMap<SyncPath, FileMetadata>,
        remote: &HashMap<SyncPath, FileMetadata>,
    ) {
        if self.count() > 0 {
            return;
        }
        for (path, l) in local {
            if let Some(r) = remote.get(path) {
                if l.etag == r.etag {
                    self.set(
                        path.clone(),
                        FileMetadata {
                            etag: l.etag.clone(),
                            local_etag: l.etag.clone(),
                            size: l.size,
                            last_modified: l.last_modified,
                            version: r.version.clone(),
                            completed_at: 0,
                        },
                    );
                }
            }
        }
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).context("init journal schema")?;
    ensure_completed_at_column(conn).context("migrate journal")
}

fn load_all(conn: &rusqlite::Connection) -> Result<HashMap<SyncPath, FileMetadata>> {
    let mut entries = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT path, size, etag, local_etag, version, last_modified, completed_at FROM sync_journal",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let path: String = row.get(0)?;
        let size: i64 = row.get(1)?;
        let etag: String = row.get(2)?;
        let local_etag: String = row.get(3)?;
        let version: String = row.get(4)?;
        let last_modified: String = row.get(5)?;
        let completed_at: i64 = row.get(6)?;
        entries.insert(
            path,
            FileMetadata {
                etag,
                local_etag,
                size,
                last_modified: parse_rfc3339_epoch(&last_modified).unwrap_or(0),
                version,
                completed_at,
            },
        );
    }
    Ok(entries)
}

fn epoch_to_rfc3339(epoch_seconds: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(epoch_seconds, 0)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339()
}

fn parse_rfc3339_epoch(raw: &str) -> Option<i64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    Some(parsed.with_timezone(&chrono::Utc).timestamp())
}

fn ensure_completed_at_column(conn: &rusqlite::Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(sync_journal)")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "completed_at" {
            return Ok(());
        }
    }
    conn.execute(
        "ALTER TABLE sync_journal ADD COLUMN completed_at INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("journal-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn set_then_save_then_reopen_round_trips() {
        let dir = temp_dir();
        {
            let mut journal = Journal::open(&dir).unwrap();
            journal.set("alice@x/a.txt", FileMetadata::new("etag1", 10, 100));
            journal.save().unwrap();
        }
        let journal = Journal::open(&dir).unwrap();
        let meta = journal.get("alice@x/a.txt").unwrap();
        assert_eq!(meta.etag, "etag1");
        assert_eq!(meta.size, 10);
    }

    #[test]
    fn delete_removes_row_after_save() {
        let dir = temp_dir();
        let mut journal = Journal::open(&dir).unwrap();
        journal.set("alice@x/a.txt", FileMetadata::new("etag1", 10, 100));
        journal.save().unwrap();
        journal.delete("alice@x/a.txt");
        journal.save().unwrap();
        assert!(journal.get("alice@x/a.txt").is_none());

        let reopened = Journal::open(&dir).unwrap();
        assert_eq!(reopened.count(), 0);
    }

    #[test]
    fn contents_changed_compares_against_journal_etag() {
        let dir = temp_dir();
        let mut journal = Journal::open(&dir).unwrap();
        assert!(journal.contents_changed("alice@x/a.txt", "etag1"));

        journal.set("alice@x/a.txt", FileMetadata::new("etag1", 10, 100));
        assert!(!journal.contents_changed("alice@x/a.txt", "etag1"));
        assert!(journal.contents_changed("alice@x/a.txt", "etag2"));
    }

    #[test]
    fn destroy_renames_db_file_to_bak() {
        let dir = temp_dir();
        let journal = Journal::open(&dir).unwrap();
        let db_path = dir.join(".data").join("sync.db");
        assert!(db_path.exists());
        journal.destroy().unwrap();
        assert!(!db_path.exists());
        let bak_exists = fs::read_dir(dir.join(".data"))
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("sync.db.") && e.file_name().to_string_lossy().ends_with(".bak"));
        assert!(bak_exists);
    }

    #[test]
    fn rebuild_if_empty_seeds_matching_entries_only() {
        let dir = temp_dir();
        let mut journal = Journal::open(&dir).unwrap();
        let mut local = HashMap::new();
        local.insert("a@x/p".to_string(), FileMetadata::new("same", 5, 0));
        local.insert("a@x/q".to_string(), FileMetadata::new("local-only", 5, 0));
        let mut remote = HashMap::new();
        remote.insert("a@x/p".to_string(), FileMetadata::new("same", 5, 0));
        remote.insert("a@x/r".to_string(), FileMetadata::new("remote-only", 5, 0));

        journal.rebuild_if_empty(&local, &remote);
        assert_eq!(journal.count(), 1);
        assert!(journal.get("a@x/p").is_some());
    }

    #[test]
    fn rebuild_if_empty_is_noop_once_populated() {
        let dir = temp_dir();
        let mut journal = Journal::open(&dir).unwrap();
        journal.set("a@x/p", FileMetadata::new("x", 1, 0));
        let local = HashMap::new();
        let mut remote = HashMap::new();
        remote.insert("a@x/q".to_string(), FileMetadata::new("y", 1, 0));
        journal.rebuild_if_empty(&local, &remote);
        assert_eq!(journal.count(), 1);
        assert!(journal.get("a@x/q").is_none());
    }
}
