//! Atomic write: stage bytes to a temp file beside the target, fsync, then
//! rename into place. A target that's currently a directory (remote layout
//! changed shape under us) is removed first; a rename racing a reader on
//! Windows gets a few retries instead of failing outright.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

const RENAME_RETRY_ATTEMPTS: u32 = 5;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(50);

fn tmp_path_for(target: &Path) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let fname = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    parent.join(format!(".{fname}.tmp-{}", uuid::Uuid::new_v4()))
}

/// Ensure parent directories exist for `target`. If some ancestor exists as a
/// plain file (blocking directory creation), remove it first.
pub fn ensure_parent_dirs(target: &Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };

    match fs::create_dir_all(parent) {
        Ok(()) => Ok(()),
        Err(_) => {
            let mut cur = parent.to_path_buf();
            loop {
                if cur.exists() {
                    if !fs::metadata(&cur)?.is_dir() {
                        fs::remove_file(&cur)?;
                    }
                    break;
                }
                match cur.parent() {
                    Some(up) => cur = up.to_path_buf(),
                    None => break,
                }
            }
            fs::create_dir_all(parent)?;
            Ok(())
        }
    }
}

/// Writes `bytes` to `target` atomically: stage to a temp sibling, fsync,
/// rename into place. Removes `target` first if it currently exists as a
/// directory (a remote create replacing what was locally a directory).
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dirs(target)?;

    if target.exists() && fs::metadata(target)?.is_dir() {
        fs::remove_dir_all(target).with_context(|| format!("remove dir {}", target.display()))?;
    }

    let tmp = tmp_path_for(target);
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    rename_with_retry(&tmp, target)
}

/// Like `write_atomic`, but first hashes the staged bytes and refuses to
/// commit the rename if the MD5 doesn't match `expected_etag`. Used by
/// priority-path writes, where a corrupted RPC payload must never land on
/// disk silently.
pub fn write_atomic_verified(target: &Path, bytes: &[u8], expected_etag: &str) -> Result<()> {
    let actual = format!("{:x}", md5::compute(bytes));
    let expected = expected_etag.trim().trim_matches('"').to_ascii_lowercase();
    if !expected.is_empty() && actual != expected {
        anyhow::bail!(
            "integrity check failed for {}: expected {expected}, got {actual}",
            target.display()
        );
    }
    write_atomic(target, bytes)
}

/// Renames a staged temp file onto an already-downloaded target. Unlike
/// `write_atomic`, the source bytes are already on disk (streamed there by
/// the batch downloader) so this just performs the commit step.
pub fn commit_staged(tmp: &Path, target: &Path) -> Result<()> {
    ensure_parent_dirs(target)?;
    if target.exists() {
        let meta = fs::metadata(target)?;
        if meta.is_dir() {
            fs::remove_dir_all(target)?;
        } else {
            let _ = fs::remove_file(target);
        }
    }
    rename_with_retry(tmp, target)
}

fn rename_with_retry(from: &Path, to: &Path) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..RENAME_RETRY_ATTEMPTS {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < RENAME_RETRY_ATTEMPTS {
                    std::thread::sleep(RENAME_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("rename {} -> {}", from.display(), to.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("atomic-write-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn write_atomic_creates_missing_parents() {
        let dir = temp_dir();
        let target = dir.join("a").join("b").join("c.txt");
        write_atomic(&target, b"hello").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");
    }

    #[test]
    fn write_atomic_replaces_existing_directory() {
        let dir = temp_dir();
        let target = dir.join("c.txt");
        fs::create_dir_all(&target).unwrap();
        write_atomic(&target, b"now a file").unwrap();
        assert!(fs::metadata(&target).unwrap().is_file());
        assert_eq!(fs::read(&target).unwrap(), b"now a file");
    }

    #[test]
    fn write_atomic_verified_rejects_mismatched_etag() {
        let dir = temp_dir();
        let target = dir.join("c.txt");
        let err = write_atomic_verified(&target, b"hello", "deadbeef").unwrap_err();
        assert!(err.to_string().contains("integrity check failed"));
        assert!(!target.exists());
    }

    #[test]
    fn write_atomic_verified_accepts_matching_etag() {
        let dir = temp_dir();
        let target = dir.join("c.txt");
        let etag = format!("{:x}", md5::compute(b"hello"));
        write_atomic_verified(&target, b"hello", &etag).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");
    }
}
