//! Local State Scanner: walks the datasites tree and produces a
//! `SyncPath -> FileMetadata` map, reusing a cached etag when a file's size
//! and mtime haven't changed since the previous scan.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::model::{FileMetadata, SyncPath};

const DEFAULT_MULTIPART_PART_SIZE: i64 = 64 * 1024 * 1024;
const MIN_MULTIPART_PART_SIZE: i64 = 5 * 1024 * 1024;
const MAX_MULTIPART_PARTS: i64 = 10_000;
const MULTIPART_THRESHOLD: i64 = 32 * 1024 * 1024;

#[derive(Clone, Debug)]
struct CacheEntry {
    size: i64,
    mtime_nanos: u128,
    etag: String,
}

/// True if `key`'s first path segment is an email-shaped datasite root.
/// Keeps the scanner from syncing objects outside the datasites namespace.
pub fn is_synced_key(key: &str) -> bool {
    let key = key.trim_start_matches('/');
    match key.split_once('/') {
        Some((root, _rest)) => root.contains('@'),
        None => false,
    }
}

/// Incremental local filesystem scanner. Keeps a cache of `(size, mtime)` ->
/// etag between calls to `scan` so unchanged files are not rehashed.
#[derive(Default)]
pub struct LocalScanner {
    cache: HashMap<SyncPath, CacheEntry>,
}

impl LocalScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks `datasites_root`, skipping the `.data` internal directory,
    /// directories, symlinks, and any path for which `is_ignored` returns
    /// true (marker-suffixed paths should be filtered by the caller via
    /// `crate::markers::is_marked_path` composed into `is_ignored`).
    pub fn scan(
        &mut self,
        datasites_root: &Path,
        is_ignored: &dyn Fn(&str) -> bool,
    ) -> Result<HashMap<SyncPath, FileMetadata>> {
        let mut out = HashMap::new();
        let mut next_cache = HashMap::new();

        if !datasites_root.exists() {
            self.cache.clear();
            return Ok(out);
        }

        for entry in WalkDir::new(datasites_root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".data")
            .filter_map(|e| e.ok())
        {
            let ftype = entry.file_type();
            if ftype.is_dir() || ftype.is_symlink() {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(datasites_root)
                .with_context(|| format!("strip prefix {}", path.display()))?;
            let key = rel.to_string_lossy().replace('\\', "/");
            if !is_synced_key(&key) || is_ignored(&key) {
                continue;
            }

            let meta = entry.metadata()?;
            let size = meta.len() as i64;
            let (mtime_nanos, last_modified_secs) = match meta.modified() {
                Ok(st) => {
                    let d = st.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
                    (d.as_nanos(), d.as_secs() as i64)
                }
                Err(_) => (0, 0),
            };

            let etag = match self.cache.get(&key) {
                Some(prev) if prev.size == size && prev.mtime_nanos == mtime_nanos => {
                    prev.etag.clone()
                }
                _ => compute_local_etag(path, size)?,
            };

            next_cache.insert(
                key.clone(),
                CacheEntry {
                    size,
                    mtime_nanos,
                    etag: etag.clone(),
                },
            );
            out.insert(
                key,
                FileMetadata {
                    etag,
                    local_etag: String::new(),
                    size,
                    last_modified: last_modified_secs,
                    version: String::new(),
                    completed_at: 0,
                },
            );
        }

        self.cache = next_cache;
        Ok(out)
    }
}

/// Picks plain MD5 below the multipart threshold, multipart MD5-of-MD5s above it.
pub fn compute_local_etag(path: &Path, size: i64) -> Result<String> {
    if size > MULTIPART_THRESHOLD {
        let (part_size, part_count) = select_part_size(size, parse_part_size_env());
        return compute_multipart_etag(path, size, part_size, part_count);
    }
    compute_md5_hex_streaming(path)
}

fn compute_md5_hex_streaming(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

fn compute_multipart_etag(path: &Path, size: i64, part_size: i64, part_count: i64) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; 1024 * 1024];
    let mut remaining = size;
    let mut part_digests = Vec::with_capacity(part_count.max(0) as usize);

    for _ in 0..part_count {
        let mut ctx = md5::Context::new();
        let mut to_read = remaining.min(part_size);
        while to_read > 0 {
            let cap = std::cmp::min(buf.len() as i64, to_read) as usize;
            let n = file.read(&mut buf[..cap])?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
            to_read -= n as i64;
            remaining -= n as i64;
        }
        part_digests.push(ctx.compute());
    }

    let mut concat = Vec::with_capacity(part_digests.len() * 16);
    for d in &part_digests {
        concat.extend_from_slice(&d.0);
    }
    let final_digest = md5::compute(&concat);
    Ok(format!("{:x}-{part_count}", final_digest))
}

fn parse_part_size_env() -> Option<i64> {
    let v = std::env::var("PART_SIZE").ok()?;
    parse_bytes(&v)
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
        (upper.as_str(), 1)
    };
    num.trim().parse::<i64>().ok().map(|v| v * mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("local-scanner-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn no_ignore(_: &str) -> bool {
        false
    }

    #[test]
    fn scan_empty_dir_returns_empty_map() {
        let dir = temp_dir();
        let mut scanner = LocalScanner::new();
        let result = scanner.scan(&dir, &no_ignore).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn scan_collects_files_under_datasite_root() {
        let dir = temp_dir();
        let datasite = dir.join("alice@example.com").join("public");
        fs::create_dir_all(&datasite).unwrap();
        let mut f = File::create(datasite.join("a.txt")).unwrap();
        f.write_all(b"hello").unwrap();

        // Outside any datasite root: ignored.
        fs::write(dir.join("loose.txt"), b"nope").unwrap();

        let mut scanner = LocalScanner::new();
        let result = scanner.scan(&dir, &no_ignore).unwrap();
        assert_eq!(result.len(), 1);
        let meta = result.get("alice@example.com/public/a.txt").unwrap();
        assert_eq!(meta.etag, format!("{:x}", md5::compute(b"hello")));
        assert_eq!(meta.size, 5);
    }

    #[test]
    fn unchanged_file_reuses_cached_etag() {
        let dir = temp_dir();
        let datasite = dir.join("alice@example.com");
        fs::create_dir_all(&datasite).unwrap();
        fs::write(datasite.join("a.txt"), b"hello").unwrap();

        let mut scanner = LocalScanner::new();
        let first = scanner.scan(&dir, &no_ignore).unwrap();
        let second = scanner.scan(&dir, &no_ignore).unwrap();
        assert_eq!(
            first.get("alice@example.com/a.txt").unwrap().etag,
            second.get("alice@example.com/a.txt").unwrap().etag
        );
    }

    #[test]
    fn is_synced_key_requires_email_shaped_root() {
        assert!(is_synced_key("alice@x/a.txt"));
        assert!(!is_synced_key("noatsign/a.txt"));
        assert!(!is_synced_key("a.txt"));
    }

    #[test]
    fn select_part_size_doubles_to_respect_max_parts() {
        let (part_size, part_count) = select_part_size(MAX_MULTIPART_PARTS * MIN_MULTIPART_PART_SIZE * 2, None);
        assert!(part_count <= MAX_MULTIPART_PARTS);
        assert!(part_size >= MIN_MULTIPART_PART_SIZE);
    }
}
