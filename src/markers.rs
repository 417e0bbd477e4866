//! Marker/conflict file scheme: suffix-based relabeling of a path into a
//! `.conflict`/`.rejected` sibling, with timestamp rotation when a marker
//! target already exists. Pure path manipulation plus the minimal fs calls
//! needed to perform the rename; no network, no journal, no status bus.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Conflict,
    Rejected,
}

impl MarkerKind {
    fn suffix(self) -> &'static str {
        match self {
            MarkerKind::Conflict => "conflict",
            MarkerKind::Rejected => "rejected",
        }
    }
}

const LEGACY_SUFFIXES: [&str; 2] = ["syftconflict", "syftrejected"];
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Splits `dir/base.ext` into `(dir, base, ext)`. `ext` includes no leading dot
/// and is empty when the path has no extension.
fn split(path: &Path) -> (PathBuf, String, String) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, stem, ext)
}

fn join_name(dir: &Path, stem: &str, suffix_parts: &[&str], ext: &str) -> PathBuf {
    let mut name = stem.to_string();
    for part in suffix_parts {
        name.push('.');
        name.push_str(part);
    }
    if !ext.is_empty() {
        name.push('.');
        name.push_str(ext);
    }
    dir.join(name)
}

/// True if `path`'s file name already carries a `.conflict`/`.rejected` marker,
/// including the legacy `.syftconflict`/`.syftrejected` and rotated
/// (`.conflict.<14-digit-timestamp>`) forms.
pub fn is_marked_path(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    for suffix in ["conflict", "rejected"] {
        let needle = format!(".{suffix}.");
        if name.contains(&needle) || name.ends_with(&format!(".{suffix}")) {
            return true;
        }
    }
    LEGACY_SUFFIXES.iter().any(|s| name.contains(s.as_ref() as &str))
}

/// Returns the un-suffixed path for an already-marked path, or `None` if
/// `path` carries no marker. Strips a trailing rotation timestamp too.
pub fn unmarked_path(path: &Path) -> Option<PathBuf> {
    let (dir, stem, ext) = split(path);
    for suffix in ["conflict", "rejected"] {
        if let Some(base) = strip_marker_stem(&stem, suffix) {
            return Some(if ext.is_empty() {
                dir.join(base)
            } else {
                dir.join(format!("{base}.{ext}"))
            });
        }
    }
    None
}

/// `stem` is the file name with extension already removed. Handles both
/// `base.conflict` and the rotated `base.conflict.20260101120000` shapes,
/// where the timestamp (if present) was folded into `stem` because the
/// original extension was stripped first — so `stem` itself may still carry
/// a trailing `.<suffix>` or `.<suffix>.<14 digits>`.
fn strip_marker_stem(stem: &str, suffix: &str) -> Option<String> {
    let marker = format!(".{suffix}");
    if let Some(idx) = stem.rfind(&marker) {
        let (base, rest) = stem.split_at(idx);
        let rest = &rest[marker.len()..];
        if rest.is_empty() || (rest.len() == 15 && rest.starts_with('.') && rest[1..].chars().all(|c| c.is_ascii_digit())) {
            return Some(base.to_string());
        }
    }
    None
}

/// Builds the canonical (unrotated) marker path for `path`, e.g.
/// `a.txt` -> `a.conflict.txt`.
pub fn as_marked_path(path: &Path, kind: MarkerKind) -> PathBuf {
    let (dir, stem, ext) = split(path);
    join_name(&dir, &stem, &[kind.suffix()], &ext)
}

fn rotated_marker_path(path: &Path, kind: MarkerKind, timestamp: &str) -> PathBuf {
    let (dir, stem, ext) = split(path);
    join_name(&dir, &stem, &[kind.suffix(), timestamp], &ext)
}

/// Globs the parent directory for any existing `base.<suffix>.<14-digit-ts>.ext`
/// rotated markers and returns the lexicographically earliest (i.e. oldest),
/// or the unrotated `base.<suffix>.ext` path if that one exists instead.
pub fn find_existing_marker(path: &Path, kind: MarkerKind) -> Option<PathBuf> {
    let unrotated = as_marked_path(path, kind);
    if unrotated.exists() {
        return Some(unrotated);
    }

    let (dir, stem, ext) = split(path);
    let prefix = format!("{stem}.{}.", kind.suffix());
    let entries = fs::read_dir(&dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = match p.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => return false,
            };
            if !name.starts_with(&prefix) {
                return false;
            }
            let rest = &name[prefix.len()..];
            let rest = if ext.is_empty() {
                rest
            } else {
                match rest.strip_suffix(&format!(".{ext}")) {
                    Some(r) => r,
                    None => return false,
                }
            };
            rest.len() == 14 && rest.chars().all(|c| c.is_ascii_digit())
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// True if any rejected marker (rotated or not) already exists for `path`.
pub fn rejected_marker_exists(path: &Path) -> bool {
    find_existing_marker(path, MarkerKind::Rejected).is_some()
}

/// Relabels `path` as a conflict file. If `path` already carries a conflict
/// marker, this is a no-op. If a conflict marker already exists for the
/// underlying base path, the existing marker is rotated to
/// `base.conflict.<timestamp>.ext` first, then `path` takes the canonical
/// unrotated name.
pub fn mark_conflict(path: &Path) -> std::io::Result<PathBuf> {
    if is_marked_path(path) {
        return Ok(path.to_path_buf());
    }

    let target = as_marked_path(path, MarkerKind::Conflict);
    if target.exists() {
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let rotated = rotated_marker_path(path, MarkerKind::Conflict, &timestamp);
        fs::rename(&target, &rotated)?;
    }
    fs::rename(path, &target)?;
    Ok(target)
}

/// Relabels `path` as rejected. Unlike conflicts, rejected markers dedupe
/// rather than rotate: if any rejected marker already exists for this base
/// path, `path` is deleted instead of creating a second one.
pub fn mark_rejected(path: &Path) -> std::io::Result<Option<PathBuf>> {
    if is_marked_path(path) {
        return Ok(Some(path.to_path_buf()));
    }

    if rejected_marker_exists(path) {
        fs::remove_file(path)?;
        return Ok(None);
    }

    let target = as_marked_path(path, MarkerKind::Rejected);
    fs::rename(path, &target)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("markers-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(path: &Path) {
        let mut f = File::create(path).unwrap();
        f.write_all(b"data").unwrap();
    }

    #[test]
    fn mark_conflict_renames_to_canonical_form() {
        let dir = temp_dir();
        let path = dir.join("a.txt");
        touch(&path);
        let marked = mark_conflict(&path).unwrap();
        assert_eq!(marked, dir.join("a.conflict.txt"));
        assert!(!path.exists());
        assert!(marked.exists());
    }

    #[test]
    fn mark_conflict_does_not_double_mark() {
        let dir = temp_dir();
        let path = dir.join("a.conflict.txt");
        touch(&path);
        let marked = mark_conflict(&path).unwrap();
        assert_eq!(marked, path);
    }

    #[test]
    fn mark_conflict_rotates_existing_marker() {
        let dir = temp_dir();
        let original = dir.join("a.txt");
        touch(&original);
        let first = mark_conflict(&original).unwrap();
        assert_eq!(first, dir.join("a.conflict.txt"));

        touch(&original);
        let second = mark_conflict(&original).unwrap();
        assert_eq!(second, dir.join("a.conflict.txt"));

        let rotated = find_existing_marker(&dir.join("a.txt"), MarkerKind::Conflict);
        // After rotation, the canonical slot holds `second`; the old content
        // moved to a timestamped sibling that also satisfies the glob.
        assert!(rotated.is_some());
    }

    #[test]
    fn mark_rejected_dedupes_without_rotation() {
        let dir = temp_dir();
        let original = dir.join("a.txt");
        touch(&original);
        let first = mark_rejected(&original).unwrap();
        assert_eq!(first, Some(dir.join("a.rejected.txt")));

        touch(&original);
        let second = mark_rejected(&original).unwrap();
        assert_eq!(second, None);
        assert!(!original.exists());
        assert!(dir.join("a.rejected.txt").exists());
    }

    #[test]
    fn is_marked_path_detects_legacy_suffixes() {
        assert!(is_marked_path(Path::new("/x/a.syftconflict.txt")));
        assert!(is_marked_path(Path::new("/x/a.syftrejected.txt")));
        assert!(is_marked_path(Path::new("/x/a.conflict.txt")));
        assert!(!is_marked_path(Path::new("/x/a.txt")));
    }

    #[test]
    fn unmarked_path_strips_rotated_timestamp() {
        let p = Path::new("/x/a.conflict.20260101120000.txt");
        assert_eq!(unmarked_path(p), Some(PathBuf::from("/x/a.txt")));
    }
}
