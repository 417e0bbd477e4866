//! Pure reconciliation: classifies `(local, remote, journal)` triples into
//! the buckets of a `ReconcileResult`. No filesystem, no network, no tokio —
//! this module exists so it can be unit- and property-tested in isolation.

use std::collections::{HashMap, HashSet};

use crate::model::{
    ConflictState, FileMetadata, OperationType, PathStatus, ReconcileOperation, ReconcileResult,
    SyncPath,
};

/// Inputs the ignore predicate needs; kept generic over a closure so the
/// reconciler does not depend on `globset`/`ignore` directly.
pub type IgnorePredicate<'a> = dyn Fn(&str) -> bool + 'a;

const RACE_GUARD_SECONDS: i64 = 5;
const MAX_ERROR_COUNT: u32 = 3;

pub struct ReconcileInputs<'a> {
    pub local: &'a HashMap<SyncPath, FileMetadata>,
    pub remote: &'a HashMap<SyncPath, FileMetadata>,
    pub journal: &'a HashMap<SyncPath, FileMetadata>,
    pub status: &'a HashMap<SyncPath, PathStatus>,
    pub owner_email: &'a str,
    pub now: i64,
    pub is_ignored: &'a IgnorePredicate<'a>,
}

/// Compare two metadata snapshots using, in order: version, etag, size,
/// last_modified. Equality on the first comparable field wins.
///
/// Special case: a plain-MD5 local etag compared against a remote multipart
/// etag (`hex-N`) on a non-owner path is NOT considered modified when sizes
/// match (tolerates a multipart re-upload of identical bytes by another
/// client). On an owner path this tolerance does not apply.
pub fn has_modified(a: &FileMetadata, b: &FileMetadata, is_owner: bool) -> bool {
    if !a.version.is_empty() && !b.version.is_empty() {
        return a.version != b.version;
    }

    let ea = normalize_etag(&a.etag);
    let eb = normalize_etag(&b.etag);
    if !ea.is_empty() && !eb.is_empty() {
        if ea == eb {
            return false;
        }
        if !is_owner && is_mixed_multipart_etag_pair(&ea, &eb) && a.size == b.size {
            return false;
        }
        return true;
    }

    if a.size != b.size {
        return true;
    }

    a.last_modified != b.last_modified
}

fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_ascii_lowercase()
}

fn is_mixed_multipart_etag_pair(a: &str, b: &str) -> bool {
    (is_plain_md5_etag(a) && is_multipart_etag(b)) || (is_multipart_etag(a) && is_plain_md5_etag(b))
}

fn is_plain_md5_etag(etag: &str) -> bool {
    etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_multipart_etag(etag: &str) -> bool {
    let Some((left, right)) = etag.split_once('-') else {
        return false;
    };
    is_plain_md5_etag(left) && !right.is_empty() && right.chars().all(|c| c.is_ascii_digit())
}

fn is_owner_path(owner_email: &str, path: &str) -> bool {
    path.strip_prefix(owner_email)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Pure function of `(local, remote, journal, status, ignore)`. Deterministic
/// and side-effect-free: every input path appears in exactly one output bucket.
pub fn reconcile(inputs: ReconcileInputs<'_>) -> ReconcileResult {
    let ReconcileInputs {
        local,
        remote,
        journal,
        status,
        owner_email,
        now,
        is_ignored,
    } = inputs;

    let mut result = ReconcileResult::default();

    let mut all_paths: HashSet<&str> = HashSet::new();
    all_paths.extend(local.keys().map(String::as_str));
    all_paths.extend(remote.keys().map(String::as_str));
    all_paths.extend(journal.keys().map(String::as_str));

    for path in all_paths {
        let path_owned = path.to_string();
        let l = local.get(path);
        let r = remote.get(path);
        let j = journal.get(path);

        if should_skip(path, l, status, now, is_ignored) {
            result.ignored.insert(path_owned);
            continue;
        }

        let is_owner = is_owner_path(owner_email, path);

        match (l, r, j) {
            (None, None, Some(_)) => {
                result.cleanups.insert(path_owned);
            }
            (Some(lm), None, None) => {
                result.remote_writes.insert(
                    path_owned.clone(),
                    ReconcileOperation {
                        op_type: OperationType::WriteRemote,
                        path: path_owned,
                        local: Some(lm.clone()),
                        remote: None,
                        last_synced: None,
                    },
                );
            }
            (None, Some(rm), None) => {
                result.local_writes.insert(
                    path_owned.clone(),
                    ReconcileOperation {
                        op_type: OperationType::WriteLocal,
                        path: path_owned,
                        local: None,
                        remote: Some(rm.clone()),
                        last_synced: None,
                    },
                );
            }
            (None, Some(_), Some(_)) => {
                result.remote_deletes.insert(
                    path_owned.clone(),
                    ReconcileOperation {
                        op_type: OperationType::DeleteRemote,
                        path: path_owned,
                        local: None,
                        remote: r.cloned(),
                        last_synced: j.cloned(),
                    },
                );
            }
            (Some(_), None, Some(_)) => {
                result.local_deletes.insert(
                    path_owned.clone(),
                    ReconcileOperation {
                        op_type: OperationType::DeleteLocal,
                        path: path_owned,
                        local: l.cloned(),
                        remote: None,
                        last_synced: j.cloned(),
                    },
                );
            }
            (Some(lm), Some(rm), None) => {
                // Both created independently with no shared ancestor: conflict.
                result.conflicts.insert(
                    path_owned.clone(),
                    ReconcileOperation {
                        op_type: OperationType::Conflict,
                        path: path_owned,
                        local: Some(lm.clone()),
                        remote: Some(rm.clone()),
                        last_synced: None,
                    },
                );
            }
            (Some(lm), Some(rm), Some(jm)) => {
                let local_modified = has_modified(lm, jm, is_owner);
                let remote_modified = has_modified(jm, rm, is_owner);
                match (local_modified, remote_modified) {
                    (true, true) => {
                        result.conflicts.insert(
                            path_owned.clone(),
                            ReconcileOperation {
                                op_type: OperationType::Conflict,
                                path: path_owned,
                                local: Some(lm.clone()),
                                remote: Some(rm.clone()),
                                last_synced: Some(jm.clone()),
                            },
                        );
                    }
                    (true, false) => {
                        result.remote_writes.insert(
                            path_owned.clone(),
                            ReconcileOperation {
                                op_type: OperationType::WriteRemote,
                                path: path_owned,
                                local: Some(lm.clone()),
                                remote: Some(rm.clone()),
                                last_synced: Some(jm.clone()),
                            },
                        );
                    }
                    (false, true) => {
                        result.local_writes.insert(
                            path_owned.clone(),
                            ReconcileOperation {
                                op_type: OperationType::WriteLocal,
                                path: path_owned,
                                local: Some(lm.clone()),
                                remote: Some(rm.clone()),
                                last_synced: Some(jm.clone()),
                            },
                        );
                    }
                    (false, false) => {
                        result.unchanged.insert(path_owned);
                    }
                }
            }
            (None, None, None) => unreachable!("path came from one of local/remote/journal"),
        }
    }

    result
}

fn should_skip(
    path: &str,
    local: Option<&FileMetadata>,
    status: &HashMap<SyncPath, PathStatus>,
    now: i64,
    is_ignored: &IgnorePredicate<'_>,
) -> bool {
    if is_ignored(path) {
        return true;
    }
    if let Some(lm) = local {
        if lm.size == 0 {
            return true;
        }
    }
    if let Some(st) = status.get(path) {
        if matches!(st.sync_state, crate::model::SyncState::Syncing) {
            return true;
        }
        if matches!(st.sync_state, crate::model::SyncState::Completed)
            && st.conflict_state == ConflictState::None
            && now - st.last_updated < RACE_GUARD_SECONDS
        {
            return true;
        }
        if st.error_count >= MAX_ERROR_COUNT {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncState;

    fn no_ignore(_: &str) -> bool {
        false
    }

    fn run(
        local: HashMap<SyncPath, FileMetadata>,
        remote: HashMap<SyncPath, FileMetadata>,
        journal: HashMap<SyncPath, FileMetadata>,
    ) -> ReconcileResult {
        let status = HashMap::new();
        reconcile(ReconcileInputs {
            local: &local,
            remote: &remote,
            journal: &journal,
            status: &status,
            owner_email: "alice@x",
            now: 1_000_000,
            is_ignored: &no_ignore,
        })
    }

    // S1 — local-only create uploads remote.
    #[test]
    fn local_only_create_uploads_remote() {
        let path = "alice@x/public/a.txt".to_string();
        let mut local = HashMap::new();
        local.insert(path.clone(), FileMetadata::new("l1", 2, 0));
        let result = run(local, HashMap::new(), HashMap::new());
        assert!(result.remote_writes.contains_key(&path));
        assert_eq!(result.total_paths(), 1);
    }

    // S2 — remote-only create downloads local.
    #[test]
    fn remote_only_create_downloads_local() {
        let path = "bob@x/public/a.txt".to_string();
        let mut remote = HashMap::new();
        remote.insert(path.clone(), FileMetadata::new("r1", 2, 0));
        let result = run(HashMap::new(), remote, HashMap::new());
        assert!(result.local_writes.contains_key(&path));
    }

    // S3 — simultaneous modification -> conflict.
    #[test]
    fn simultaneous_modification_is_conflict() {
        let path = "alice@x/public/a.txt".to_string();
        let mut local = HashMap::new();
        local.insert(path.clone(), FileMetadata::new("l2", 2, 0));
        let mut remote = HashMap::new();
        remote.insert(path.clone(), FileMetadata::new("r2", 2, 0));
        let mut journal = HashMap::new();
        journal.insert(path.clone(), FileMetadata::new("l1", 2, 0));
        let result = run(local, remote, journal);
        assert!(result.conflicts.contains_key(&path));
    }

    // S4 — local delete deletes remote.
    #[test]
    fn local_delete_deletes_remote() {
        let path = "alice@x/public/a.txt".to_string();
        let mut remote = HashMap::new();
        remote.insert(path.clone(), FileMetadata::new("r1", 2, 0));
        let mut journal = HashMap::new();
        journal.insert(path.clone(), FileMetadata::new("r1", 2, 0));
        let result = run(HashMap::new(), remote, journal);
        assert!(result.remote_deletes.contains_key(&path));
    }

    // S5 — zero-byte local file is ignored.
    #[test]
    fn zero_byte_local_file_is_ignored() {
        let path = "alice@x/q".to_string();
        let mut local = HashMap::new();
        local.insert(path.clone(), FileMetadata::new("x", 0, 0));
        let result = run(local, HashMap::new(), HashMap::new());
        assert!(result.ignored.contains(&path));
        assert_eq!(result.total_paths(), 1);
    }

    // S6 — mixed multipart etags on non-owner path tolerated; owner path is not.
    #[test]
    fn mixed_multipart_etag_tolerance_is_owner_scoped() {
        let path = "alice@x/public/a.bin".to_string();
        let mut local = HashMap::new();
        local.insert(
            path.clone(),
            FileMetadata::new("aaaabbbbccccddddeeeeffff00001111", 100, 0),
        );
        let mut remote = HashMap::new();
        remote.insert(
            path.clone(),
            FileMetadata::new("aaaabbbbccccddddeeeeffff00001111-4", 100, 0),
        );
        let mut journal = HashMap::new();
        journal.insert(
            path.clone(),
            FileMetadata::new("aaaabbbbccccddddeeeeffff00001111-4", 100, 0),
        );

        let status = HashMap::new();
        let non_owner = reconcile(ReconcileInputs {
            local: &local,
            remote: &remote,
            journal: &journal,
            status: &status,
            owner_email: "bob@x",
            now: 0,
            is_ignored: &no_ignore,
        });
        assert!(non_owner.unchanged.contains(&path));

        let owner = reconcile(ReconcileInputs {
            local: &local,
            remote: &remote,
            journal: &journal,
            status: &status,
            owner_email: "alice@x",
            now: 0,
            is_ignored: &no_ignore,
        });
        assert!(owner.remote_writes.contains_key(&path));
    }

    #[test]
    fn every_path_lands_in_exactly_one_bucket() {
        let path = "alice@x/p".to_string();
        let mut local = HashMap::new();
        local.insert(path.clone(), FileMetadata::new("l", 5, 0));
        let mut remote = HashMap::new();
        remote.insert(path.clone(), FileMetadata::new("l", 5, 0));
        let mut journal = HashMap::new();
        journal.insert(path.clone(), FileMetadata::new("l", 5, 0));
        let result = run(local, remote, journal);
        assert_eq!(result.total_paths(), 1);
        assert!(result.unchanged.contains(&path));
    }

    #[test]
    fn reconcile_is_deterministic() {
        let path = "alice@x/p".to_string();
        let mut local = HashMap::new();
        local.insert(path.clone(), FileMetadata::new("l1", 5, 0));
        let a = run(local.clone(), HashMap::new(), HashMap::new());
        let b = run(local, HashMap::new(), HashMap::new());
        assert_eq!(a.remote_writes.contains_key(&path), b.remote_writes.contains_key(&path));
        assert_eq!(a.total_paths(), b.total_paths());
    }

    #[test]
    fn race_guard_skips_recently_completed_path() {
        let path = "alice@x/p".to_string();
        let mut local = HashMap::new();
        local.insert(path.clone(), FileMetadata::new("l2", 5, 0));
        let mut journal = HashMap::new();
        journal.insert(path.clone(), FileMetadata::new("l1", 5, 0));
        let mut status = HashMap::new();
        status.insert(
            path.clone(),
            PathStatus {
                sync_state: SyncState::Completed,
                conflict_state: ConflictState::None,
                progress: 100.0,
                error: None,
                error_count: 0,
                last_updated: 1000,
            },
        );
        let result = reconcile(ReconcileInputs {
            local: &local,
            remote: &HashMap::new(),
            journal: &journal,
            status: &status,
            owner_email: "alice@x",
            now: 1002,
            is_ignored: &no_ignore,
        });
        assert!(result.ignored.contains(&path));
    }

    #[test]
    fn has_modified_is_symmetric_on_matching_etag() {
        let a = FileMetadata::new("abc", 10, 100);
        let b = FileMetadata::new("abc", 10, 100);
        assert!(!has_modified(&a, &b, true));
        assert!(!has_modified(&b, &a, true));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn no_ignore(_: &str) -> bool {
        false
    }

    fn arb_meta() -> impl Strategy<Value = FileMetadata> {
        ("[a-c]{1,3}", 0i64..1000, 0i64..1_000_000).prop_map(|(etag, size, last_modified)| {
            FileMetadata::new(etag, size, last_modified)
        })
    }

    fn arb_slot() -> impl Strategy<Value = Option<FileMetadata>> {
        prop_oneof![Just(None), arb_meta().prop_map(Some)]
    }

    proptest! {
        // Every generated (local, remote, journal) triple for a single path lands
        // in exactly one ReconcileResult bucket; no path is ever silently dropped
        // or double-counted.
        #[test]
        fn single_path_lands_in_exactly_one_bucket(
            local in arb_slot(),
            remote in arb_slot(),
            journal in arb_slot(),
        ) {
            let path = "alice@x/p".to_string();
            let mut local_map = HashMap::new();
            let mut remote_map = HashMap::new();
            let mut journal_map = HashMap::new();
            if let Some(m) = local { local_map.insert(path.clone(), m); }
            if let Some(m) = remote { remote_map.insert(path.clone(), m); }
            if let Some(m) = journal { journal_map.insert(path.clone(), m); }

            if local_map.is_empty() && remote_map.is_empty() && journal_map.is_empty() {
                return Ok(());
            }

            let result = reconcile(ReconcileInputs {
                local: &local_map,
                remote: &remote_map,
                journal: &journal_map,
                status: &HashMap::new(),
                owner_email: "alice@x",
                now: 10_000,
                is_ignored: &no_ignore,
            });

            let buckets = [
                result.remote_writes.contains_key(&path),
                result.local_writes.contains_key(&path),
                result.local_deletes.contains_key(&path),
                result.remote_deletes.contains_key(&path),
                result.conflicts.contains_key(&path),
                result.unchanged.contains(&path),
                result.cleanups.contains(&path),
                result.ignored.contains(&path),
            ];
            let hits = buckets.iter().filter(|b| **b).count();
            prop_assert_eq!(hits, 1, "path landed in {} buckets, expected exactly 1", hits);
        }

        // has_modified is reflexive: a metadata snapshot is never "modified"
        // relative to an identical clone of itself.
        #[test]
        fn has_modified_is_reflexive(meta in arb_meta(), is_owner in any::<bool>()) {
            let clone = meta.clone();
            prop_assert!(!has_modified(&meta, &clone, is_owner));
        }
    }
}
