//! ACL Staging: atomic, ordered application of a set of ACL files. A
//! server-sent manifest names the exact paths (and their content hashes)
//! expected for one datasite; staged ACL bytes accumulate until every
//! manifest entry has arrived, then fire once, in manifest order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::model::{ACLManifest, StagedACL};

struct PendingACLSet {
    manifest: ACLManifest,
    received: HashMap<String, StagedACL>,
    applied: bool,
}

impl PendingACLSet {
    fn is_complete(&self) -> bool {
        self.manifest
            .acl_order
            .iter()
            .all(|entry| self.received.contains_key(&entry.path))
    }

    fn received_count(&self) -> usize {
        self.received.len()
    }

    fn expected_count(&self) -> usize {
        self.manifest.acl_order.len()
    }
}

type OnReadyCallback = Arc<dyn Fn(String, Vec<StagedACL>) + Send + Sync>;

/// One instance per datasite-syncing client. A fresh manifest for a
/// datasite replaces any in-flight pending set outright, per the resolved
/// Open Question in SPEC_FULL.md §9: the server's latest view always wins
/// over a partially-staged older one.
pub struct ACLStagingManager {
    pending: Mutex<HashMap<String, PendingACLSet>>,
    on_ready: Option<OnReadyCallback>,
}

impl ACLStagingManager {
    pub fn new<F>(on_ready: F) -> Self
    where
        F: Fn(String, Vec<StagedACL>) + Send + Sync + 'static,
    {
        Self {
            pending: Mutex::new(HashMap::new()),
            on_ready: Some(Arc::new(on_ready)),
        }
    }

    pub fn set_manifest(&self, manifest: ACLManifest) {
        let mut pending = self.pending.lock().expect("acl staging lock");
        let datasite = manifest.datasite.clone();

        if let Some(existing) = pending.get(&datasite) {
            if !existing.applied {
                crate::logging::info(format!(
                    "acl staging replacing pending manifest datasite={} oldCount={} newCount={}",
                    datasite,
                    existing.expected_count(),
                    manifest.acl_order.len()
                ));
            }
        }

        let expected_count = manifest.acl_order.len();
        pending.insert(
            datasite.clone(),
            PendingACLSet {
                manifest,
                received: HashMap::new(),
                applied: false,
            },
        );

        crate::logging::info(format!(
            "acl staging manifest set datasite={datasite} expectedCount={expected_count}"
        ));
    }

    /// Records one staged ACL file. Returns `false` if there is no pending
    /// manifest for `datasite`, the manifest was already applied, or `path`
    /// is not among the manifest's expected paths.
    pub fn stage_acl(&self, datasite: &str, path: &str, content: Vec<u8>, etag: String) -> bool {
        let mut pending_guard = self.pending.lock().expect("acl staging lock");
        let pending = match pending_guard.get_mut(datasite) {
            Some(p) if !p.applied => p,
            _ => return false,
        };

        let is_expected = pending
            .manifest
            .acl_order
            .iter()
            .any(|entry| entry.path == path);
        if !is_expected {
            crate::logging::info(format!(
                "acl staging unexpected path datasite={datasite} path={path}"
            ));
            return false;
        }

        pending.received.insert(
            path.to_string(),
            StagedACL {
                path: path.to_string(),
                content,
                etag,
            },
        );

        crate::logging::info(format!(
            "acl staging received datasite={} path={} received={} expected={}",
            datasite,
            path,
            pending.received_count(),
            pending.expected_count()
        ));

        if pending.is_complete() {
            crate::logging::info(format!(
                "acl staging complete datasite={} count={}",
                datasite,
                pending.expected_count()
            ));
            pending.applied = true;

            let ordered_acls: Vec<StagedACL> = pending
                .manifest
                .acl_order
                .iter()
                .filter_map(|entry| pending.received.get(&entry.path).cloned())
                .collect();

            if let Some(ref on_ready) = self.on_ready {
                let callback = on_ready.clone();
                let ds = datasite.to_string();
                drop(pending_guard);
                callback(ds, ordered_acls);
            }
        }

        true
    }

    pub fn has_pending_manifest(&self, datasite: &str) -> bool {
        let pending = self.pending.lock().expect("acl staging lock");
        pending.get(datasite).is_some_and(|p| !p.applied)
    }

    pub fn get_pending_paths(&self, datasite: &str) -> Vec<String> {
        let pending = self.pending.lock().expect("acl staging lock");
        match pending.get(datasite) {
            Some(p) => p
                .manifest
                .acl_order
                .iter()
                .map(|e| e.path.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Sorts ACL paths depth-first then lexicographically, matching the order a
/// manifest is expected to list them in (parent ACLs apply before children).
pub fn depth_then_lex_order(paths: &mut [String]) {
    paths.sort_by(|a, b| {
        let depth_a = a.matches('/').count();
        let depth_b = b.matches('/').count();
        depth_a.cmp(&depth_b).then_with(|| a.cmp(b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ACLEntry;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manifest(datasite: &str, entries: Vec<(&str, &str)>) -> ACLManifest {
        ACLManifest {
            version: 1,
            datasite: datasite.to_string(),
            principal_hash: "abc123".to_string(),
            generated: "2026-01-01T00:00:00Z".to_string(),
            acl_order: entries
                .into_iter()
                .map(|(path, hash)| ACLEntry {
                    path: path.to_string(),
                    hash: hash.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn staging_complete_triggers_callback_in_manifest_order() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();
        let seen_order = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen_order.clone();

        let manager = ACLStagingManager::new(move |_datasite, acls| {
            called_clone.store(true, Ordering::SeqCst);
            *seen_clone.lock().unwrap() = acls.into_iter().map(|a| a.path).collect();
        });

        manager.set_manifest(manifest(
            "test@example.com",
            vec![("test@example.com", "h1"), ("test@example.com/public", "h2")],
        ));
        assert!(manager.has_pending_manifest("test@example.com"));
        assert!(!called.load(Ordering::SeqCst));

        manager.stage_acl("test@example.com", "test@example.com/public", b"acl2".to_vec(), "etag2".into());
        assert!(!called.load(Ordering::SeqCst));

        manager.stage_acl("test@example.com", "test@example.com", b"acl1".to_vec(), "etag1".into());
        assert!(called.load(Ordering::SeqCst));
        assert!(!manager.has_pending_manifest("test@example.com"));
        assert_eq!(
            *seen_order.lock().unwrap(),
            vec!["test@example.com".to_string(), "test@example.com/public".to_string()]
        );
    }

    #[test]
    fn unexpected_path_is_rejected() {
        let manager = ACLStagingManager::new(|_, _| {});
        manager.set_manifest(manifest("test@example.com", vec![("test@example.com", "h1")]));
        let staged = manager.stage_acl(
            "test@example.com",
            "test@example.com/unexpected",
            b"acl".to_vec(),
            "etag".into(),
        );
        assert!(!staged);
    }

    #[test]
    fn new_manifest_replaces_in_flight_pending_set() {
        let manager = ACLStagingManager::new(|_, _| {});
        manager.set_manifest(manifest("a@x", vec![("a@x", "h1"), ("a@x/p", "h2")]));
        manager.stage_acl("a@x", "a@x", b"v1".to_vec(), "e1".into());
        assert_eq!(manager.get_pending_paths("a@x").len(), 2);

        manager.set_manifest(manifest("a@x", vec![("a@x", "h3")]));
        assert_eq!(manager.get_pending_paths("a@x"), vec!["a@x".to_string()]);
        assert!(manager.has_pending_manifest("a@x"));
    }

    #[test]
    fn depth_then_lex_order_sorts_parents_before_children() {
        let mut paths = vec![
            "a@x/public/deep".to_string(),
            "a@x".to_string(),
            "a@x/public".to_string(),
        ];
        depth_then_lex_order(&mut paths);
        assert_eq!(
            paths,
            vec!["a@x".to_string(), "a@x/public".to_string(), "a@x/public/deep".to_string()]
        );
    }
}
