//! File Watcher Filter: wraps a recursive filesystem watcher with two
//! behaviors layered on top of the raw event stream (§4.5):
//!
//! - `IgnoreOnce`: swallow the next event for a path (or all events until a
//!   deadline), so a self-induced write from a download doesn't bounce back
//!   into a re-upload.
//! - `FilterPaths`: drop events that match a caller-supplied predicate
//!   (ignored paths, non-priority paths, marker-suffixed paths, temp files).
//!
//! Single-writer: one consumer task dequeues raw events, applies both
//! filters, and forwards the survivors on a bounded channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
enum IgnoreUntil {
    NextEvent,
    Deadline(Instant),
}

/// Tracks paths whose next watcher event (or all events until a deadline)
/// should be swallowed. Shared between the consumer task and whoever issues
/// `ignore_once` (priority/batch download writers).
#[derive(Default, Clone)]
pub struct IgnoreOnceMap {
    inner: Arc<Mutex<HashMap<PathBuf, IgnoreUntil>>>,
}

impl IgnoreOnceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swallow the next event for `path`. If `ttl` is given, all events
    /// until `Instant::now() + ttl` are swallowed instead of just the next one.
    pub fn ignore_once(&self, path: &Path, ttl: Option<Duration>) {
        let until = match ttl {
            Some(d) => IgnoreUntil::Deadline(Instant::now() + d),
            None => IgnoreUntil::NextEvent,
        };
        self.inner.lock().unwrap().insert(path.to_path_buf(), until);
    }

    /// True if `path` is currently covered by an ignore-once entry. Consumes
    /// the entry for the `NextEvent` case; a `Deadline` entry survives until
    /// it expires (checked here and during the sweep).
    fn consume(&self, path: &Path) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get(path).copied() {
            Some(IgnoreUntil::NextEvent) => {
                map.remove(path);
                true
            }
            Some(IgnoreUntil::Deadline(deadline)) => {
                if Instant::now() < deadline {
                    true
                } else {
                    map.remove(path);
                    false
                }
            }
            None => false,
        }
    }

    /// Drops every entry whose deadline has passed. `NextEvent` entries are
    /// never swept here; they're cleared the moment they're consumed.
    fn sweep_expired(&self) {
        let now = Instant::now();
        self.inner.lock().unwrap().retain(|_, until| match until {
            IgnoreUntil::NextEvent => true,
            IgnoreUntil::Deadline(deadline) => now < *deadline,
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// A filtered, debounced watcher event ready for the reconcile/priority path.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
}

pub type FilterPredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Owns the raw `notify` watcher plus the ignore-once map and a path
/// predicate; exposes a channel of filtered events to the engine. Dropping
/// the `Watcher` stops the underlying OS watch and the sweep task.
pub struct Watcher {
    _inner: RecommendedWatcher,
    ignore_once: IgnoreOnceMap,
    sweep_handle: tokio::task::JoinHandle<()>,
    rx: mpsc::Receiver<WatchEvent>,
}

impl Watcher {
    /// Starts watching `root` recursively. `should_drop` is the `FilterPaths`
    /// predicate (§4.5): events for which it returns `true` are dropped
    /// silently before the ignore-once check even runs.
    pub fn start(root: &Path, should_drop: FilterPredicate) -> Result<Self> {
        Self::start_with_sweep_interval(root, should_drop, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn start_with_sweep_interval(
        root: &Path,
        should_drop: FilterPredicate,
        sweep_interval: Duration,
    ) -> Result<Self> {
        let ignore_once = IgnoreOnceMap::new();
        let (raw_tx, mut raw_rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.blocking_send(event);
            }
        })
        .context("create filesystem watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;

        let (tx, rx) = mpsc::channel::<WatchEvent>(EVENT_CHANNEL_CAPACITY);
        let consumer_ignore = ignore_once.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in event.paths {
                    if should_drop(&path) {
                        continue;
                    }
                    if consumer_ignore.consume(&path) {
                        continue;
                    }
                    if tx.send(WatchEvent { path }).await.is_err() {
                        return;
                    }
                }
            }
        });

        let sweep_map = ignore_once.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                sweep_map.sweep_expired();
            }
        });

        Ok(Self {
            _inner: watcher,
            ignore_once,
            sweep_handle,
            rx,
        })
    }

    /// Swallow the next event (or all events until `ttl`) for `path`.
    pub fn ignore_once(&self, path: &Path, ttl: Option<Duration>) {
        self.ignore_once.ignore_once(path, ttl);
    }

    /// A cloneable handle onto the same ignore-once map the watcher's
    /// consumer task filters against, for callers (priority/batch writers)
    /// that need to mark paths without holding the `Watcher` itself.
    pub fn ignore_once_handle(&self) -> IgnoreOnceMap {
        self.ignore_once.clone()
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.sweep_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration as StdDuration;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("watcher-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn ignore_once_without_ttl_is_consumed_exactly_once() {
        let map = IgnoreOnceMap::new();
        let path = PathBuf::from("/x/a.txt");
        map.ignore_once(&path, None);
        assert!(map.consume(&path));
        assert!(!map.consume(&path));
    }

    #[test]
    fn ignore_once_with_ttl_covers_repeated_events_until_expiry() {
        let map = IgnoreOnceMap::new();
        let path = PathBuf::from("/x/a.txt");
        map.ignore_once(&path, Some(StdDuration::from_millis(50)));
        assert!(map.consume(&path));
        assert!(map.consume(&path));
        std::thread::sleep(StdDuration::from_millis(80));
        assert!(!map.consume(&path));
    }

    #[test]
    fn sweep_expired_drops_only_past_deadlines() {
        let map = IgnoreOnceMap::new();
        map.ignore_once(&PathBuf::from("/x/a.txt"), Some(StdDuration::from_millis(10)));
        map.ignore_once(&PathBuf::from("/x/b.txt"), None);
        std::thread::sleep(StdDuration::from_millis(30));
        map.sweep_expired();
        // The NextEvent entry for b.txt survives; the expired deadline for a.txt is gone.
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn filtered_event_is_forwarded_and_ignored_path_is_dropped() {
        let dir = temp_dir();
        let filtered = dir.join("skip-me.tmp");
        let drop_predicate: FilterPredicate = Arc::new(move |p: &Path| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".tmp"))
        });
        let mut watcher = Watcher::start(&dir, drop_predicate).unwrap();

        fs::write(dir.join("keep.txt"), b"hello").unwrap();
        fs::write(&filtered, b"bye").unwrap();

        let event = tokio::time::timeout(StdDuration::from_secs(5), watcher.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        assert_eq!(event.path.file_name().unwrap(), "keep.txt");
    }
}
