//! Filesystem observation and the bounded change-event queue
//!
//! Each watched directory gets its own non-recursive `notify` watcher and an
//! observer task. Subdirectories are registered as they appear; there is no
//! up-front scan. The path → handle map is the only record of what is being
//! watched and is guarded by a single lock.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Producer side of the dispatch queue. `send` waits while the queue is full.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ChangeEvent>,
}

pub struct EventReceiver {
    rx: mpsc::Receiver<ChangeEvent>,
}

/// Bounded FIFO between watchers (and resync) and the dispatch workers
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    pub async fn send(&self, event: ChangeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| anyhow::anyhow!("event queue closed, dropped {:?}", e.0))
    }
}

impl EventReceiver {
    /// Next event, or None once every sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Translate one raw notification into change events.
pub fn translate(event: &Event) -> Vec<ChangeEvent> {
    let each = |kind: ChangeKind| -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .map(|p| ChangeEvent::new(p.clone(), kind))
            .collect()
    };
    match &event.kind {
        EventKind::Create(_) => each(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => each(ChangeKind::Write),
        EventKind::Modify(ModifyKind::Metadata(_)) => each(ChangeKind::Chmod),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => each(ChangeKind::Rename),
            RenameMode::To => each(ChangeKind::Create),
            // Backends that report Both also report From and To separately
            RenameMode::Both => Vec::new(),
            RenameMode::Any | RenameMode::Other => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        ChangeKind::Create
                    } else {
                        ChangeKind::Rename
                    };
                    ChangeEvent::new(p.clone(), kind)
                })
                .collect(),
        },
        EventKind::Remove(_) => each(ChangeKind::Remove),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Active observation of one directory
struct WatchHandle {
    path: PathBuf,
    cancel: oneshot::Sender<()>,
}

struct Inner {
    handles: Mutex<HashMap<PathBuf, WatchHandle>>,
    events: EventSender,
}

/// Registry of watched directories. Cheap to clone.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<Inner>,
}

impl WatchManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                handles: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Start observing `path`. Already-watched paths are a no-op.
    /// Must be called from within a Tokio runtime.
    pub fn watch(&self, path: &Path) -> Result<()> {
        let mut handles = self.inner.handles.lock();
        if handles.contains_key(path) {
            return Ok(());
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })
        .context("create filesystem watcher")?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", path.display()))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        handles.insert(
            path.to_path_buf(),
            WatchHandle {
                path: path.to_path_buf(),
                cancel: cancel_tx,
            },
        );
        drop(handles);

        info!(dir = %path.display(), "monitoring directory");
        let manager = self.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            manager.observe(path, watcher, raw_rx, cancel_rx).await;
        });
        Ok(())
    }

    /// Stop observing `path` and every watched directory below it.
    /// Returns false when nothing at or under `path` was watched.
    pub fn unwatch(&self, path: &Path) -> bool {
        let removed: Vec<WatchHandle> = {
            let mut handles = self.inner.handles.lock();
            let doomed: Vec<PathBuf> = handles
                .keys()
                .filter(|k| k.starts_with(path))
                .cloned()
                .collect();
            doomed.iter().filter_map(|k| handles.remove(k)).collect()
        };
        let any_removed = !removed.is_empty();
        for handle in removed {
            // Receiver may already be gone if the observer exited on its own
            let _ = handle.cancel.send(());
            info!(dir = %handle.path.display(), "stopped monitoring directory");
        }
        any_removed
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.inner.handles.lock().contains_key(path)
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.inner.handles.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Queue handle shared with the resync walker
    pub fn events(&self) -> &EventSender {
        &self.inner.events
    }

    async fn observe(
        self,
        dir: PathBuf,
        // Held so the OS watch lives exactly as long as this task
        _watcher: RecommendedWatcher,
        mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                next = raw.recv() => match next {
                    Some(Ok(event)) => {
                        for change in translate(&event) {
                            if self.reported_by_parent(&dir, &change) {
                                continue;
                            }
                            self.forward(change).await;
                        }
                    }
                    Some(Err(e)) => error!(dir = %dir.display(), "watch error: {}", e),
                    None => break,
                },
            }
        }
        debug!(dir = %dir.display(), "observer exited");
    }

    // A watched subdirectory also sees events about itself; its parent's
    // watcher reports those, so only root watches forward them.
    fn reported_by_parent(&self, dir: &Path, change: &ChangeEvent) -> bool {
        change.path == dir && dir.parent().is_some_and(|p| self.is_watching(p))
    }

    async fn forward(&self, change: ChangeEvent) {
        let new_dir = (change.kind == ChangeKind::Create && change.path.is_dir())
            .then(|| change.path.clone());
        match change.kind {
            ChangeKind::Create if change.path.is_dir() => {
                if let Err(e) = self.watch(&change.path) {
                    warn!("watch new dir {} failed: {:#}", change.path.display(), e);
                }
            }
            ChangeKind::Remove | ChangeKind::Rename => {
                self.unwatch(&change.path);
            }
            _ => {}
        }
        if let Err(e) = self.inner.events.send(change).await {
            warn!("{:#}", e);
        }
        if let Some(dir) = new_dir {
            self.catch_up(&dir).await;
        }
    }

    // Entries that appeared inside a new directory before its watch existed
    // (`mkdir -p a/b`, a file dropped in right away) produce no event of
    // their own. Each directory is watched before it is listed, so nothing
    // falls between the scan and the watch.
    async fn catch_up(&self, dir: &Path) {
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut listing = match tokio::fs::read_dir(&current).await {
                Ok(l) => l,
                Err(e) => {
                    debug!("scan of new dir {} skipped: {}", current.display(), e);
                    continue;
                }
            };
            loop {
                let entry = match listing.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("scan of {} stopped: {}", current.display(), e);
                        break;
                    }
                };
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let path = entry.path();
                let kinds: &[ChangeKind] = if file_type.is_dir() {
                    if let Err(e) = self.watch(&path) {
                        warn!("watch new dir {} failed: {:#}", path.display(), e);
                    }
                    pending.push(path.clone());
                    &[ChangeKind::Create]
                } else if file_type.is_file() {
                    &[ChangeKind::Create, ChangeKind::Write]
                } else {
                    continue;
                };
                for kind in kinds {
                    let change = ChangeEvent::new(path.clone(), *kind);
                    if let Err(e) = self.inner.events.send(change).await {
                        warn!("{:#}", e);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::time::Duration;
    use tokio::time::timeout;

    fn raw(kind: EventKind, paths: &[&str]) -> Event {
        let mut ev = Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    fn ev(i: usize) -> ChangeEvent {
        ChangeEvent::new(format!("/srv/{}", i), ChangeKind::Write)
    }

    #[test]
    fn test_translate_kinds() {
        let cases = [
            (EventKind::Create(CreateKind::File), ChangeKind::Create),
            (
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                ChangeKind::Write,
            ),
            (
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                ChangeKind::Chmod,
            ),
            (EventKind::Remove(RemoveKind::Folder), ChangeKind::Remove),
            (
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                ChangeKind::Rename,
            ),
            (
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                ChangeKind::Create,
            ),
        ];
        for (kind, expected) in cases {
            let out = translate(&raw(kind, &["/srv/docs/a"]));
            assert_eq!(out, vec![ChangeEvent::new("/srv/docs/a", expected)]);
        }
    }

    #[test]
    fn test_translate_ignores_access_and_rename_both() {
        assert!(translate(&raw(EventKind::Access(AccessKind::Any), &["/x"])).is_empty());
        assert!(translate(&raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/x", "/y"]
        ))
        .is_empty());
    }

    #[tokio::test]
    async fn test_queue_full_blocks_producer() {
        let (tx, mut rx) = event_queue(30);
        for i in 0..30 {
            tx.send(ev(i)).await.unwrap();
        }
        assert!(timeout(Duration::from_millis(50), tx.send(ev(99)))
            .await
            .is_err());

        let tx1 = tx.clone();
        let first = tokio::spawn(async move { tx1.send(ev(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let tx2 = tx.clone();
        let second = tokio::spawn(async move { tx2.send(ev(31)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        // One slot frees exactly one pending push
        assert_eq!(rx.recv().await.unwrap(), ev(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(first.is_finished());
        assert!(!second.is_finished());

        assert_eq!(rx.recv().await.unwrap(), ev(1));
        second.await.unwrap().unwrap();
        first.await.unwrap().unwrap();

        // Nothing dropped or reordered
        for i in 2..32 {
            assert_eq!(rx.recv().await.unwrap(), ev(i));
        }
    }

    async fn next_matching(rx: &mut EventReceiver, path: &Path, kind: ChangeKind) -> bool {
        let deadline = Duration::from_secs(5);
        timeout(deadline, async {
            while let Some(e) = rx.recv().await {
                if e.path == path && e.kind == kind {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_new_subdirectory_is_watched_and_unwatched() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().canonicalize().unwrap();
        let (tx, mut rx) = event_queue(64);
        let manager = WatchManager::new(tx);
        manager.watch(&root_path).unwrap();
        assert!(manager.is_watching(&root_path));

        let sub = root_path.join("sub");
        std::fs::create_dir(&sub).unwrap();
        assert!(next_matching(&mut rx, &sub, ChangeKind::Create).await);
        assert!(manager.is_watching(&sub));

        // Events inside the new directory arrive through its own watch
        let file = sub.join("f.txt");
        std::fs::write(&file, b"hi").unwrap();
        assert!(next_matching(&mut rx, &file, ChangeKind::Create).await);

        std::fs::remove_dir_all(&sub).unwrap();
        assert!(next_matching(&mut rx, &sub, ChangeKind::Remove).await);
        assert!(!manager.is_watching(&sub));
        assert_eq!(manager.watched_paths(), vec![root_path.clone()]);
    }

    async fn poll(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Drain events until every expected (path, kind) pair has been seen
    async fn saw_all(rx: &mut EventReceiver, expected: &[(PathBuf, ChangeKind)]) -> bool {
        let mut missing: Vec<(PathBuf, ChangeKind)> = expected.to_vec();
        timeout(Duration::from_secs(5), async {
            while let Some(e) = rx.recv().await {
                missing.retain(|(p, k)| !(*p == e.path && *k == e.kind));
                if missing.is_empty() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_renamed_directory_drops_nested_watches() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().canonicalize().unwrap();
        let (tx, mut rx) = event_queue(256);
        let manager = WatchManager::new(tx);
        manager.watch(&root_path).unwrap();

        let sub = root_path.join("sub");
        let inner = sub.join("inner");
        std::fs::create_dir(&sub).unwrap();
        poll("watch on sub", || manager.is_watching(&sub)).await;
        std::fs::create_dir(&inner).unwrap();
        poll("watch on sub/inner", || manager.is_watching(&inner)).await;

        let moved = root_path.join("moved");
        std::fs::rename(&sub, &moved).unwrap();
        assert!(next_matching(&mut rx, &sub, ChangeKind::Rename).await);
        assert!(!manager.is_watching(&sub));
        assert!(!manager.is_watching(&inner));
        poll("watch on moved/inner", || manager.is_watching(&moved.join("inner"))).await;

        // The old names are free to be watched again
        std::fs::create_dir(&sub).unwrap();
        poll("watch on recreated sub", || manager.is_watching(&sub)).await;
        std::fs::create_dir(&inner).unwrap();
        poll("watch on recreated sub/inner", || manager.is_watching(&inner)).await;
        let file = inner.join("f.txt");
        std::fs::write(&file, b"again").unwrap();
        assert!(next_matching(&mut rx, &file, ChangeKind::Write).await);
    }

    #[tokio::test]
    async fn test_unwatch_covers_descendants() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/b")).unwrap();
        std::fs::create_dir_all(root.path().join("ab")).unwrap();
        let (tx, _rx) = event_queue(4);
        let manager = WatchManager::new(tx);
        for p in ["a", "a/b", "ab"] {
            manager.watch(&root.path().join(p)).unwrap();
        }
        assert!(manager.unwatch(&root.path().join("a")));
        assert_eq!(manager.watched_paths(), vec![root.path().join("ab")]);
    }

    #[tokio::test]
    async fn test_nested_tree_created_at_once_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().canonicalize().unwrap();
        let (tx, mut rx) = event_queue(256);
        let manager = WatchManager::new(tx);
        manager.watch(&root_path).unwrap();

        let a = root_path.join("a");
        let deep = a.join("b/c");
        std::fs::create_dir_all(&deep).unwrap();
        let file = a.join("b/f.txt");
        std::fs::write(&file, b"x").unwrap();

        let expected = [
            (a.clone(), ChangeKind::Create),
            (a.join("b"), ChangeKind::Create),
            (deep.clone(), ChangeKind::Create),
            (file.clone(), ChangeKind::Create),
            (file.clone(), ChangeKind::Write),
        ];
        assert!(saw_all(&mut rx, &expected).await);
        poll("watch on a/b/c", || manager.is_watching(&deep)).await;
        assert!(manager.is_watching(&a.join("b")));
    }

    #[tokio::test]
    async fn test_watch_is_idempotent_and_unwatch_unknown_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let (tx, _rx) = event_queue(4);
        let manager = WatchManager::new(tx);
        manager.watch(root.path()).unwrap();
        manager.watch(root.path()).unwrap();
        assert_eq!(manager.watched_paths().len(), 1);
        assert!(!manager.unwatch(&root.path().join("missing")));
        assert!(manager.unwatch(root.path()));
        assert!(!manager.is_watching(root.path()));
    }

    #[tokio::test]
    async fn test_watch_missing_dir_fails() {
        let root = tempfile::tempdir().unwrap();
        let (tx, _rx) = event_queue(4);
        let manager = WatchManager::new(tx);
        assert!(manager.watch(&root.path().join("missing")).is_err());
        assert!(manager.watched_paths().is_empty());
    }
}
