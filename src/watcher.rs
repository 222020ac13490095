//! Keeping the index current while files change.
//!
//! File system events are debounced by notify-debouncer-full, filtered with
//! the same rules a scan applies and collapsed to one change per path, the
//! latest event winning. Every batch that survives triggers an incremental
//! pass; the pass itself rediscovers what changed, so a batch only has to
//! say *that* something relevant happened.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};

use notify_debouncer_full::{
    DebounceEventResult,
    Debouncer,
    RecommendedCache,
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode},
};
use serde::Serialize;

use crate::{
    error::Result,
    indexer::{IndexReport, Indexer},
    walker::{PathFilter, is_within},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    fn from_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(Self::Created),
            EventKind::Modify(_) => Some(Self::Modified),
            EventKind::Remove(_) => Some(Self::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Keep only the last change seen for each path, ordered by path.
pub fn coalesce(changes: impl IntoIterator<Item = PathChange>) -> Vec<PathChange> {
    let mut latest: BTreeMap<PathBuf, ChangeKind> = BTreeMap::new();
    for change in changes {
        latest.insert(change.path, change.kind);
    }
    latest
        .into_iter()
        .map(|(path, kind)| PathChange { path, kind })
        .collect()
}

/// Watches a tree recursively and hands out debounced batches of relevant
/// changes.
pub struct TreeWatcher {
    root: PathBuf,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    batches: mpsc::Receiver<Vec<PathChange>>,
}

impl TreeWatcher {
    /// Start watching `root`. Changes the filter excludes, and anything under
    /// `ignored` (such as a data directory inside the tree), never show up in
    /// a batch.
    pub fn start(
        root: &Path,
        debounce: Duration,
        filter: PathFilter,
        ignored: Vec<PathBuf>,
    ) -> Result<Self> {
        let root = root.canonicalize()?;
        let (tx, rx) = mpsc::channel();

        let watched = root.clone();
        let mut debouncer = new_debouncer(
            debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let changes = events.iter().flat_map(|event| {
                        let kind = ChangeKind::from_event(&event.kind);
                        event.paths.iter().filter_map(move |path| {
                            Some(PathChange {
                                path: path.clone(),
                                kind: kind?,
                            })
                        })
                    });
                    let batch = coalesce(changes.filter(|c| {
                        !filter.excludes(&watched, &c.path) && !is_within(&c.path, &ignored)
                    }));
                    if batch.is_empty() {
                        return;
                    }
                    tracing::debug!(changes = batch.len(), "file watcher batch");
                    if tx.send(batch).is_err() {
                        tracing::debug!("file watcher receiver dropped");
                    }
                }
                Err(errors) => {
                    for e in errors {
                        tracing::warn!(error = %e, "file watcher error");
                    }
                }
            },
        )?;
        debouncer.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(
            root = %root.display(),
            debounce_ms = debounce.as_millis() as u64,
            "watching directory"
        );

        Ok(Self {
            root,
            _debouncer: debouncer,
            batches: rx,
        })
    }

    /// The canonical root being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Block until the next batch; `None` once the watcher has stopped.
    pub fn next_batch(&self) -> Option<Vec<PathChange>> {
        self.batches.recv().ok()
    }

    pub fn next_batch_timeout(&self, timeout: Duration) -> Option<Vec<PathChange>> {
        self.batches.recv_timeout(timeout).ok()
    }
}

/// Bring the index up to date, then re-index after every batch of changes
/// until the watcher stops. `on_pass` sees each report with the batch that
/// caused it (empty for the initial pass). A failed re-index is logged and
/// the watch goes on; only the initial pass can fail the call.
pub fn watch_and_index(
    indexer: &Indexer<'_>,
    watcher: &TreeWatcher,
    mut on_pass: impl FnMut(&IndexReport, &[PathChange]),
) -> Result<()> {
    let report = indexer.index_from_root(watcher.root())?;
    on_pass(&report, &[]);

    while let Some(batch) = watcher.next_batch() {
        match indexer.index_from_root(watcher.root()) {
            Ok(report) => on_pass(&report, &batch),
            Err(e) => tracing::warn!(error = %e, "re-index after file changes failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use notify_debouncer_full::notify::event::{CreateKind, ModifyKind, RemoveKind};

    use super::*;
    use crate::config::IndexerConfig;

    fn change(path: &str, kind: ChangeKind) -> PathChange {
        PathChange {
            path: PathBuf::from(path),
            kind,
        }
    }

    #[test]
    fn later_events_override_earlier_ones() {
        let batch = coalesce([
            change("/r/b.txt", ChangeKind::Created),
            change("/r/a.txt", ChangeKind::Modified),
            change("/r/b.txt", ChangeKind::Modified),
            change("/r/a.txt", ChangeKind::Removed),
        ]);
        assert_eq!(
            batch,
            vec![
                change("/r/a.txt", ChangeKind::Removed),
                change("/r/b.txt", ChangeKind::Modified),
            ]
        );
    }

    #[test]
    fn only_content_events_count() {
        assert_eq!(
            ChangeKind::from_event(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            ChangeKind::from_event(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            ChangeKind::from_event(&EventKind::Remove(RemoveKind::Folder)),
            Some(ChangeKind::Removed)
        );
        assert_eq!(ChangeKind::from_event(&EventKind::Any), None);
    }

    #[test]
    fn writes_arrive_as_a_batch() {
        let tree = tempfile::tempdir().unwrap();
        let filter = PathFilter::from_config(&IndexerConfig::default()).unwrap();
        let watcher =
            TreeWatcher::start(tree.path(), Duration::from_millis(100), filter, Vec::new())
                .unwrap();

        std::fs::write(tree.path().join("groceries.txt"), "milk and eggs").unwrap();
        let batch = watcher
            .next_batch_timeout(Duration::from_secs(10))
            .expect("no batch after writing a file");
        assert!(batch.iter().any(|c| c.path.ends_with("groceries.txt")));
        assert!(batch.iter().all(|c| c.path.starts_with(watcher.root())));
    }
}
