use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use crate::walker::{ScannedFile, is_within};

/// Outcome of comparing a fresh scan against the stored index.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// On disk but not in the index.
    pub added: Vec<ScannedFile>,
    /// In both, with a different modification time.
    pub updated: Vec<ScannedFile>,
    /// In the index but gone from disk.
    pub removed: Vec<String>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this many changes warrant a full rebuild instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use deskindex::incremental::ChangeSet;
    ///
    /// let changes = ChangeSet {
    ///     removed: vec!["/a".into(), "/b".into()],
    ///     ..Default::default()
    /// };
    /// assert!(!changes.exceeds(4, 0.5));
    /// assert!(changes.exceeds(3, 0.5));
    /// ```
    pub fn exceeds(&self, stored_files: usize, ratio: f32) -> bool {
        self.len() as f32 > stored_files as f32 * ratio
    }

    /// Forget removals of files below `dirs`, which could not be listed and
    /// so say nothing about what they contain.
    pub fn ignore_removals_under(&mut self, dirs: &[PathBuf]) {
        if dirs.is_empty() {
            return;
        }
        self.removed.retain(|path| !is_within(Path::new(path), dirs));
    }
}

/// Diff scanned files against stored `path -> mtime` stamps.
///
/// Both sides use whole seconds. Outputs are sorted by path.
pub fn diff_tree(
    stored: &HashMap<String, u64>,
    scanned: &[ScannedFile],
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(scanned.len());

    for file in scanned {
        let path = file.path.to_string_lossy();
        match stored.get(path.as_ref()) {
            None => changes.added.push(file.clone()),
            Some(&mtime) if mtime != file.mtime => {
                changes.updated.push(file.clone())
            }
            Some(_) => {}
        }
        if let Some((key, _)) = stored.get_key_value(path.as_ref()) {
            seen.insert(key.as_str());
        }
    }

    changes.removed = stored
        .keys()
        .filter(|path| !seen.contains(path.as_str()))
        .cloned()
        .collect();

    changes.added.sort_by(|a, b| a.path.cmp(&b.path));
    changes.updated.sort_by(|a, b| a.path.cmp(&b.path));
    changes.removed.sort();
    changes
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn scanned(path: &str, mtime: u64) -> ScannedFile {
        ScannedFile {
            path: PathBuf::from(path),
            mtime,
            size: 1,
        }
    }

    fn stamps(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries.iter().map(|(p, m)| (p.to_string(), *m)).collect()
    }

    #[test]
    fn all_new_files() {
        let diff = diff_tree(&HashMap::new(), &[scanned("/r/a", 1), scanned("/r/b", 2)]);
        assert_eq!(diff.added.len(), 2);
        assert!(diff.updated.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn unchanged_files() {
        let diff = diff_tree(&stamps(&[("/r/a", 100)]), &[scanned("/r/a", 100)]);
        assert!(diff.is_empty());
    }

    #[test]
    fn changed_file_detected() {
        let diff = diff_tree(&stamps(&[("/r/a", 100)]), &[scanned("/r/a", 200)]);
        assert_eq!(diff.updated, vec![scanned("/r/a", 200)]);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn deleted_file_detected() {
        let diff = diff_tree(&stamps(&[("/r/a", 100), ("/r/b", 1)]), &[scanned("/r/b", 1)]);
        assert_eq!(diff.removed, vec!["/r/a".to_string()]);
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn removals_under_unreadable_dirs_are_ignored() {
        let stored = stamps(&[
            ("/r/private/a.txt", 1),
            ("/r/private/deep/b.txt", 1),
            ("/r/private-c.txt", 1),
            ("/r/d.txt", 1),
        ]);
        let mut diff = diff_tree(&stored, &[]);
        assert_eq!(diff.removed.len(), 4);

        diff.ignore_removals_under(&[PathBuf::from("/r/private")]);
        assert_eq!(
            diff.removed,
            vec!["/r/d.txt".to_string(), "/r/private-c.txt".to_string()]
        );
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let changes = ChangeSet {
            added: vec![scanned("/a", 1)],
            ..Default::default()
        };
        assert!(!changes.exceeds(2, 0.5));
        assert!(changes.exceeds(1, 0.5));
        assert!(changes.exceeds(0, 0.5));
    }
}
