use std::{
    collections::HashSet,
    fs::Metadata,
    path::{Path, PathBuf},
    time::SystemTime,
};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::{
    config::IndexerConfig,
    error::{Error, Result},
};

/// A file seen on disk, with just enough metadata for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Last modification time as whole seconds since the Unix epoch.
    pub mtime: u64,
    pub size: u64,
}

/// Direct contents of one directory, both lists sorted by path.
#[derive(Debug, Default)]
pub struct DirListing {
    pub files: Vec<ScannedFile>,
    pub dirs: Vec<PathBuf>,
}

/// Every eligible file and directory under a root.
#[derive(Debug, Default)]
pub struct TreeScan {
    pub files: Vec<ScannedFile>,
    /// Includes the root itself.
    pub dirs: Vec<PathBuf>,
    /// Subdirectories that exist but could not be listed. Their contents are
    /// unknown, so nothing below them may be treated as deleted.
    pub unreadable: Vec<PathBuf>,
}

/// Bookkeeping files operating systems drop into folders.
const SYSTEM_FILES: &[&str] = &[".DS_Store", ".localized", "Thumbs.db", "desktop.ini", "Icon\r"];

/// Decides which directory entries are noise.
#[derive(Debug, Clone)]
pub struct PathFilter {
    skip_dirs: GlobSet,
    skip_extensions: HashSet<String>,
    include_hidden: bool,
}

impl PathFilter {
    pub fn from_config(config: &IndexerConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.skip_dirs {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Config(format!("invalid skip_dirs pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let skip_dirs = builder
            .build()
            .map_err(|e| Error::Config(format!("invalid skip_dirs: {e}")))?;

        Ok(Self {
            skip_dirs,
            skip_extensions: config
                .skip_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            include_hidden: config.include_hidden,
        })
    }

    fn is_hidden(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }

    pub fn skip_dir(&self, name: &str) -> bool {
        self.is_hidden(name) || self.skip_dirs.is_match(name)
    }

    pub fn skip_file(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if self.is_hidden(&name)
            || SYSTEM_FILES.iter().any(|s| s.eq_ignore_ascii_case(&name))
        {
            return true;
        }
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.skip_extensions.contains(&ext))
    }

    /// Whether a scan of `root` would leave `path` out, either because a
    /// directory on the way there is skipped or because the entry itself is.
    /// Paths outside `root` are always excluded. The entry may no longer
    /// exist, so it is checked against both the directory and file rules.
    pub fn excludes(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return true;
        };
        let mut names: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some(entry) = names.pop() else {
            return false;
        };
        names.iter().any(|dir| self.skip_dir(dir))
            || self.skip_dir(&entry)
            || self.skip_file(path)
    }
}

/// Whole-second modification time, so platform timestamp jitter below one
/// second never registers as a change.
pub fn mtime_secs(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// List the direct, non-noise children of `dir`.
///
/// Failing to read `dir` itself is an error; entries that cannot be
/// inspected (permission denied, broken symlinks) are skipped and logged.
/// Symlinked files are followed; symlinked directories are not, which keeps
/// the walk free of cycles.
pub fn list_dir(dir: &Path, filter: &PathFilter) -> Result<DirListing> {
    let mut listing = DirListing::default();

    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping entry");
                continue;
            }
        };

        if file_type.is_dir() {
            if !filter.skip_dir(&name) {
                listing.dirs.push(path);
            }
            continue;
        }

        if filter.skip_file(&path) {
            continue;
        }

        // Follows symlinks.
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping broken entry");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        listing.files.push(ScannedFile {
            mtime: mtime_secs(&metadata),
            size: metadata.len(),
            path,
        });
    }

    listing.files.sort_by(|a, b| a.path.cmp(&b.path));
    listing.dirs.sort();
    Ok(listing)
}

/// Recursively collect every eligible file and directory under `root`
/// without reading any file contents.
///
/// Only an unreadable `root` is an error; unreadable subdirectories are
/// logged and reported in [`TreeScan::unreadable`].
pub fn scan_tree(root: &Path, filter: &PathFilter) -> Result<TreeScan> {
    let mut scan = TreeScan::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let listing = match list_dir(&dir, filter) {
            Ok(l) => l,
            Err(e) if dir != root => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                scan.unreadable.push(dir);
                continue;
            }
            Err(e) => return Err(e),
        };
        scan.files.extend(listing.files);
        pending.extend(listing.dirs);
        scan.dirs.push(dir);
    }

    scan.files.sort_by(|a, b| a.path.cmp(&b.path));
    scan.dirs.sort();
    scan.unreadable.sort();
    Ok(scan)
}

/// Whether `path` is one of `dirs` or lies below one of them.
pub fn is_within(path: &Path, dirs: &[PathBuf]) -> bool {
    dirs.iter().any(|dir| path.starts_with(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PathFilter {
        PathFilter::from_config(&IndexerConfig::default()).unwrap()
    }

    #[test]
    fn lists_files_and_dirs_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("z.txt"), "z").unwrap();
        std::fs::write(tmp.path().join("a.pdf"), "a").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let listing = list_dir(tmp.path(), &filter()).unwrap();
        let names: Vec<_> = listing
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.pdf", "z.txt"]);
        assert_eq!(listing.dirs, vec![tmp.path().join("sub")]);
        assert_eq!(listing.files[1].size, 1);
        assert!(listing.files[0].mtime > 0);
    }

    #[test]
    fn excludes_follows_every_component() {
        let f = filter();
        let root = Path::new("/home/me");
        assert!(!f.excludes(root, Path::new("/home/me")));
        assert!(!f.excludes(root, Path::new("/home/me/docs/lease.pdf")));
        assert!(!f.excludes(root, Path::new("/home/me/docs/old")));
        assert!(f.excludes(root, Path::new("/home/me/code/node_modules/x/index.js")));
        assert!(f.excludes(root, Path::new("/home/me/.config/app.toml")));
        assert!(f.excludes(root, Path::new("/home/me/docs/Thumbs.db")));
        assert!(f.excludes(root, Path::new("/home/me/music/song.mp3")));
        assert!(f.excludes(root, Path::new("/home/me/code/target")));
        assert!(f.excludes(root, Path::new("/etc/passwd")));
    }

    #[test]
    fn skips_noise_dirs_hidden_entries_and_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        for dir in ["node_modules", ".git", "Safari.app", "docs"] {
            std::fs::create_dir(tmp.path().join(dir)).unwrap();
        }
        std::fs::write(tmp.path().join(".DS_Store"), "x").unwrap();
        std::fs::write(tmp.path().join("archive.ZIP"), "x").unwrap();
        std::fs::write(tmp.path().join("thumbs.db"), "x").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "x").unwrap();

        let listing = list_dir(tmp.path(), &filter()).unwrap();
        assert_eq!(listing.dirs, vec![tmp.path().join("docs")]);
        assert_eq!(listing.files.len(), 1);
        assert!(listing.files[0].path.ends_with("notes.md"));
    }

    #[test]
    fn include_hidden_walks_dotfiles() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".profile"), "x").unwrap();
        std::fs::write(tmp.path().join(".DS_Store"), "x").unwrap();
        let config = IndexerConfig {
            include_hidden: true,
            ..Default::default()
        };
        let filter = PathFilter::from_config(&config).unwrap();
        assert_eq!(list_dir(tmp.path(), &filter).unwrap().files.len(), 1);
    }

    #[test]
    fn scan_tree_recurses() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("deep.txt"), "deep").unwrap();
        std::fs::write(tmp.path().join("top.txt"), "top").unwrap();

        let scan = scan_tree(tmp.path(), &filter()).unwrap();
        assert_eq!(scan.files.len(), 2);
        assert_eq!(scan.dirs.len(), 3);
        assert_eq!(scan.dirs[0], tmp.path());
    }

    #[test]
    fn is_within_matches_whole_components() {
        let dirs = vec![PathBuf::from("/r/private")];
        assert!(is_within(Path::new("/r/private"), &dirs));
        assert!(is_within(Path::new("/r/private/tax/2023.pdf"), &dirs));
        assert!(!is_within(Path::new("/r/private-notes.txt"), &dirs));
        assert!(!is_within(Path::new("/r"), &dirs));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectories_are_reported() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let locked = tmp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("secret.txt"), "x").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users can list the directory anyway.
        let readable = std::fs::read_dir(&locked).is_ok();
        let scan = scan_tree(tmp.path(), &filter());
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        let scan = scan.unwrap();
        if readable {
            assert!(scan.unreadable.is_empty());
            return;
        }

        assert_eq!(scan.unreadable, vec![locked.clone()]);
        assert!(!scan.dirs.contains(&locked));
        assert!(scan.files.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(scan_tree(&tmp.path().join("nope"), &filter()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlinks_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            tmp.path().join("missing.txt"),
            tmp.path().join("link.txt"),
        )
        .unwrap();
        std::fs::write(tmp.path().join("real.txt"), "x").unwrap();

        let listing = list_dir(tmp.path(), &filter()).unwrap();
        assert_eq!(listing.files.len(), 1);
    }

    #[test]
    fn invalid_glob_is_a_config_error() {
        let config = IndexerConfig {
            skip_dirs: vec!["[".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            PathFilter::from_config(&config),
            Err(Error::Config(_))
        ));
    }
}
