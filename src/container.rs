//! Container model: the shape of a directory tree.
//!
//! A [`Container`] is an ordered description of a tree — directories, files
//! (with sizes and flat-stream offsets) and symlinks — produced by walking a
//! root path. Patches and signatures both embed containers, so the walk
//! order is part of the on-disk format: depth-first, children sorted by
//! name, directories before their contents.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{PatchError, Result};

/// A directory inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Path relative to the container root, forward-slash separated.
    pub path: String,
    /// Normalized mode bits.
    pub mode: u32,
}

/// A regular file inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the container root, forward-slash separated.
    pub path: String,
    /// Normalized mode bits; only the executable bit survives.
    pub mode: u32,
    /// File size in bytes.
    pub size: u64,
    /// Offset of this file in the container's flat byte stream, i.e. the
    /// sum of the sizes of all preceding files.
    pub offset: u64,
}

/// A symbolic link inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    /// Path relative to the container root, forward-slash separated.
    pub path: String,
    /// Mode bits.
    pub mode: u32,
    /// Link target, recorded verbatim and never followed.
    pub dest: String,
}

/// Ordered description of a directory tree.
///
/// Immutable once produced by [`Container::walk`]. Paths are unique within
/// their category and file offsets are monotone in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Sum of all file sizes.
    pub size: u64,
    /// Directories, parents before children.
    pub dirs: Vec<DirEntry>,
    /// Regular files in walk order.
    pub files: Vec<FileEntry>,
    /// Symlinks in walk order.
    pub symlinks: Vec<SymlinkEntry>,
}

const DIR_MODE: u32 = 0o755;
const SYMLINK_MODE: u32 = 0o777;

/// Directory names rejected by [`default_dir_filter`].
const IGNORED_DIR_PREFIXES: [&str; 3] = [".git", ".cvs", ".svn"];

/// The default directory filter: rejects names beginning with `.git`,
/// `.cvs` or `.svn`.
#[must_use]
pub fn default_dir_filter(name: &str) -> bool {
    !IGNORED_DIR_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

#[cfg(unix)]
fn normalized_file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

impl Container {
    /// The empty container: no entries, zero size.
    ///
    /// Diffing against it turns every source byte into fresh data.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Walk `root` with the default directory filter.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::PathNotFound`] if `root` does not exist, or
    /// [`PatchError::Unreadable`] for entries that cannot be inspected.
    pub fn walk(root: impl AsRef<Path>) -> Result<Self> {
        Self::walk_with(root, default_dir_filter)
    }

    /// Walk `root`, skipping directories rejected by `filter`.
    ///
    /// The filter sees directory names only; rejected directories are not
    /// descended into. Symlinks are recorded with their targets and never
    /// followed.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::PathNotFound`] if `root` does not exist, or
    /// [`PatchError::Unreadable`] for entries that cannot be inspected.
    pub fn walk_with(root: impl AsRef<Path>, filter: impl Fn(&str) -> bool) -> Result<Self> {
        let root = root.as_ref();
        let meta = fs::symlink_metadata(root).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PatchError::PathNotFound(root.to_path_buf())
            } else {
                PatchError::io(root, e)
            }
        })?;
        if !meta.is_dir() {
            return Err(PatchError::Unreadable {
                path: root.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "not a directory",
                ),
            });
        }

        let mut container = Self::empty();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || filter(&entry.file_name().to_string_lossy())
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                PatchError::Unreadable {
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::ErrorKind::Other.into()),
                }
            })?;

            let rel = relative_path(root, entry.path())?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                container.dirs.push(DirEntry {
                    path: rel,
                    mode: DIR_MODE,
                });
            } else if file_type.is_symlink() {
                let dest = fs::read_link(entry.path())
                    .map_err(|e| PatchError::io(entry.path(), e))?;
                container.symlinks.push(SymlinkEntry {
                    path: rel,
                    mode: SYMLINK_MODE,
                    dest: dest.to_string_lossy().replace('\\', "/"),
                });
            } else {
                let meta = entry.metadata().map_err(|e| PatchError::Unreadable {
                    path: entry.path().to_path_buf(),
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::ErrorKind::Other.into()),
                })?;
                let size = meta.len();
                container.files.push(FileEntry {
                    path: rel,
                    mode: normalized_file_mode(&meta),
                    size,
                    offset: container.size,
                });
                container.size += size;
            }
        }

        Ok(container)
    }

    /// True if the container describes nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty() && self.symlinks.is_empty()
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} bytes in {} files, {} dirs, {} symlinks",
            self.size,
            self.files.len(),
            self.dirs.len(),
            self.symlinks.len()
        )
    }
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| PatchError::Unreadable {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "entry escapes walk root",
        ),
    })?;
    match rel.to_str() {
        Some(s) => Ok(s.replace('\\', "/")),
        None => Err(PatchError::Unreadable {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 path"),
        }),
    }
}
