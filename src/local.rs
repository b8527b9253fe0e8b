//! The local side of a sync: files and directories under a root directory.

use std::{
    collections::HashSet,
    fs, io,
    path::{Component, Path, PathBuf},
};

use log::{debug, trace};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::{
    entry::EntryKind,
    error::{Error, Result},
};

/// A file or directory to be mirrored on the board.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LocalEntry {
    /// Path relative to the sync root, `/` separated, without leading `/`.
    pub path: String,
    pub kind: EntryKind,
    /// File content; empty for directories.
    pub content: Vec<u8>,
    /// SHA-256 of the content as lowercase hex; `None` for directories.
    pub digest: Option<String>,
}
impl LocalEntry {
    pub fn file(path: impl Into<String>, content: Vec<u8>) -> Self {
        let digest = Some(digest(&content));
        LocalEntry {
            path: path.into(),
            kind: EntryKind::File,
            content,
            digest,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        LocalEntry {
            path: path.into(),
            kind: EntryKind::Directory,
            content: Vec::new(),
            digest: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// SHA-256 of `content` as lowercase hex, the same form the board reports.
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Collect the entries to sync under `root`.
///
/// Each of `paths` is relative to `root` and may name a file or a directory;
/// directories are walked recursively. With no `paths`, everything under
/// `root` is taken. Entries come out in the order the paths were given, a
/// directory before its content, siblings sorted by name. Hidden entries and
/// `__pycache__` directories are skipped while walking.
///
/// Anything that cannot be walked or read fails the whole scan, as does a
/// name that is not valid UTF-8.
pub fn scan(root: &Path, paths: &[PathBuf]) -> Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    if paths.is_empty() {
        walk(root, root, 1, &mut entries)?;
    } else {
        for path in paths {
            walk(root, &root.join(path), 0, &mut entries)?;
        }
    }

    // The same path given twice, or a file given along with its directory.
    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert(e.path.clone()));
    debug!("{} local entries under {}", entries.len(), root.display());
    Ok(entries)
}

// =============================================================================
// Private stuff
// =============================================================================

fn walk(
    root: &Path,
    start: &Path,
    min_depth: usize,
    entries: &mut Vec<LocalEntry>,
) -> Result<()> {
    let walker = WalkDir::new(start)
        .follow_links(true)
        .min_depth(min_depth)
        .sort_by_file_name()
        .into_iter()
        // A path named explicitly is taken even if it would be skipped.
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let path = entry.path();
        if entry.file_name().to_str().is_none() {
            return Err(local_error(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
            ));
        }

        let relative = relative_path(root, path)?;
        if entry.file_type().is_dir() {
            trace!("dir  {}", relative);
            if !relative.is_empty() {
                entries.push(LocalEntry::directory(relative));
            }
        } else {
            trace!("file {}", relative);
            let content = fs::read(path).map_err(|source| local_error(path, source))?;
            entries.push(LocalEntry::file(relative, content));
        }
    }
    Ok(())
}

fn is_skipped(entry: &DirEntry) -> bool {
    match entry.file_name().to_str() {
        Some(name) => name.starts_with('.') || name == "__pycache__",
        // Reported by the walk loop.
        None => false,
    }
}

/// `path` relative to `root`, `/` separated. Paths escaping the root are
/// refused.
fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| Error::Local {
        path: path.display().to_string(),
        source: io::Error::new(
            io::ErrorKind::InvalidInput,
            "path is not under the sync root",
        ),
    })?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(Error::Local {
                    path: path.display().to_string(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "path escapes the sync root",
                    ),
                })
            }
        }
    }
    Ok(parts.join("/"))
}

fn local_error(path: &Path, source: io::Error) -> Error {
    Error::Local {
        path: path.display().to_string(),
        source,
    }
}

fn walk_error(err: walkdir::Error) -> Error {
    let path = err
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let message = err.to_string();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message));
    Error::Local { path, source }
}

// =============================================================================
// Unit Tests
// =============================================================================
