//! Computing the operations that bring the board in line with the local tree.
//!
//! A [`SyncPlan`] is derived once per session from the local entries and a
//! snapshot of the remote tree. Its steps are ordered so that they can be run
//! strictly in sequence:
//!
//! 1. `MkDir` for every missing directory, parents before children,
//! 2. `PutFile` for every new or changed file, in the local order,
//! 3. `Remove` for remote leftovers (only when pruning), files first, then
//!    directories deepest first.
//!
//! A file whose remote size and SHA-256 already match is skipped, which makes
//! a second sync of an unchanged tree a no-op.

use std::{collections::HashMap, fmt};

use log::debug;

use crate::{
    entry::{depth, is_under, parent, remote_path, EntryKind},
    error::{Error, Result},
    local::LocalEntry,
    remote_fs::RemoteEntry,
};

// =============================================================================
// Public Interface
// =============================================================================

/// State of the remote tree under the sync root before the plan runs.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    /// Whether the sync root itself exists on the board.
    pub root_exists: bool,
    /// Everything below the root.
    pub entries: Vec<RemoteEntry>,
}

#[derive(Clone, Eq, PartialEq)]
pub enum Step {
    MkDir(String),
    PutFile {
        path: String,
        content: Vec<u8>,
        digest: Option<String>,
    },
    Remove {
        path: String,
        kind: EntryKind,
    },
}
impl Step {
    pub fn path(&self) -> &str {
        match self {
            Step::MkDir(path) => path,
            Step::PutFile { path, .. } => path,
            Step::Remove { path, .. } => path,
        }
    }
}
impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::MkDir(path) => write!(f, "mkdir {}", path),
            Step::PutFile { path, content, .. } => {
                write!(f, "put {} ({} bytes)", path, content.len())
            }
            Step::Remove {
                path,
                kind: EntryKind::File,
            } => write!(f, "rm {}", path),
            Step::Remove {
                path,
                kind: EntryKind::Directory,
            } => write!(f, "rmdir {}", path),
        }
    }
}
impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A difference between what the plan meant to produce and what the board
/// reports after it ran.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Mismatch {
    pub path: String,
    pub expected: String,
    pub found: String,
}
impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.path, self.expected, self.found
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    steps: Vec<Step>,
    unchanged: usize,
}
impl SyncPlan {
    /// Compare `local` (paths relative to the sync root) with `remote` (under
    /// `remote_root`) and produce the ordered steps.
    pub fn compute(
        local: &[LocalEntry],
        remote: &RemoteSnapshot,
        remote_root: &str,
        prune: bool,
    ) -> Result<Self> {
        let existing: HashMap<&str, &RemoteEntry> = remote
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e))
            .collect();

        // Directories the board must have, in order of first appearance.
        let mut wanted_dirs: Vec<String> = Vec::new();
        let want_dir = |dir: &str, wanted: &mut Vec<String>| {
            if !wanted.iter().any(|d| d == dir) {
                wanted.push(dir.to_owned());
            }
        };
        if !remote.root_exists {
            for dir in ancestors(remote_root) {
                want_dir(&dir, &mut wanted_dirs);
            }
        }
        for entry in local {
            let path = remote_path(remote_root, &entry.path);
            let dir = match entry.kind {
                EntryKind::Directory => Some(path.as_str()),
                EntryKind::File => parent(&path),
            };
            if let Some(dir) = dir {
                for ancestor in ancestors(dir) {
                    if is_under(&ancestor, remote_root) {
                        want_dir(&ancestor, &mut wanted_dirs);
                    }
                }
            }
        }
        // Stable: same-depth directories keep their local order.
        wanted_dirs.sort_by_key(|d| depth(d));

        let mut steps = Vec::new();
        for dir in &wanted_dirs {
            match existing.get(dir.as_str()) {
                Some(e) if e.kind == EntryKind::Directory => {}
                Some(_) => return Err(conflict(dir, EntryKind::Directory, EntryKind::File)),
                None => steps.push(Step::MkDir(dir.clone())),
            }
        }

        let mut unchanged = 0;
        for entry in local.iter().filter(|e| e.kind == EntryKind::File) {
            let path = remote_path(remote_root, &entry.path);
            match existing.get(path.as_str()) {
                Some(e) if e.kind == EntryKind::Directory => {
                    return Err(conflict(&path, EntryKind::File, EntryKind::Directory))
                }
                Some(e) if same_content(entry, e) => {
                    debug!("{} is up to date", path);
                    unchanged += 1;
                }
                _ => steps.push(Step::PutFile {
                    path,
                    content: entry.content.clone(),
                    digest: entry.digest.clone(),
                }),
            }
        }

        if prune {
            let mut kept: Vec<String> = local
                .iter()
                .map(|e| remote_path(remote_root, &e.path))
                .collect();
            kept.extend(wanted_dirs.iter().cloned());

            let mut leftovers: Vec<&RemoteEntry> = remote
                .entries
                .iter()
                .filter(|e| is_under(&e.path, remote_root))
                .filter(|e| !kept.iter().any(|k| k == &e.path))
                .collect();
            // Files first, then directories from the deepest up.
            leftovers.sort_by_key(|e| match e.kind {
                EntryKind::File => (0, 0),
                EntryKind::Directory => (1, usize::MAX - depth(&e.path)),
            });
            steps.extend(leftovers.into_iter().map(|e| Step::Remove {
                path: e.path.clone(),
                kind: e.kind,
            }));
        }

        Ok(SyncPlan { steps, unchanged })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Files left alone because the board already has the same content.
    pub fn unchanged(&self) -> usize {
        self.unchanged
    }

    /// Total payload the plan writes.
    pub fn bytes(&self) -> u64 {
        self.steps
            .iter()
            .map(|s| match s {
                Step::PutFile { content, .. } => content.len() as u64,
                _ => 0,
            })
            .sum()
    }

    /// Check a fresh listing of everything below `remote_root` against the
    /// outcome of every step. The root and its ancestors never appear in such
    /// a listing; a successful one is proof enough that they exist.
    pub fn verify(&self, remote_root: &str, remote: &[RemoteEntry]) -> Vec<Mismatch> {
        let found: HashMap<&str, &RemoteEntry> =
            remote.iter().map(|e| (e.path.as_str(), e)).collect();
        let mut mismatches = Vec::new();
        for step in &self.steps {
            let path = step.path();
            let entry = found.get(path);
            let (expected, actual) = match (step, entry) {
                (Step::MkDir(_), _) if !is_under(path, remote_root) => continue,
                (Step::MkDir(_), Some(e)) if e.kind == EntryKind::Directory => continue,
                (Step::MkDir(_), _) => ("a directory".to_owned(), describe(entry)),
                (Step::PutFile { content, digest, .. }, Some(e))
                    if e.kind == EntryKind::File
                        && e.size == Some(content.len() as u64)
                        && (e.digest.is_none() || e.digest == *digest) =>
                {
                    continue
                }
                (Step::PutFile { content, .. }, _) => (
                    format!("a file of {} bytes", content.len()),
                    describe(entry),
                ),
                (Step::Remove { .. }, None) => continue,
                (Step::Remove { .. }, Some(_)) => ("nothing".to_owned(), describe(entry)),
            };
            mismatches.push(Mismatch {
                path: path.to_owned(),
                expected,
                found: actual,
            });
        }
        mismatches
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// `path` and every directory above it, outermost first, without `/`.
fn ancestors(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir == "/" {
            break;
        }
        dirs.push(dir.to_owned());
        current = parent(dir);
    }
    dirs.reverse();
    dirs
}

/// Content is only known to match when the board could hash it.
fn same_content(local: &LocalEntry, remote: &RemoteEntry) -> bool {
    remote.kind == EntryKind::File
        && remote.size == Some(local.size())
        && remote.digest.is_some()
        && remote.digest == local.digest
}

fn describe(entry: Option<&&RemoteEntry>) -> String {
    match entry {
        None => "nothing".into(),
        Some(e) if e.kind == EntryKind::Directory => "a directory".into(),
        Some(e) => match (&e.size, &e.digest) {
            (Some(size), Some(_)) => format!("a file of {} bytes with another digest", size),
            (Some(size), None) => format!("a file of {} bytes", size),
            _ => "a file".into(),
        },
    }
}

fn conflict(path: &str, local: EntryKind, remote: EntryKind) -> Error {
    Error::Conflict {
        path: path.to_owned(),
        local: local.as_str(),
        remote: remote.as_str(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
