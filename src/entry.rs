//! Entry kinds and path helpers shared by the local and remote views.

use std::fmt;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}
impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}
impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a path relative to the sync root onto the device, under `root`.
pub fn remote_path(root: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    match (root.trim_end_matches('/'), relative) {
        ("", "") => "/".into(),
        (root, "") => root.into(),
        (root, relative) => format!("{}/{}", root, relative),
    }
}

/// A remote path in its canonical form: rooted, without empty or `.`
/// components, so without a trailing or doubled `/`.
pub fn rooted(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// The parent of a rooted remote path, `None` for `/` itself.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// Number of components of a rooted path; `/` has none.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|c| !c.is_empty()).count()
}

/// Whether `path` lies strictly below `dir`.
pub fn is_under(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn remote_paths() {
    assert_eq!(remote_path("/", "main.py"), "/main.py");
    assert_eq!(remote_path("/", "alarm/clock.py"), "/alarm/clock.py");
    assert_eq!(remote_path("/lib", "alarm"), "/lib/alarm");
    assert_eq!(remote_path("/lib", ""), "/lib");
    assert_eq!(remote_path("/", ""), "/");
}

#[test]
fn rooted_paths() {
    assert_eq!(rooted(""), "/");
    assert_eq!(rooted("/"), "/");
    assert_eq!(rooted("alarm/"), "/alarm");
    assert_eq!(rooted("//lib//alarm/./clock.py"), "/lib/alarm/clock.py");
    assert_eq!(rooted("/main.py"), "/main.py");
}

#[test]
fn parents() {
    assert_eq!(parent("/"), None);
    assert_eq!(parent("/main.py"), Some("/"));
    assert_eq!(parent("/alarm/clock.py"), Some("/alarm"));
}

#[test]
fn depths_and_nesting() {
    assert_eq!(depth("/"), 0);
    assert_eq!(depth("/alarm"), 1);
    assert_eq!(depth("/alarm/clock.py"), 2);
    assert!(is_under("/alarm/clock.py", "/alarm"));
    assert!(is_under("/alarm", "/"));
    assert!(!is_under("/alarmist.py", "/alarm"));
    assert!(!is_under("/alarm", "/alarm"));
    assert!(!is_under("/", "/"));
}
