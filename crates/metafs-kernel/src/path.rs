//! Virtual path helpers.
//!
//! Virtual paths are `/`-separated strings. Empty components are ignored,
//! so `//a///b/` and `/a/b` name the same node.

/// Split a path into its components.
pub fn scan_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Split a path into its first component and the remainder.
///
/// Returns `None` for the root. The remainder is `None` when the head is
/// the last component, otherwise a rooted path such as `/b/c`.
pub fn split_path(path: &str) -> Option<(&str, Option<String>)> {
    let mut parts = path.split('/').filter(|c| !c.is_empty());
    let head = parts.next()?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        Some((head, None))
    } else {
        Some((head, Some(format!("/{}", rest.join("/")))))
    }
}

/// Join a directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/{name}")
}

/// True when `path` names the root.
pub fn is_root(path: &str) -> bool {
    scan_path(path).is_empty()
}

/// True when `path` is `ancestor` or lies beneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = scan_path(path);
    let ancestor = scan_path(ancestor);
    path.len() >= ancestor.len() && path[..ancestor.len()] == ancestor[..]
}
