//! Slash-separated path helpers shared by every backend.
//!
//! Backend paths always use `/` as separator: `user/repo/branch/sub/file`
//! for versioned stores and absolute paths for the local filesystem.

use crate::error::{Error, Result};

/// Join `rel` onto `base`.
pub fn join(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return rel.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

/// Split a path into `(parent, final component)`.
///
/// `"a/b/c"` gives `("a/b", "c")`, `"/c"` gives `("/", "c")` and `"c"` gives `("", "c")`.
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) if path.starts_with('/') => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

pub fn parent(path: &str) -> &str {
    split(path).0
}

pub fn file_name(path: &str) -> &str {
    split(path).1
}

/// Remove trailing separators, keeping a lone `/`.
pub fn strip_trailing_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

pub fn has_trailing_slash(path: &str) -> bool {
    path.len() > 1 && path.ends_with('/')
}

pub fn has_wildcard(path: &str) -> bool {
    path.contains('*') || path.contains('?')
}

/// Path of `path` relative to `root`, if `path` lies under it.
pub fn relative_to<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let root = strip_trailing_slash(root);
    if root.is_empty() {
        return Some(path.trim_start_matches('/'));
    }
    if root == "/" {
        return path.strip_prefix('/');
    }
    path.strip_prefix(root)?.strip_prefix('/')
}

/// Whether one of `a` and `b` is the other or an ancestor of it.
pub fn overlaps(a: &str, b: &str) -> bool {
    let under = |inner: &str, outer: &str| {
        outer.is_empty() || inner.strip_prefix(outer).is_some_and(|rest| rest.starts_with('/'))
    };
    a == b || under(a, b) || under(b, a)
}

/// Reject relative paths that are empty or contain `.`, `..` or empty components.
pub fn validate_relative(rel: &str) -> Result<()> {
    if rel.is_empty() {
        return Err(Error::validation("empty relative path"));
    }
    for component in rel.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::validation(format!(
                "illegal path component {:?} in {}",
                component, rel
            )));
        }
    }
    Ok(())
}
