//! Wire-path handling.
//!
//! Paths on the wire are UTF-8 strings with `/` separators. Everything in
//! the core operates on the normalised form: absolute, no `.` or `..`, no
//! duplicate or trailing slashes, root spelled `/`.

use crate::error::{VfsError, VfsResult};

/// Maximum length of a single path component, in bytes.
pub const MAX_COMPONENT_LEN: usize = 1024;

/// Normalise a path into canonical absolute form.
///
/// `.` components are dropped, `..` pops the previous component (clamping
/// at the root), redundant and trailing slashes are stripped. Relative
/// inputs are interpreted from the root. Normalisation is idempotent:
/// `normalize(normalize(p)) == normalize(p)`.
pub fn normalize(path: &str) -> VfsResult<String> {
    if path.contains('\0') {
        return Err(VfsError::invalid_argument("path contains NUL byte"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => {
                if c.len() > MAX_COMPONENT_LEN {
                    return Err(VfsError::invalid_argument(format!(
                        "path component exceeds {MAX_COMPONENT_LEN} bytes"
                    )));
                }
                parts.push(c);
            }
        }
    }

    if parts.is_empty() {
        Ok("/".to_owned())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// The parent of a normalised path. The root is its own parent.
#[must_use]
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The leaf component of a normalised path; empty for the root.
#[must_use]
pub fn leaf(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a child name onto a normalised directory path.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Iterate the components of a normalised path, skipping the root.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Whether `path` lies at or under `prefix`, on a component boundary.
///
/// `/foo/bar` is under `/foo` but not under `/fo`.
#[must_use]
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Strip a mount prefix from a normalised path, keeping the leading `/`.
///
/// Returns `None` unless [`is_under`] holds.
#[must_use]
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if !is_under(path, prefix) {
        return None;
    }
    if prefix == "/" {
        return Some(path);
    }
    let rest = &path[prefix.len()..];
    if rest.is_empty() { Some("/") } else { Some(rest) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize("/a/./b//c/").unwrap(), "/a/b/c");
        assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
    }

    #[test]
    fn normalize_clamps_at_root() {
        assert_eq!(normalize("/..").unwrap(), "/");
        assert_eq!(normalize("/../../x").unwrap(), "/x");
        assert_eq!(normalize("").unwrap(), "/");
    }

    #[test]
    fn normalize_rejects_nul() {
        assert!(normalize("/a\0b").is_err());
    }

    #[test]
    fn normalize_rejects_oversized_component() {
        let long = "x".repeat(MAX_COMPONENT_LEN + 1);
        assert!(normalize(&format!("/{long}")).is_err());
    }

    #[test]
    fn parent_and_leaf() {
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(leaf("/a/b/c"), "c");
        assert_eq!(leaf("/"), "");
    }

    #[test]
    fn is_under_respects_component_boundaries() {
        assert!(is_under("/foo/bar", "/foo"));
        assert!(is_under("/foo", "/foo"));
        assert!(!is_under("/foobar", "/foo"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn strip_prefix_keeps_leading_slash() {
        assert_eq!(strip_prefix("/foo/bar", "/foo"), Some("/bar"));
        assert_eq!(strip_prefix("/foo", "/foo"), Some("/"));
        assert_eq!(strip_prefix("/x/y", "/"), Some("/x/y"));
        assert_eq!(strip_prefix("/foobar", "/foo"), None);
    }
}
