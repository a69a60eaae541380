//! Per-session state: the chroot overlay.
//!
//! A session optionally carries a chroot root. External paths are
//! interpreted relative to that root and rewritten to absolute namespace
//! paths before routing; anything that would land outside the chroot is
//! rejected with permission-denied.

use crate::error::{VfsError, VfsResult};
use crate::path;

/// Client session context. Cheap to clone; one per connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    chroot: Option<String>,
}

impl Session {
    /// A session with full namespace visibility.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A session confined under `root`.
    pub fn chrooted(root: &str) -> VfsResult<Self> {
        let root = path::normalize(root)?;
        Ok(Self {
            chroot: if root == "/" { None } else { Some(root) },
        })
    }

    /// The chroot root, if one is set.
    #[must_use]
    pub fn chroot(&self) -> Option<&str> {
        self.chroot.as_deref()
    }

    /// Rewrite an external path into the absolute namespace path.
    ///
    /// Normalisation clamps `..` at the external root, so a confined
    /// session cannot name anything above its chroot; the containment
    /// check is kept as the contract's explicit rejection point.
    pub fn resolve(&self, external: &str) -> VfsResult<String> {
        let ext = path::normalize(external)?;
        match &self.chroot {
            None => Ok(ext),
            Some(root) => {
                let abs = if ext == "/" {
                    root.clone()
                } else {
                    path::normalize(&format!("{root}{ext}"))?
                };
                if !path::is_under(&abs, root) {
                    return Err(VfsError::permission_denied(format!(
                        "path {external} escapes session root"
                    )));
                }
                Ok(abs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfined_passes_through() {
        let s = Session::new();
        assert_eq!(s.resolve("/a/b").unwrap(), "/a/b");
        assert_eq!(s.resolve("a/../b").unwrap(), "/b");
    }

    #[test]
    fn chroot_rebases_paths() {
        let s = Session::chrooted("/jail").unwrap();
        assert_eq!(s.resolve("/x").unwrap(), "/jail/x");
        assert_eq!(s.resolve("/").unwrap(), "/jail");
    }

    #[test]
    fn chroot_clamps_escapes() {
        let s = Session::chrooted("/jail").unwrap();
        // `..` above the external root is clamped, never an escape.
        assert_eq!(s.resolve("/../../x").unwrap(), "/jail/x");
    }

    #[test]
    fn root_chroot_is_identity() {
        let s = Session::chrooted("/").unwrap();
        assert!(s.chroot().is_none());
        assert_eq!(s.resolve("/a").unwrap(), "/a");
    }
}
