//! Virtual symlinks at the VFS layer.
//!
//! Links live in a flat store keyed by source path and may point across
//! mounts. Resolution substitutes targets component-by-component from the
//! root and restarts after each substitution, so a chain is chased in at
//! most [`MAX_SYMLINK_DEPTH`] steps before failing with a loop error.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::path;

/// Maximum substitutions before resolution fails with a loop error.
pub const MAX_SYMLINK_DEPTH: usize = 8;

/// A single virtual symlink record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkEntry {
    /// Target path: absolute, or relative to the link's parent directory.
    pub target: String,
    pub created_at: SystemTime,
}

/// Flat, read-mostly store of virtual symlinks. At most one link per
/// source path; no cycles by construction are attempted — the depth limit
/// at resolution time is the guard.
#[derive(Default)]
pub struct SymlinkStore {
    links: RwLock<BTreeMap<String, SymlinkEntry>>,
}

impl SymlinkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a link at `source` pointing to `target`.
    pub fn create(&self, source: &str, target: &str) -> VfsResult<()> {
        let source = path::normalize(source)?;
        if target.is_empty() {
            return Err(VfsError::invalid_argument("empty symlink target"));
        }
        let mut links = self.links.write().expect("symlink store lock poisoned");
        if links.contains_key(&source) {
            return Err(VfsError::already_exists(source));
        }
        links.insert(
            source,
            SymlinkEntry {
                target: target.to_owned(),
                created_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Remove the link at `source`. Returns whether one existed.
    pub fn remove(&self, source: &str) -> bool {
        self.links
            .write()
            .expect("symlink store lock poisoned")
            .remove(source)
            .is_some()
    }

    /// The link at exactly `source`, if any.
    #[must_use]
    pub fn get(&self, source: &str) -> Option<SymlinkEntry> {
        self.links
            .read()
            .expect("symlink store lock poisoned")
            .get(source)
            .cloned()
    }

    /// All links whose parent directory is `dir`, as `(leaf, entry)` pairs.
    #[must_use]
    pub fn links_under(&self, dir: &str) -> Vec<(String, SymlinkEntry)> {
        let links = self.links.read().expect("symlink store lock poisoned");
        links
            .iter()
            .filter(|(source, _)| path::parent(source) == dir)
            .map(|(source, entry)| (path::leaf(source).to_owned(), entry.clone()))
            .collect()
    }

    /// Resolve the target a link points at, made absolute.
    ///
    /// Relative targets resolve against the link's parent directory.
    fn absolute_target(source: &str, entry: &SymlinkEntry) -> VfsResult<String> {
        if entry.target.starts_with('/') {
            path::normalize(&entry.target)
        } else {
            path::normalize(&path::join(path::parent(source), &entry.target))
        }
    }

    /// Fully resolve `abs_path` through the store.
    ///
    /// Walks components from the root; whenever a prefix matches a link,
    /// the prefix is substituted by the target and the walk restarts.
    /// More than [`MAX_SYMLINK_DEPTH`] substitutions is a loop error.
    pub fn resolve(&self, abs_path: &str) -> VfsResult<String> {
        self.resolve_inner(abs_path, false)
    }

    /// Like [`resolve`](Self::resolve), but leaves a terminal symlink in
    /// place so callers can observe the link itself (stat, readlink).
    pub fn resolve_parent(&self, abs_path: &str) -> VfsResult<String> {
        self.resolve_inner(abs_path, true)
    }

    fn resolve_inner(&self, abs_path: &str, keep_terminal: bool) -> VfsResult<String> {
        let mut current = abs_path.to_owned();
        let mut depth = 0usize;

        'restart: loop {
            let comps: Vec<String> =
                path::components(&current).map(str::to_owned).collect();
            let mut prefix = String::new();
            for (i, comp) in comps.iter().enumerate() {
                prefix.push('/');
                prefix.push_str(comp);
                if keep_terminal && i + 1 == comps.len() {
                    break;
                }
                if let Some(entry) = self.get(&prefix) {
                    depth += 1;
                    if depth > MAX_SYMLINK_DEPTH {
                        return Err(VfsError::symlink_loop(abs_path.to_owned()));
                    }
                    let target = Self::absolute_target(&prefix, &entry)?;
                    let rest = current[prefix.len()..].to_owned();
                    current = if rest.is_empty() {
                        target
                    } else {
                        path::normalize(&format!("{target}{rest}"))?
                    };
                    continue 'restart;
                }
            }
            return Ok(current);
        }
    }
}

impl std::fmt::Debug for SymlinkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links = self.links.read().expect("symlink store lock poisoned");
        f.debug_struct("SymlinkStore")
            .field("links", &links.len())
            .finish()
    }
}
