//! The mount table: ordered prefix map from namespace paths to plugins.
//!
//! Lookups use longest-prefix matching on component boundaries. The table
//! is read-mostly: mutations happen at startup and on explicit
//! mount/unmount, so a plain `RwLock` over a sorted vector is sufficient.

use std::sync::{Arc, RwLock};

use crate::error::{VfsError, VfsResult};
use crate::path;
use crate::plugin::Plugin;
use crate::types::{FileInfo, PluginConfig};

/// One entry in the mount table.
#[derive(Clone)]
pub struct MountEntry {
    /// Canonical absolute mount path, no trailing slash (`/` for root).
    pub path: String,
    /// The plugin serving this mount.
    pub plugin: Arc<dyn Plugin>,
    /// Snapshot of the per-mount configuration, for introspection.
    pub config: PluginConfig,
}

impl std::fmt::Debug for MountEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountEntry")
            .field("path", &self.path)
            .field("plugin", &self.plugin.name())
            .finish_non_exhaustive()
    }
}

/// A successful route through the table.
pub struct Resolved {
    /// The matched mount path.
    pub mount_path: String,
    /// The plugin behind it.
    pub plugin: Arc<dyn Plugin>,
    /// Backend-relative path, normalised, with a leading `/`.
    pub rel_path: String,
}

/// Prefix-ordered mount map.
#[derive(Default)]
pub struct MountTable {
    // Sorted by descending path length so the first boundary match wins.
    entries: RwLock<Vec<MountEntry>>,
}

impl MountTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin at `mount_path`.
    ///
    /// The path is normalised first; two entries may not share a path.
    pub fn mount(
        &self,
        mount_path: &str,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> VfsResult<()> {
        let mount_path = path::normalize(mount_path)?;
        let mut entries = self.entries.write().expect("mount table lock poisoned");
        if entries.iter().any(|e| e.path == mount_path) {
            return Err(VfsError::already_exists(format!(
                "mount point {mount_path}"
            )));
        }
        entries.push(MountEntry {
            path: mount_path,
            plugin,
            config,
        });
        entries.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Ok(())
    }

    /// Remove the mount at `mount_path`. Returns whether one was removed.
    pub fn unmount(&self, mount_path: &str) -> VfsResult<bool> {
        let mount_path = path::normalize(mount_path)?;
        let mut entries = self.entries.write().expect("mount table lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.path != mount_path);
        Ok(entries.len() != before)
    }

    /// Resolve a normalised absolute path to its mount.
    ///
    /// The chosen mount is the unique longest entry that is a
    /// component-boundary prefix of `abs_path`.
    pub fn resolve(&self, abs_path: &str) -> VfsResult<Resolved> {
        let entries = self.entries.read().expect("mount table lock poisoned");
        for entry in entries.iter() {
            if let Some(rel) = path::strip_prefix(abs_path, &entry.path) {
                return Ok(Resolved {
                    mount_path: entry.path.clone(),
                    plugin: Arc::clone(&entry.plugin),
                    rel_path: rel.to_owned(),
                });
            }
        }
        Err(VfsError::not_found(format!(
            "no mount point for {abs_path}"
        )))
    }

    /// Whether `abs_path` is exactly a mount point.
    #[must_use]
    pub fn is_mount_point(&self, abs_path: &str) -> bool {
        let entries = self.entries.read().expect("mount table lock poisoned");
        entries.iter().any(|e| e.path == abs_path)
    }

    /// Whether `abs_path` is a strict ancestor of some mount point (a
    /// purely synthetic directory that exists only to hold mounts).
    #[must_use]
    pub fn is_mount_ancestor(&self, abs_path: &str) -> bool {
        let entries = self.entries.read().expect("mount table lock poisoned");
        entries
            .iter()
            .any(|e| e.path != abs_path && path::is_under(&e.path, abs_path))
    }

    /// Snapshot of all mounts, longest path first.
    #[must_use]
    pub fn list(&self) -> Vec<MountEntry> {
        self.entries
            .read()
            .expect("mount table lock poisoned")
            .clone()
    }

    /// Synthesize the listing of a directory that exists because mounts
    /// live beneath it: the next path component of every mount under
    /// `dir`, deduplicated, as directory entries.
    #[must_use]
    pub fn synthetic_entries(&self, dir: &str) -> Vec<FileInfo> {
        let entries = self.entries.read().expect("mount table lock poisoned");
        let mut names: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if entry.path == dir || !path::is_under(&entry.path, dir) {
                continue;
            }
            let rest = path::strip_prefix(&entry.path, dir).unwrap_or("/");
            if let Some(first) = path::components(rest).next() {
                if !names.iter().any(|n| n == first) {
                    names.push(first.to_owned());
                }
            }
        }
        names.sort();
        names
            .into_iter()
            .map(|n| FileInfo::directory(n, 0o755))
            .collect()
    }
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().expect("mount table lock poisoned");
        f.debug_struct("MountTable")
            .field("mounts", &entries.len())
            .finish()
    }
}
