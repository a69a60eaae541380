//! Top-level operation handler.
//!
//! Every client operation flows through here: the session chroot is
//! applied, the path normalised, virtual symlinks chased (depth-limited),
//! the mount table consulted for the longest prefix, and finally the
//! plugin invoked. Handle operations additionally go through the handle
//! manager; the plugin handle travels inside the registered record so
//! later handle calls do not re-route.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{VfsError, VfsResult};
use crate::handle::{HandleId, HandleInfo, HandleManager};
use crate::mount::{MountTable, Resolved};
use crate::path;
use crate::plugin::{ByteStream, Capability};
use crate::session::Session;
use crate::symlink::SymlinkStore;
use crate::types::{FileInfo, GrepMatch, OpenFlag, WriteFlag};

/// A freshly opened server handle, as returned to clients.
#[derive(Debug, Clone, Copy)]
pub struct HandleGrant {
    pub id: HandleId,
    pub expires_at: Instant,
}

/// Routes operations from sessions to plugins.
pub struct Dispatcher {
    mounts: Arc<MountTable>,
    symlinks: Arc<SymlinkStore>,
    handles: Arc<HandleManager>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        mounts: Arc<MountTable>,
        symlinks: Arc<SymlinkStore>,
        handles: Arc<HandleManager>,
    ) -> Self {
        Self {
            mounts,
            symlinks,
            handles,
        }
    }

    #[must_use]
    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    #[must_use]
    pub fn symlinks(&self) -> &Arc<SymlinkStore> {
        &self.symlinks
    }

    #[must_use]
    pub fn handles(&self) -> &Arc<HandleManager> {
        &self.handles
    }

    /// Chroot + normalise + full symlink walk + longest-prefix route.
    async fn route(&self, session: &Session, external: &str) -> VfsResult<Resolved> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve(&abs)?;
        self.mounts.resolve(&walked)
    }

    /// Metadata for a single entry.
    ///
    /// Intermediate symlinks are chased; a terminal virtual symlink is
    /// reported as the link itself so clients can readlink it. Mount
    /// points and their synthetic ancestors stat as directories.
    pub async fn stat(&self, session: &Session, external: &str) -> VfsResult<FileInfo> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve_parent(&abs)?;

        if let Some(entry) = self.symlinks.get(&walked) {
            return Ok(FileInfo::symlink(path::leaf(&walked), &entry.target));
        }
        if walked == "/" || self.mounts.is_mount_point(&walked) {
            return Ok(FileInfo::directory(path::leaf(&walked), 0o755));
        }
        match self.mounts.resolve(&walked) {
            Ok(r) => r.plugin.stat(&r.rel_path).await,
            Err(e) => {
                if self.mounts.is_mount_ancestor(&walked) {
                    Ok(FileInfo::directory(path::leaf(&walked), 0o755))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// List a directory, merging plugin entries, synthetic mount
    /// children, and virtual symlinks under the path. Names stay unique;
    /// overlay entries shadow plugin entries of the same name.
    pub async fn readdir(&self, session: &Session, external: &str) -> VfsResult<Vec<FileInfo>> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve(&abs)?;

        let mut entries: Vec<FileInfo> = match self.mounts.resolve(&walked) {
            Ok(r) => r.plugin.readdir(&r.rel_path).await?,
            Err(e) => {
                // A directory that exists only because mounts live under
                // it still lists; anything else propagates.
                if walked == "/" || self.mounts.is_mount_ancestor(&walked) {
                    Vec::new()
                } else {
                    return Err(e);
                }
            }
        };

        for synthetic in self.mounts.synthetic_entries(&walked) {
            entries.retain(|e| e.name != synthetic.name);
            entries.push(synthetic);
        }
        for (name, link) in self.symlinks.links_under(&walked) {
            entries.retain(|e| e.name != name);
            entries.push(FileInfo::symlink(name, &link.target));
        }
        Ok(entries)
    }

    /// Read up to `size` bytes at `offset`; negative size means to end.
    pub async fn read(
        &self,
        session: &Session,
        external: &str,
        offset: u64,
        size: i64,
    ) -> VfsResult<Bytes> {
        let r = self.route(session, external).await?;
        r.plugin.read(&r.rel_path, offset, size).await
    }

    /// Write with flag validation. Returns bytes written.
    pub async fn write(
        &self,
        session: &Session,
        external: &str,
        data: Bytes,
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        let flags = flags.validate()?;
        let r = self.route(session, external).await?;
        r.plugin.write(&r.rel_path, data, offset, flags).await
    }

    pub async fn create(&self, session: &Session, external: &str) -> VfsResult<()> {
        let r = self.route(session, external).await?;
        r.plugin.create(&r.rel_path).await
    }

    /// Create a directory. Creating at a pure mount point is rejected:
    /// the mount already exists.
    pub async fn mkdir(&self, session: &Session, external: &str, mode: u32) -> VfsResult<()> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve(&abs)?;
        if self.mounts.is_mount_point(&walked) {
            return Err(VfsError::already_exists(format!("mount point {walked}")));
        }
        let r = self.mounts.resolve(&walked)?;
        r.plugin.mkdir(&r.rel_path, mode).await
    }

    /// Remove a file, empty directory, or virtual symlink.
    pub async fn remove(&self, session: &Session, external: &str) -> VfsResult<()> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve_parent(&abs)?;
        if self.symlinks.remove(&walked) {
            return Ok(());
        }
        let r = self.mounts.resolve(&self.symlinks.resolve(&walked)?)?;
        r.plugin.remove(&r.rel_path).await
    }

    /// Remove recursively.
    pub async fn remove_all(&self, session: &Session, external: &str) -> VfsResult<()> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve_parent(&abs)?;
        if self.symlinks.remove(&walked) {
            return Ok(());
        }
        let r = self.mounts.resolve(&self.symlinks.resolve(&walked)?)?;
        r.plugin.remove_all(&r.rel_path).await
    }

    /// Rename within a single plugin. Cross-plugin renames are rejected;
    /// callers fall back to copy-then-remove.
    pub async fn rename(
        &self,
        session: &Session,
        old_external: &str,
        new_external: &str,
    ) -> VfsResult<()> {
        let old = self.route(session, old_external).await?;
        let new = self.route(session, new_external).await?;
        if old.mount_path != new.mount_path {
            return Err(VfsError::invalid_argument(format!(
                "cross-plugin rename from {} to {}",
                old.mount_path, new.mount_path
            )));
        }
        old.plugin.rename(&old.rel_path, &new.rel_path).await
    }

    pub async fn chmod(&self, session: &Session, external: &str, mode: u32) -> VfsResult<()> {
        let r = self.route(session, external).await?;
        r.plugin.chmod(&r.rel_path, mode).await
    }

    pub async fn truncate(&self, session: &Session, external: &str, size: u64) -> VfsResult<()> {
        let r = self.route(session, external).await?;
        r.plugin.truncate(&r.rel_path, size).await
    }

    /// Create a virtual symlink in the core store.
    pub async fn symlink(
        &self,
        session: &Session,
        source_external: &str,
        target: &str,
    ) -> VfsResult<()> {
        let source = session.resolve(source_external)?;
        self.symlinks.create(&source, target)
    }

    /// Read a virtual symlink's target.
    pub async fn readlink(&self, session: &Session, external: &str) -> VfsResult<String> {
        let abs = session.resolve(external)?;
        let walked = self.symlinks.resolve_parent(&abs)?;
        self.symlinks
            .get(&walked)
            .map(|e| e.target)
            .ok_or_else(|| VfsError::invalid_argument(format!("{external} is not a symlink")))
    }

    /// Open a server handle. Consults the mount's capability set first so
    /// backends without handle support yield not-supported and the FUSE
    /// bridge can fall back. On a full table the freshly opened plugin
    /// handle is closed again; it never appears anywhere.
    pub async fn open_handle(
        &self,
        session: &Session,
        external: &str,
        flags: OpenFlag,
        mode: u32,
        lease: Duration,
    ) -> VfsResult<HandleGrant> {
        let flags = flags.validate()?;
        let r = self.route(session, external).await?;
        if !r.plugin.capabilities().contains(Capability::HANDLES) {
            return Err(VfsError::not_supported(format!(
                "open_handle on {}",
                r.mount_path
            )));
        }
        let abs = session.resolve(external)?;
        let handle = r.plugin.open_handle(&r.rel_path, flags, mode).await?;
        match self.handles.register(Arc::clone(&handle), &abs, flags, lease) {
            Ok((id, expires_at)) => Ok(HandleGrant { id, expires_at }),
            Err(e) => {
                if let Err(close_err) = handle.close().await {
                    warn!(error = %close_err, "closing unregistered handle failed");
                }
                Err(e)
            }
        }
    }

    pub async fn read_handle(&self, id: HandleId, offset: u64, size: i64) -> VfsResult<Bytes> {
        let handle = self.handles.get(id).await?;
        handle.read_at(offset, size).await
    }

    pub async fn write_handle(&self, id: HandleId, data: Bytes, offset: i64) -> VfsResult<u64> {
        let handle = self.handles.get(id).await?;
        handle.write_at(data, offset).await
    }

    pub async fn sync_handle(&self, id: HandleId) -> VfsResult<()> {
        let handle = self.handles.get(id).await?;
        handle.sync().await
    }

    pub async fn renew_handle(&self, id: HandleId, lease: Duration) -> VfsResult<Instant> {
        self.handles.renew(id, lease).await
    }

    pub async fn close_handle(&self, id: HandleId) -> VfsResult<()> {
        self.handles.close(id).await
    }

    /// Snapshot a handle without refreshing its lease.
    pub fn handle_info(&self, id: HandleId) -> VfsResult<HandleInfo> {
        self.handles.info(id)
    }

    /// Search under a path where the mount advertises the capability.
    pub async fn grep(
        &self,
        session: &Session,
        external: &str,
        query: &str,
        limit: usize,
    ) -> VfsResult<Vec<GrepMatch>> {
        let r = self.route(session, external).await?;
        if !r.plugin.capabilities().contains(Capability::GREP) {
            return Err(VfsError::not_supported(format!("grep on {}", r.mount_path)));
        }
        r.plugin.grep(&r.rel_path, query, limit).await
    }

    /// Open a follow-mode chunk stream where the mount supports it.
    pub async fn open_stream(&self, session: &Session, external: &str) -> VfsResult<ByteStream> {
        let r = self.route(session, external).await?;
        if !r.plugin.capabilities().contains(Capability::STREAMING) {
            return Err(VfsError::not_supported(format!(
                "open_stream on {}",
                r.mount_path
            )));
        }
        r.plugin.open_stream(&r.rel_path).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mounts", &self.mounts)
            .field("symlinks", &self.symlinks)
            .finish_non_exhaustive()
    }
}
