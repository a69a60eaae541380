//! The plugin contract.
//!
//! A plugin is a backend that serves a subtree of the aggregated
//! namespace. All operations are path-based; paths are backend-relative,
//! normalised, and keep a leading `/`. Optional operations default to
//! [`VfsError::NotSupported`] so callers can fall back (the FUSE bridge
//! relies on this for its LOCAL handle records).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use futures::Stream;

use crate::error::{VfsError, VfsResult};
use crate::types::{ConfigParam, FileInfo, GrepMatch, OpenFlag, WriteFlag};

/// A stream of chunks from [`Plugin::open_stream`], for follow-mode readers.
pub type ByteStream = Pin<Box<dyn Stream<Item = VfsResult<Bytes>> + Send>>;

bitflags! {
    /// Capabilities a plugin advertises beyond the mandatory operation set.
    ///
    /// The dispatcher consults these before routing advanced requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capability: u32 {
        /// The backend accepts mutations.
        const WRITABLE  = 1 << 0;
        /// The backend implements the stateful handle operations.
        const HANDLES   = 1 << 1;
        /// The backend implements `grep` (possibly semantic search).
        const GREP      = 1 << 2;
        /// The backend implements `open_stream`.
        const STREAMING = 1 << 3;
    }
}

/// An open file inside a plugin, produced by [`Plugin::open_handle`].
///
/// The server shares handles between its handle table and in-flight
/// operations, hence `Arc`. `close` must be idempotent from the plugin's
/// point of view only in the sense that the handle manager guarantees it
/// is invoked at most once per registered handle.
#[async_trait]
pub trait PluginHandle: Send + Sync + std::fmt::Debug {
    /// Read up to `size` bytes at `offset`; negative size means "to end".
    /// A short result means EOF; reads at or past EOF yield an empty slice.
    async fn read_at(&self, offset: u64, size: i64) -> VfsResult<Bytes>;

    /// Write `data` at `offset`; a negative offset appends. Returns the
    /// number of bytes written, which equals the input length on success.
    async fn write_at(&self, data: Bytes, offset: i64) -> VfsResult<u64>;

    /// Flush buffered data to durable storage.
    async fn sync(&self) -> VfsResult<()>;

    /// Release the handle's resources.
    async fn close(&self) -> VfsResult<()>;
}

/// The uniform operation set every backend implements.
///
/// Unsupported optional operations return [`VfsError::NotSupported`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The instance name (used in metadata blocks and logs).
    fn name(&self) -> &str;

    /// Capability set for this instance.
    fn capabilities(&self) -> Capability;

    /// Configuration keys this plugin kind recognises.
    fn config_params(&self) -> &'static [ConfigParam] {
        &[]
    }

    /// Metadata for a single entry.
    async fn stat(&self, path: &str) -> VfsResult<FileInfo>;

    /// List a directory. Entry names are unique; order is unspecified.
    async fn readdir(&self, path: &str) -> VfsResult<Vec<FileInfo>>;

    /// Read up to `size` bytes at `offset`; negative size means "to end".
    async fn read(&self, path: &str, offset: u64, size: i64) -> VfsResult<Bytes>;

    /// Write `data` at `offset` (negative = append) honouring `flags`.
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes, offset: i64, flags: WriteFlag)
        -> VfsResult<u64>;

    /// Create an empty file; fails with already-exists if present.
    async fn create(&self, path: &str) -> VfsResult<()>;

    /// Create a directory. Creating over an existing directory is
    /// idempotent; over anything else it is already-exists.
    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()>;

    /// Remove a file or empty directory.
    async fn remove(&self, path: &str) -> VfsResult<()>;

    /// Remove recursively. Plugins over partial backends recurse here.
    async fn remove_all(&self, path: &str) -> VfsResult<()>;

    /// Rename within this backend; atomic from the caller's perspective.
    async fn rename(&self, old: &str, new: &str) -> VfsResult<()>;

    /// Change permission bits. May be a no-op; must not error for
    /// backends without a permission model.
    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()>;

    /// Resize a file, zero-padding on extension.
    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()>;

    /// Open a chunk stream for follow-mode readers. Optional.
    async fn open_stream(&self, path: &str) -> VfsResult<ByteStream> {
        let _ = path;
        Err(VfsError::not_supported("open_stream"))
    }

    /// Open a stateful handle. Optional; the FUSE bridge falls back to
    /// its LOCAL record when this is unsupported.
    async fn open_handle(
        &self,
        path: &str,
        flags: OpenFlag,
        mode: u32,
    ) -> VfsResult<Arc<dyn PluginHandle>> {
        let _ = (path, flags, mode);
        Err(VfsError::not_supported("open_handle"))
    }

    /// Search under `path`. Semantic backends return scored chunks.
    /// Optional.
    async fn grep(&self, path: &str, query: &str, limit: usize) -> VfsResult<Vec<GrepMatch>> {
        let _ = (path, query, limit);
        Err(VfsError::not_supported("grep"))
    }

    /// Release background resources at server shutdown. Plugins with
    /// worker pools drain them here; the default does nothing.
    async fn shutdown(&self) {}
}
