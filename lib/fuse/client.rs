//! The gateway's view of the server.
//!
//! The FUSE adapter is generic over this trait so it neither knows nor
//! cares how operations reach the dispatcher. [`InProcessClient`] is the
//! in-process transport; wire transports live outside this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::dispatcher::{Dispatcher, HandleGrant};
use crate::error::VfsResult;
use crate::handle::HandleId;
use crate::session::Session;
use crate::types::{FileInfo, OpenFlag, WriteFlag};

/// The protocol surface the FUSE gateway drives.
#[async_trait]
pub trait VfsClient: Send + Sync + 'static {
    async fn stat(&self, path: &str) -> VfsResult<FileInfo>;
    async fn readdir(&self, path: &str) -> VfsResult<Vec<FileInfo>>;
    async fn read(&self, path: &str, offset: u64, size: i64) -> VfsResult<Bytes>;
    async fn write(
        &self,
        path: &str,
        data: Bytes,
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64>;
    async fn create(&self, path: &str) -> VfsResult<()>;
    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()>;
    async fn remove(&self, path: &str) -> VfsResult<()>;
    async fn rename(&self, old: &str, new: &str) -> VfsResult<()>;
    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()>;
    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()>;
    async fn symlink(&self, source: &str, target: &str) -> VfsResult<()>;
    async fn readlink(&self, path: &str) -> VfsResult<String>;

    async fn open_handle(
        &self,
        path: &str,
        flags: OpenFlag,
        mode: u32,
    ) -> VfsResult<HandleGrant>;
    async fn close_handle(&self, id: HandleId) -> VfsResult<()>;
    async fn read_handle(&self, id: HandleId, offset: u64, size: i64) -> VfsResult<Bytes>;
    async fn write_handle(&self, id: HandleId, data: Bytes, offset: i64) -> VfsResult<u64>;
    async fn sync_handle(&self, id: HandleId) -> VfsResult<()>;
}

/// Drives a [`Dispatcher`] directly, carrying one session.
pub struct InProcessClient {
    dispatcher: Arc<Dispatcher>,
    session: Session,
}

impl InProcessClient {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, session: Session) -> Self {
        Self {
            dispatcher,
            session,
        }
    }
}

#[async_trait]
impl VfsClient for InProcessClient {
    async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        self.dispatcher.stat(&self.session, path).await
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        self.dispatcher.readdir(&self.session, path).await
    }

    async fn read(&self, path: &str, offset: u64, size: i64) -> VfsResult<Bytes> {
        self.dispatcher.read(&self.session, path, offset, size).await
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        self.dispatcher
            .write(&self.session, path, data, offset, flags)
            .await
    }

    async fn create(&self, path: &str) -> VfsResult<()> {
        self.dispatcher.create(&self.session, path).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.dispatcher.mkdir(&self.session, path, mode).await
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        self.dispatcher.remove(&self.session, path).await
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        self.dispatcher.rename(&self.session, old, new).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.dispatcher.chmod(&self.session, path, mode).await
    }

    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        self.dispatcher.truncate(&self.session, path, size).await
    }

    async fn symlink(&self, source: &str, target: &str) -> VfsResult<()> {
        self.dispatcher.symlink(&self.session, source, target).await
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        self.dispatcher.readlink(&self.session, path).await
    }

    async fn open_handle(
        &self,
        path: &str,
        flags: OpenFlag,
        mode: u32,
    ) -> VfsResult<HandleGrant> {
        // The gateway renews implicitly through access; the default lease
        // is what a zero duration requests.
        self.dispatcher
            .open_handle(&self.session, path, flags, mode, Duration::ZERO)
            .await
    }

    async fn close_handle(&self, id: HandleId) -> VfsResult<()> {
        self.dispatcher.close_handle(id).await
    }

    async fn read_handle(&self, id: HandleId, offset: u64, size: i64) -> VfsResult<Bytes> {
        self.dispatcher.read_handle(id, offset, size).await
    }

    async fn write_handle(&self, id: HandleId, data: Bytes, offset: i64) -> VfsResult<u64> {
        self.dispatcher.write_handle(id, data, offset).await
    }

    async fn sync_handle(&self, id: HandleId) -> VfsResult<()> {
        self.dispatcher.sync_handle(id).await
    }
}
