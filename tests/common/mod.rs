#![allow(missing_docs, clippy::unwrap_used, dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use aggfs::dispatcher::HandleGrant;
use aggfs::error::{VfsError, VfsResult};
use aggfs::fuse::client::VfsClient;
use aggfs::handle::HandleId;
use aggfs::plugin::{Capability, Plugin, PluginHandle};
use aggfs::types::{FileInfo, OpenFlag, WriteFlag};

/// Shared state backing [`MockPlugin`].
#[derive(Default)]
pub struct MockState {
    /// Path -> content for files this plugin serves.
    pub files: Mutex<HashMap<String, Bytes>>,
    /// Every operation invoked, with its path.
    pub calls: Mutex<Vec<(String, String)>>,
    /// Read calls with their offset/size arguments.
    pub read_calls: Mutex<Vec<(String, u64, i64)>>,
    /// Counts plugin-handle closes across all handles this plugin issued.
    pub handle_closes: Arc<AtomicUsize>,
}

impl MockState {
    pub fn log(&self, op: &str, path: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_owned(), path.to_owned()));
    }

    pub fn calls_for(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o == op)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// A scripted plugin for routing and dispatch tests.
pub struct MockPlugin {
    pub name: String,
    pub caps: Capability,
    pub state: Arc<MockState>,
}

impl MockPlugin {
    pub fn new(name: &str, caps: Capability) -> Self {
        Self {
            name: name.to_owned(),
            caps,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), Bytes::copy_from_slice(content));
        self
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capability {
        self.caps
    }

    async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        self.state.log("stat", path);
        if path == "/" {
            return Ok(FileInfo::directory("", 0o755));
        }
        let files = self.state.files.lock().unwrap();
        files
            .get(path)
            .map(|data| FileInfo::file(aggfs::path::leaf(path), data.len() as u64, 0o644))
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        self.state.log("readdir", path);
        let files = self.state.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|(p, _)| aggfs::path::parent(p) == path)
            .map(|(p, data)| FileInfo::file(aggfs::path::leaf(p), data.len() as u64, 0o644))
            .collect())
    }

    async fn read(&self, path: &str, offset: u64, size: i64) -> VfsResult<Bytes> {
        self.state.log("read", path);
        self.state
            .read_calls
            .lock()
            .unwrap()
            .push((path.to_owned(), offset, size));
        let files = self.state.files.lock().unwrap();
        let data = files.get(path).ok_or_else(|| VfsError::not_found(path))?;
        let start = (offset as usize).min(data.len());
        let end = if size < 0 {
            data.len()
        } else {
            (start + size as usize).min(data.len())
        };
        Ok(data.slice(start..end))
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        _offset: i64,
        _flags: WriteFlag,
    ) -> VfsResult<u64> {
        self.state.log("write", path);
        let len = data.len() as u64;
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), data);
        Ok(len)
    }

    async fn create(&self, path: &str) -> VfsResult<()> {
        self.state.log("create", path);
        let mut files = self.state.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(VfsError::already_exists(path));
        }
        files.insert(path.to_owned(), Bytes::new());
        Ok(())
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<()> {
        self.state.log("mkdir", path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        self.state.log("remove", path);
        self.state
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        self.state.log("remove_all", path);
        let mut files = self.state.files.lock().unwrap();
        files.retain(|p, _| p != path && !aggfs::path::is_under(p, path));
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        self.state.log("rename", old);
        let mut files = self.state.files.lock().unwrap();
        let data = files.remove(old).ok_or_else(|| VfsError::not_found(old))?;
        files.insert(new.to_owned(), data);
        Ok(())
    }

    async fn chmod(&self, path: &str, _mode: u32) -> VfsResult<()> {
        self.state.log("chmod", path);
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        self.state.log("truncate", path);
        let mut files = self.state.files.lock().unwrap();
        let data = files
            .get_mut(path)
            .ok_or_else(|| VfsError::not_found(path))?;
        let mut v = data.to_vec();
        v.resize(size as usize, 0);
        *data = Bytes::from(v);
        Ok(())
    }

    async fn open_handle(
        &self,
        path: &str,
        _flags: OpenFlag,
        _mode: u32,
    ) -> VfsResult<Arc<dyn PluginHandle>> {
        self.state.log("open_handle", path);
        if !self.caps.contains(Capability::HANDLES) {
            return Err(VfsError::not_supported("open_handle"));
        }
        let content = self
            .state
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(MockHandle::with_data(
            Arc::clone(&self.state.handle_closes),
            &content,
        )))
    }
}

/// A plugin handle that counts closes and serves a growable buffer.
#[derive(Debug)]
pub struct MockHandle {
    pub data: Mutex<Vec<u8>>,
    pub closes: Arc<AtomicUsize>,
}

impl MockHandle {
    pub fn new(closes: Arc<AtomicUsize>) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            closes,
        }
    }

    pub fn with_data(closes: Arc<AtomicUsize>, data: &[u8]) -> Self {
        Self {
            data: Mutex::new(data.to_vec()),
            closes,
        }
    }
}

#[async_trait]
impl PluginHandle for MockHandle {
    async fn read_at(&self, offset: u64, size: i64) -> VfsResult<Bytes> {
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = if size < 0 {
            data.len()
        } else {
            (start + size as usize).min(data.len())
        };
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write_at(&self, bytes: Bytes, offset: i64) -> VfsResult<u64> {
        let mut data = self.data.lock().unwrap();
        let at = if offset < 0 { data.len() } else { offset as usize };
        if at + bytes.len() > data.len() {
            data.resize(at + bytes.len(), 0);
        }
        data[at..at + bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len() as u64)
    }

    async fn sync(&self) -> VfsResult<()> {
        Ok(())
    }

    async fn close(&self) -> VfsResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Shared state backing [`MockClient`] for FUSE bridge tests.
#[derive(Default)]
pub struct MockClientState {
    /// Whether `open_handle` succeeds or reports not-supported.
    pub supports_handles: bool,
    /// Content served by stateless reads and remote handle reads.
    pub content: Mutex<Bytes>,
    /// Recorded stateless read calls `(path, offset, size)`.
    pub reads: Mutex<Vec<(String, u64, i64)>>,
    /// Recorded stateless writes `(path, data, offset, flags)`.
    pub writes: Mutex<Vec<(String, Bytes, i64, WriteFlag)>>,
    /// Recorded `read_handle` calls `(id, offset, size)`.
    pub handle_reads: Mutex<Vec<(HandleId, u64, i64)>>,
    /// Recorded `close_handle` ids.
    pub handle_closes: Mutex<Vec<HandleId>>,
    /// Stat results by path.
    pub stats: Mutex<HashMap<String, FileInfo>>,
    /// Counts `stat` calls per path.
    pub stat_calls: Mutex<HashMap<String, usize>>,
    /// Listings by path.
    pub listings: Mutex<HashMap<String, Vec<FileInfo>>>,
    /// Counts `readdir` calls per path.
    pub readdir_calls: Mutex<HashMap<String, usize>>,
    next_handle: AtomicUsize,
}

/// A scripted [`VfsClient`] for driving the handle bridge and caches.
pub struct MockClient {
    pub state: Arc<MockClientState>,
}

impl MockClient {
    pub fn new(supports_handles: bool) -> Self {
        Self {
            state: Arc::new(MockClientState {
                supports_handles,
                ..Default::default()
            }),
        }
    }

    pub fn set_content(&self, data: &[u8]) {
        *self.state.content.lock().unwrap() = Bytes::copy_from_slice(data);
    }
}

#[async_trait]
impl VfsClient for MockClient {
    async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        *self
            .state
            .stat_calls
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_insert(0) += 1;
        self.state
            .stats
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        *self
            .state
            .readdir_calls
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_insert(0) += 1;
        self.state
            .listings
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn read(&self, path: &str, offset: u64, size: i64) -> VfsResult<Bytes> {
        self.state
            .reads
            .lock()
            .unwrap()
            .push((path.to_owned(), offset, size));
        let data = self.state.content.lock().unwrap().clone();
        let start = (offset as usize).min(data.len());
        let end = if size < 0 {
            data.len()
        } else {
            (start + size as usize).min(data.len())
        };
        Ok(data.slice(start..end))
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        let len = data.len() as u64;
        self.state
            .writes
            .lock()
            .unwrap()
            .push((path.to_owned(), data, offset, flags));
        Ok(len)
    }

    async fn create(&self, _path: &str) -> VfsResult<()> {
        Ok(())
    }

    async fn mkdir(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Ok(())
    }

    async fn remove(&self, _path: &str) -> VfsResult<()> {
        Ok(())
    }

    async fn rename(&self, _old: &str, _new: &str) -> VfsResult<()> {
        Ok(())
    }

    async fn chmod(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Ok(())
    }

    async fn truncate(&self, _path: &str, _size: u64) -> VfsResult<()> {
        Ok(())
    }

    async fn symlink(&self, _source: &str, _target: &str) -> VfsResult<()> {
        Ok(())
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        Err(VfsError::invalid_argument(format!(
            "{path} is not a symlink"
        )))
    }

    async fn open_handle(
        &self,
        _path: &str,
        _flags: OpenFlag,
        _mode: u32,
    ) -> VfsResult<HandleGrant> {
        if !self.state.supports_handles {
            return Err(VfsError::not_supported("open_handle"));
        }
        let id = self.state.next_handle.fetch_add(1, Ordering::SeqCst) as HandleId + 1;
        Ok(HandleGrant {
            id,
            expires_at: tokio::time::Instant::now() + std::time::Duration::from_secs(60),
        })
    }

    async fn close_handle(&self, id: HandleId) -> VfsResult<()> {
        self.state.handle_closes.lock().unwrap().push(id);
        Ok(())
    }

    async fn read_handle(&self, id: HandleId, offset: u64, size: i64) -> VfsResult<Bytes> {
        self.state
            .handle_reads
            .lock()
            .unwrap()
            .push((id, offset, size));
        let data = self.state.content.lock().unwrap().clone();
        let start = (offset as usize).min(data.len());
        let end = if size < 0 {
            data.len()
        } else {
            (start + size as usize).min(data.len())
        };
        Ok(data.slice(start..end))
    }

    async fn write_handle(&self, _id: HandleId, data: Bytes, _offset: i64) -> VfsResult<u64> {
        Ok(data.len() as u64)
    }

    async fn sync_handle(&self, _id: HandleId) -> VfsResult<()> {
        Ok(())
    }
}
