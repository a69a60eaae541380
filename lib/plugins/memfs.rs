//! In-memory backend.
//!
//! The reference plugin: ephemeral, fully writable, and the only backend
//! guaranteed to implement every optional operation. Used for scratch
//! mounts and as the baseline for conformance tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;

use crate::error::{VfsError, VfsResult};
use crate::path;
use crate::plugin::{ByteStream, Capability, Plugin, PluginHandle};
use crate::types::{ConfigParam, FileInfo, FileKind, OpenFlag, WriteFlag};

/// Chunk size yielded by `open_stream`.
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum MemNode {
    File {
        data: Vec<u8>,
        mode: u32,
        mtime: SystemTime,
    },
    Directory {
        mode: u32,
        mtime: SystemTime,
    },
}

impl MemNode {
    fn file(data: Vec<u8>, mode: u32) -> Self {
        Self::File {
            data,
            mode,
            mtime: SystemTime::now(),
        }
    }

    fn dir(mode: u32) -> Self {
        Self::Directory {
            mode,
            mtime: SystemTime::now(),
        }
    }

    fn info(&self, name: &str) -> FileInfo {
        match self {
            Self::File { data, mode, mtime } => FileInfo {
                name: name.to_owned(),
                size: data.len() as u64,
                mode: *mode,
                mtime: *mtime,
                kind: FileKind::File,
                meta: None,
            },
            Self::Directory { mode, mtime } => FileInfo {
                name: name.to_owned(),
                size: 0,
                mode: *mode,
                mtime: *mtime,
                kind: FileKind::Directory,
                meta: None,
            },
        }
    }
}

type NodeMap = HashMap<String, MemNode>;

/// Ephemeral in-memory plugin instance.
pub struct MemFs {
    name: String,
    nodes: Arc<RwLock<NodeMap>>,
}

impl MemFs {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = NodeMap::default();
        nodes.insert("/".to_owned(), MemNode::dir(0o755));
        Self {
            name: name.into(),
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    fn ensure_parents(nodes: &mut NodeMap, file_path: &str) {
        let mut dir = String::new();
        for comp in path::components(path::parent(file_path)) {
            dir.push('/');
            dir.push_str(comp);
            nodes
                .entry(dir.clone())
                .or_insert_with(|| MemNode::dir(0o755));
        }
    }

    fn read_slice(data: &[u8], offset: u64, size: i64) -> Bytes {
        let start = (offset as usize).min(data.len());
        let end = if size < 0 {
            data.len()
        } else {
            (start + size as usize).min(data.len())
        };
        Bytes::copy_from_slice(&data[start..end])
    }

    fn write_at(
        nodes: &mut NodeMap,
        p: &str,
        bytes: &[u8],
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        match nodes.get(p) {
            Some(MemNode::Directory { .. }) => return Err(VfsError::is_a_directory(p)),
            Some(MemNode::File { .. }) => {
                if flags.contains(WriteFlag::EXCLUSIVE) {
                    return Err(VfsError::already_exists(p));
                }
            }
            None => {
                if !flags.contains(WriteFlag::CREATE) {
                    return Err(VfsError::not_found(p));
                }
                Self::ensure_parents(nodes, p);
                nodes.insert(p.to_owned(), MemNode::file(Vec::new(), 0o644));
            }
        }

        let Some(MemNode::File { data, mtime, .. }) = nodes.get_mut(p) else {
            return Err(VfsError::not_found(p));
        };
        if flags.contains(WriteFlag::TRUNCATE) {
            data.clear();
        }
        let at = if flags.contains(WriteFlag::APPEND) || offset < 0 {
            data.len()
        } else {
            offset as usize
        };
        if at + bytes.len() > data.len() {
            data.resize(at + bytes.len(), 0);
        }
        data[at..at + bytes.len()].copy_from_slice(bytes);
        *mtime = SystemTime::now();
        Ok(bytes.len() as u64)
    }
}

#[async_trait]
impl Plugin for MemFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capability {
        Capability::WRITABLE | Capability::HANDLES | Capability::STREAMING
    }

    fn config_params(&self) -> &'static [ConfigParam] {
        &[]
    }

    async fn stat(&self, p: &str) -> VfsResult<FileInfo> {
        let nodes = self.nodes.read().expect("memfs lock poisoned");
        nodes
            .get(p)
            .map(|n| n.info(path::leaf(p)))
            .ok_or_else(|| VfsError::not_found(p))
    }

    async fn readdir(&self, p: &str) -> VfsResult<Vec<FileInfo>> {
        let nodes = self.nodes.read().expect("memfs lock poisoned");
        match nodes.get(p) {
            Some(MemNode::Directory { .. }) => {}
            Some(MemNode::File { .. }) => return Err(VfsError::not_a_directory(p)),
            None => return Err(VfsError::not_found(p)),
        }
        let mut out = Vec::new();
        for (child, node) in nodes.iter() {
            if child != p && path::parent(child) == p {
                out.push(node.info(path::leaf(child)));
            }
        }
        Ok(out)
    }

    async fn read(&self, p: &str, offset: u64, size: i64) -> VfsResult<Bytes> {
        let nodes = self.nodes.read().expect("memfs lock poisoned");
        match nodes.get(p) {
            Some(MemNode::File { data, .. }) => Ok(Self::read_slice(data, offset, size)),
            Some(MemNode::Directory { .. }) => Err(VfsError::is_a_directory(p)),
            None => Err(VfsError::not_found(p)),
        }
    }

    async fn write(
        &self,
        p: &str,
        data: Bytes,
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        Self::write_at(&mut nodes, p, &data, offset, flags)
    }

    async fn create(&self, p: &str) -> VfsResult<()> {
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        if nodes.contains_key(p) {
            return Err(VfsError::already_exists(p));
        }
        Self::ensure_parents(&mut nodes, p);
        nodes.insert(p.to_owned(), MemNode::file(Vec::new(), 0o644));
        Ok(())
    }

    async fn mkdir(&self, p: &str, mode: u32) -> VfsResult<()> {
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        match nodes.get(p) {
            Some(MemNode::Directory { .. }) => return Ok(()),
            Some(MemNode::File { .. }) => return Err(VfsError::already_exists(p)),
            None => {}
        }
        Self::ensure_parents(&mut nodes, p);
        nodes.insert(p.to_owned(), MemNode::dir(mode));
        Ok(())
    }

    async fn remove(&self, p: &str) -> VfsResult<()> {
        if p == "/" {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        match nodes.get(p) {
            Some(MemNode::Directory { .. }) => {
                let has_children = nodes.keys().any(|k| k != p && path::parent(k) == p);
                if has_children {
                    return Err(VfsError::invalid_argument(format!(
                        "directory {p} not empty"
                    )));
                }
            }
            Some(MemNode::File { .. }) => {}
            None => return Err(VfsError::not_found(p)),
        }
        nodes.remove(p);
        Ok(())
    }

    async fn remove_all(&self, p: &str) -> VfsResult<()> {
        if p == "/" {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        if !nodes.contains_key(p) {
            return Err(VfsError::not_found(p));
        }
        nodes.retain(|k, _| k != p && !path::is_under(k, p));
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        let node = nodes
            .remove(old)
            .ok_or_else(|| VfsError::not_found(old))?;
        if matches!(node, MemNode::Directory { .. }) {
            let children: Vec<String> = nodes
                .keys()
                .filter(|k| path::is_under(k, old))
                .cloned()
                .collect();
            for child in children {
                if let Some(moved) = nodes.remove(&child) {
                    let rel = &child[old.len()..];
                    nodes.insert(format!("{new}{rel}"), moved);
                }
            }
        }
        Self::ensure_parents(&mut nodes, new);
        nodes.insert(new.to_owned(), node);
        Ok(())
    }

    async fn chmod(&self, p: &str, new_mode: u32) -> VfsResult<()> {
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        match nodes.get_mut(p) {
            Some(MemNode::File { mode, .. }) | Some(MemNode::Directory { mode, .. }) => {
                *mode = new_mode;
                Ok(())
            }
            None => Err(VfsError::not_found(p)),
        }
    }

    async fn truncate(&self, p: &str, size: u64) -> VfsResult<()> {
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        match nodes.get_mut(p) {
            Some(MemNode::File { data, mtime, .. }) => {
                if data.len() as u64 != size {
                    data.resize(size as usize, 0);
                    *mtime = SystemTime::now();
                }
                Ok(())
            }
            Some(MemNode::Directory { .. }) => Err(VfsError::is_a_directory(p)),
            None => Err(VfsError::not_found(p)),
        }
    }

    async fn open_stream(&self, p: &str) -> VfsResult<ByteStream> {
        let data = self.read(p, 0, -1).await?;
        let chunks: Vec<VfsResult<Bytes>> = data
            .chunks(STREAM_CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn open_handle(
        &self,
        p: &str,
        flags: OpenFlag,
        _mode: u32,
    ) -> VfsResult<Arc<dyn PluginHandle>> {
        let flags = flags.validate()?;
        {
            let mut nodes = self.nodes.write().expect("memfs lock poisoned");
            match nodes.get(p) {
                Some(MemNode::Directory { .. }) => return Err(VfsError::is_a_directory(p)),
                Some(MemNode::File { .. }) => {
                    if flags.contains(OpenFlag::EXCLUSIVE) {
                        return Err(VfsError::already_exists(p));
                    }
                    if flags.contains(OpenFlag::TRUNCATE) {
                        if let Some(MemNode::File { data, mtime, .. }) = nodes.get_mut(p) {
                            data.clear();
                            *mtime = SystemTime::now();
                        }
                    }
                }
                None => {
                    if !flags.contains(OpenFlag::CREATE) {
                        return Err(VfsError::not_found(p));
                    }
                    Self::ensure_parents(&mut nodes, p);
                    nodes.insert(p.to_owned(), MemNode::file(Vec::new(), 0o644));
                }
            }
        }
        Ok(Arc::new(MemHandle {
            nodes: Arc::clone(&self.nodes),
            path: p.to_owned(),
            flags,
        }))
    }
}

/// A path-pinned cursor into the shared node map.
struct MemHandle {
    nodes: Arc<RwLock<NodeMap>>,
    path: String,
    flags: OpenFlag,
}

impl std::fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemHandle")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .finish()
    }
}

#[async_trait]
impl PluginHandle for MemHandle {
    async fn read_at(&self, offset: u64, size: i64) -> VfsResult<Bytes> {
        let nodes = self.nodes.read().expect("memfs lock poisoned");
        match nodes.get(&self.path) {
            Some(MemNode::File { data, .. }) => Ok(MemFs::read_slice(data, offset, size)),
            Some(MemNode::Directory { .. }) => Err(VfsError::is_a_directory(&self.path)),
            None => Err(VfsError::not_found(&self.path)),
        }
    }

    async fn write_at(&self, data: Bytes, offset: i64) -> VfsResult<u64> {
        let mut write_flags = WriteFlag::empty();
        if self.flags.contains(OpenFlag::APPEND) {
            write_flags |= WriteFlag::APPEND;
        }
        let mut nodes = self.nodes.write().expect("memfs lock poisoned");
        MemFs::write_at(&mut nodes, &self.path, &data, offset, write_flags)
    }

    async fn sync(&self) -> VfsResult<()> {
        Ok(())
    }

    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.nodes.read().expect("memfs lock poisoned");
        f.debug_struct("MemFs")
            .field("name", &self.name)
            .field("nodes", &nodes.len())
            .finish()
    }
}
