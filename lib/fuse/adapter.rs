//! The `fuser::Filesystem` implementation.
//!
//! Kernel callbacks are synchronous; every core operation is bridged onto
//! the tokio runtime with `block_on`. The adapter owns the inode tree the
//! kernel expects (nodes carry parent, name, and lookup count — never
//! attributes; those live in the TTL caches) plus the handle bridge and
//! both caches. Files are opened with `FOPEN_DIRECT_IO` so the kernel
//! page cache never interferes with per-read virtual files.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fuser::consts::FOPEN_DIRECT_IO;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, warn};

use crate::error::{ErrorKind, VfsError, VfsResult};
use crate::fuse::cache::{AttrCache, DirCache, DEFAULT_TTL};
use crate::fuse::client::VfsClient;
use crate::fuse::handles::HandleBridge;
use crate::path;
use crate::types::{FileInfo, FileKind, OpenFlag};

/// TTL handed to the kernel for entries and attributes. Low on purpose:
/// the bridge's own caches absorb the traffic, and a higher kernel TTL
/// would need inval notifications to stay correct.
const KERNEL_TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// Map an error kind onto the errno the kernel expects.
fn errno_of(e: &VfsError) -> i32 {
    match e.kind() {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::IsADirectory => libc::EISDIR,
        ErrorKind::NotADirectory => libc::ENOTDIR,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::ReadOnly => libc::EROFS,
        ErrorKind::InvalidArgument => libc::EINVAL,
        ErrorKind::NotSupported => libc::ENOSYS,
        ErrorKind::CapacityExceeded
        | ErrorKind::LeaseExpired
        | ErrorKind::SymlinkLoop
        | ErrorKind::Io
        | ErrorKind::Other => libc::EIO,
    }
}

/// Abstracts the `.error(errno)` method common to fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
    fuser::ReplyEmpty,
);

/// Centralises the error-logging + errno-reply path so each callback only
/// expresses its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for VfsResult<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(errno_of(&e));
            }
        }
    }
}

fn fuse_kind(kind: FileKind) -> fuser::FileType {
    match kind {
        FileKind::File => fuser::FileType::RegularFile,
        FileKind::Directory => fuser::FileType::Directory,
        FileKind::Symlink => fuser::FileType::Symlink,
    }
}

const BLOCK_SIZE: u32 = 4096;

fn to_fuse_attr(ino: u64, info: &FileInfo, owner: (u32, u32)) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: info.size,
        blocks: info.size.div_ceil(512),
        atime: info.mtime,
        mtime: info.mtime,
        ctime: info.mtime,
        crtime: SystemTime::UNIX_EPOCH,
        kind: fuse_kind(info.kind),
        perm: (info.mode & 0o7777) as u16,
        nlink: 1,
        uid: owner.0,
        gid: owner.1,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Translate the kernel's raw open(2) flags.
fn open_flags_from(raw: i32) -> OpenFlag {
    let mut flags = match raw & libc::O_ACCMODE {
        libc::O_WRONLY => OpenFlag::WRITE,
        libc::O_RDWR => OpenFlag::READ | OpenFlag::WRITE,
        _ => OpenFlag::READ,
    };
    if raw & libc::O_APPEND != 0 {
        flags |= OpenFlag::APPEND;
    }
    if raw & libc::O_CREAT != 0 {
        flags |= OpenFlag::CREATE;
    }
    if raw & libc::O_EXCL != 0 {
        flags |= OpenFlag::EXCLUSIVE;
    }
    if raw & libc::O_TRUNC != 0 {
        flags |= OpenFlag::TRUNCATE;
    }
    if raw & libc::O_SYNC != 0 {
        flags |= OpenFlag::SYNC;
    }
    flags
}

/// One node in the kernel-visible inode tree. Carries no attributes.
struct Node {
    parent: u64,
    name: String,
    children: FxHashMap<String, u64>,
    nlookup: u64,
}

/// The FUSE gateway: bridges kernel VFS calls onto a [`VfsClient`].
pub struct FuseGateway<C: VfsClient> {
    client: Arc<C>,
    runtime: tokio::runtime::Handle,
    nodes: FxHashMap<u64, Node>,
    next_ino: u64,
    handles: HandleBridge<C>,
    attrs: AttrCache,
    dirs: DirCache,
    owner: (u32, u32),
}

impl<C: VfsClient> FuseGateway<C> {
    /// Build a gateway over `client`, blocking on `runtime` for async
    /// work. `owner` is the uid/gid every entry is presented as.
    #[must_use]
    pub fn new(client: Arc<C>, runtime: tokio::runtime::Handle, owner: (u32, u32)) -> Self {
        Self::with_ttl(client, runtime, owner, DEFAULT_TTL)
    }

    /// Like [`new`](Self::new) with an explicit cache TTL.
    #[must_use]
    pub fn with_ttl(
        client: Arc<C>,
        runtime: tokio::runtime::Handle,
        owner: (u32, u32),
        ttl: Duration,
    ) -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(
            ROOT_INO,
            Node {
                parent: ROOT_INO,
                name: String::new(),
                children: FxHashMap::default(),
                nlookup: 0,
            },
        );
        Self {
            handles: HandleBridge::new(Arc::clone(&client)),
            client,
            runtime,
            nodes,
            next_ino: ROOT_INO + 1,
            attrs: AttrCache::new(ttl),
            dirs: DirCache::new(ttl),
            owner,
        }
    }

    /// Full namespace path of an inode, walked up through the tree.
    fn node_path(&self, ino: u64) -> VfsResult<String> {
        if ino == ROOT_INO {
            return Ok("/".to_owned());
        }
        let mut parts = Vec::new();
        let mut current = ino;
        while current != ROOT_INO {
            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| VfsError::not_found(format!("inode {current}")))?;
            parts.push(node.name.clone());
            current = node.parent;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> VfsResult<String> {
        let name = name
            .to_str()
            .ok_or_else(|| VfsError::invalid_argument("non-UTF-8 name"))?;
        Ok(path::join(&self.node_path(parent)?, name))
    }

    /// Find or create the child node, without touching its lookup count.
    fn ensure_child(&mut self, parent: u64, name: &str) -> u64 {
        if let Some(node) = self.nodes.get(&parent) {
            if let Some(&ino) = node.children.get(name) {
                return ino;
            }
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            Node {
                parent,
                name: name.to_owned(),
                children: FxHashMap::default(),
                nlookup: 0,
            },
        );
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.insert(name.to_owned(), ino);
        }
        ino
    }

    /// Register one kernel reference against a child node.
    fn track_child(&mut self, parent: u64, name: &str) -> u64 {
        let ino = self.ensure_child(parent, name);
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.nlookup += 1;
        }
        ino
    }

    fn forget_node(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let remove = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.nlookup = node.nlookup.saturating_sub(nlookup);
                node.nlookup == 0
            }
            None => false,
        };
        if remove {
            if let Some(node) = self.nodes.remove(&ino) {
                if let Some(parent) = self.nodes.get_mut(&node.parent) {
                    parent.children.remove(&node.name);
                }
            }
        }
    }

    /// Stat through the attribute cache.
    async fn cached_stat(&self, p: &str) -> VfsResult<FileInfo> {
        if let Some(info) = self.attrs.get(p).await {
            return Ok(info);
        }
        let info = self.client.stat(p).await?;
        self.attrs.insert(p, info.clone()).await;
        Ok(info)
    }

    /// List through the directory cache, warming child attributes.
    async fn cached_readdir(&self, p: &str) -> VfsResult<Vec<FileInfo>> {
        if let Some(listing) = self.dirs.get(p).await {
            return Ok(listing);
        }
        let listing = self.client.readdir(p).await?;
        for info in &listing {
            self.attrs
                .insert(&path::join(p, &info.name), info.clone())
                .await;
        }
        self.dirs.insert(p, listing.clone()).await;
        Ok(listing)
    }

    /// Drop cached state for a mutated path: its attributes and its
    /// parent's listing.
    async fn invalidate(&self, p: &str) {
        self.attrs.invalidate(p).await;
        self.dirs.invalidate(path::parent(p)).await;
    }

    /// The number of live inode tree nodes (for tests).
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<C: VfsClient> fuser::Filesystem for FuseGateway<C> {
    #[instrument(name = "FuseGateway::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let owner = self.owner;
        let runtime = self.runtime.clone();
        let result = runtime.block_on(async {
            let p = self.child_path(parent, name)?;
            let info = self.cached_stat(&p).await?;
            Ok::<_, VfsError>((p, info))
        });
        match result {
            Ok((p, info)) => {
                let ino = self.track_child(parent, path::leaf(&p));
                reply.entry(&KERNEL_TTL, &to_fuse_attr(ino, &info, owner), 0);
            }
            Err(e) => {
                debug!(error = %e, "lookup failed");
                reply.error(errno_of(&e));
            }
        }
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.forget_node(ino, nlookup);
    }

    #[instrument(name = "FuseGateway::getattr", skip(self, _req, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let owner = self.owner;
        let runtime = self.runtime.clone();
        runtime
            .block_on(async {
                let p = self.node_path(ino)?;
                self.cached_stat(&p).await
            })
            .fuse_reply(reply, |info, reply| {
                reply.attr(&KERNEL_TTL, &to_fuse_attr(ino, &info, owner));
            });
    }

    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let owner = self.owner;
        let runtime = self.runtime.clone();
        runtime
            .block_on(async {
                let p = self.node_path(ino)?;
                if let Some(mode) = mode {
                    self.client.chmod(&p, mode).await?;
                }
                if let Some(size) = size {
                    self.client.truncate(&p, size).await?;
                }
                self.invalidate(&p).await;
                self.cached_stat(&p).await
            })
            .fuse_reply(reply, |info, reply| {
                reply.attr(&KERNEL_TTL, &to_fuse_attr(ino, &info, owner));
            });
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let runtime = self.runtime.clone();
        runtime
            .block_on(async {
                let p = self.node_path(ino)?;
                self.client.readlink(&p).await
            })
            .fuse_reply(reply, |target, reply| reply.data(target.as_bytes()));
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let owner = self.owner;
        let runtime = self.runtime.clone();
        let result = runtime.block_on(async {
            let p = self.child_path(parent, name)?;
            self.client.mkdir(&p, mode).await?;
            self.invalidate(&p).await;
            let info = self.cached_stat(&p).await?;
            Ok::<_, VfsError>((p, info))
        });
        match result {
            Ok((p, info)) => {
                let ino = self.track_child(parent, path::leaf(&p));
                reply.entry(&KERNEL_TTL, &to_fuse_attr(ino, &info, owner), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        runtime
            .block_on(async {
                let p = self.child_path(parent, name)?;
                self.client.remove(&p).await?;
                self.invalidate(&p).await;
                Ok(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        runtime
            .block_on(async {
                let p = self.child_path(parent, name)?;
                self.client.remove(&p).await?;
                self.invalidate(&p).await;
                self.dirs.invalidate(&p).await;
                Ok(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        let owner = self.owner;
        let runtime = self.runtime.clone();
        let target = target.to_string_lossy().into_owned();
        let result = runtime.block_on(async {
            let p = self.child_path(parent, link_name)?;
            self.client.symlink(&p, &target).await?;
            self.invalidate(&p).await;
            let info = self.cached_stat(&p).await?;
            Ok::<_, VfsError>((p, info))
        });
        match result {
            Ok((p, info)) => {
                let ino = self.track_child(parent, path::leaf(&p));
                reply.entry(&KERNEL_TTL, &to_fuse_attr(ino, &info, owner), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        let result = runtime.block_on(async {
            let old = self.child_path(parent, name)?;
            let new = self.child_path(newparent, newname)?;
            self.client.rename(&old, &new).await?;
            self.invalidate(&old).await;
            self.invalidate(&new).await;
            self.dirs.invalidate(&old).await;
            Ok::<_, VfsError>(new)
        });
        match result {
            Ok(new) => {
                // Move the tree node under its new parent.
                let name = name.to_str().unwrap_or_default().to_owned();
                let moved = self
                    .nodes
                    .get_mut(&parent)
                    .and_then(|n| n.children.remove(&name));
                if let Some(ino) = moved {
                    let new_leaf = path::leaf(&new).to_owned();
                    if let Some(node) = self.nodes.get_mut(&ino) {
                        node.parent = newparent;
                        node.name = new_leaf.clone();
                    }
                    if let Some(np) = self.nodes.get_mut(&newparent) {
                        np.children.insert(new_leaf, ino);
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[instrument(name = "FuseGateway::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let oflags = open_flags_from(flags);
        let runtime = self.runtime.clone();
        let result = runtime.block_on(async {
            let p = self.node_path(ino)?;
            self.handles.open(&p, oflags, 0o644).await
        });
        // DIRECT_IO keeps the kernel from caching reads of virtual files
        // whose content changes per read.
        result.fuse_reply(reply, |fh, reply| reply.opened(fh, FOPEN_DIRECT_IO));
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let owner = self.owner;
        let oflags = open_flags_from(flags);
        let runtime = self.runtime.clone();
        let result = runtime.block_on(async {
            let p = self.child_path(parent, name)?;
            self.client.create(&p).await?;
            let fh = self.handles.open(&p, oflags, 0o644).await?;
            self.invalidate(&p).await;
            let info = self.cached_stat(&p).await?;
            Ok::<_, VfsError>((p, info, fh))
        });
        match result {
            Ok((p, info, fh)) => {
                let ino = self.track_child(parent, path::leaf(&p));
                reply.created(
                    &KERNEL_TTL,
                    &to_fuse_attr(ino, &info, owner),
                    0,
                    fh,
                    FOPEN_DIRECT_IO,
                );
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let runtime = self.runtime.clone();
        let offset = u64::try_from(offset).unwrap_or(0);
        runtime
            .block_on(async { self.handles.read(fh, offset, size).await })
            .fuse_reply(reply, |data, reply| reply.data(&data));
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let data = Bytes::copy_from_slice(data);
        let runtime = self.runtime.clone();
        runtime
            .block_on(async {
                let written = self.handles.write(fh, data, offset).await?;
                if let Ok(p) = self.node_path(ino) {
                    self.invalidate(&p).await;
                }
                Ok::<u32, VfsError>(written as u32)
            })
            .fuse_reply(reply, |written, reply| reply.written(written));
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        if let Err(e) = runtime.block_on(async { self.handles.release(fh).await }) {
            warn!(fh, error = %e, "release failed");
        }
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        runtime
            .block_on(async { self.handles.sync(fh).await })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuseGateway::readdir", skip(self, _req, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let runtime = self.runtime.clone();
        let listing = runtime.block_on(async {
            let p = self.node_path(ino)?;
            self.cached_readdir(&p).await
        });
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        let offset = usize::try_from(offset).unwrap_or(0);
        for (i, info) in listing.iter().enumerate().skip(offset) {
            let child_ino = self.ensure_child(ino, &info.name);
            let full = reply.add(child_ino, (i + 1) as i64, fuse_kind(info.kind), &info.name);
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        // Virtual filesystem: report block counts as zero, like any
        // synthetic mount.
        reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
    }

    fn destroy(&mut self) {
        let runtime = self.runtime.clone();
        if let Err(e) = runtime.block_on(async { self.handles.release_all().await }) {
            warn!(error = %e, "closing handles at unmount failed");
        }
    }
}
