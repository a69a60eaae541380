//! Local-disk backend.
//!
//! Serves a subtree of the host filesystem, jailed under a configured
//! root directory. This is the simplest external backend: every operation
//! maps onto `tokio::fs`, and handles wrap real open files.

use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use crate::error::{VfsError, VfsResult};
use crate::path;
use crate::plugin::{Capability, Plugin, PluginHandle};
use crate::types::{ConfigParam, FileInfo, FileKind, OpenFlag, WriteFlag};

static CONFIG_PARAMS: &[ConfigParam] = &[ConfigParam {
    name: "root",
    required: true,
    description: "Host directory this mount serves",
}];

/// Plugin over a host directory.
pub struct LocalFs {
    name: String,
    root: PathBuf,
}

impl LocalFs {
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Map a backend-relative path into the jail.
    ///
    /// The dispatcher hands us normalised paths, but direct callers may
    /// not; reject anything that could climb out of the root.
    fn full_path(&self, rel: &str) -> VfsResult<PathBuf> {
        let mut full = self.root.clone();
        for comp in path::components(rel) {
            if comp == ".." || comp == "." {
                return Err(VfsError::permission_denied(format!(
                    "path {rel} escapes backend root"
                )));
            }
            full.push(comp);
        }
        Ok(full)
    }

    async fn info_for(p: &Path, name: &str) -> VfsResult<FileInfo> {
        let meta = tokio::fs::symlink_metadata(p).await?;
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };
        Ok(FileInfo {
            name: name.to_owned(),
            size: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            kind,
            meta: None,
        })
    }

    async fn read_from(file: &mut tokio::fs::File, offset: u64, size: i64) -> VfsResult<Bytes> {
        file.seek(SeekFrom::Start(offset)).await?;
        if size < 0 {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).await?;
            return Ok(buf.into());
        }
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.into())
    }
}

#[async_trait]
impl Plugin for LocalFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capability {
        Capability::WRITABLE | Capability::HANDLES
    }

    fn config_params(&self) -> &'static [ConfigParam] {
        CONFIG_PARAMS
    }

    async fn stat(&self, rel: &str) -> VfsResult<FileInfo> {
        let full = self.full_path(rel)?;
        Self::info_for(&full, path::leaf(rel)).await
    }

    async fn readdir(&self, rel: &str) -> VfsResult<Vec<FileInfo>> {
        let full = self.full_path(rel)?;
        let meta = tokio::fs::metadata(&full).await?;
        if !meta.is_dir() {
            return Err(VfsError::not_a_directory(rel));
        }
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(Self::info_for(&entry.path(), &name).await?);
        }
        Ok(entries)
    }

    async fn read(&self, rel: &str, offset: u64, size: i64) -> VfsResult<Bytes> {
        let full = self.full_path(rel)?;
        let meta = tokio::fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(VfsError::is_a_directory(rel));
        }
        let mut file = tokio::fs::File::open(&full).await?;
        Self::read_from(&mut file, offset, size).await
    }

    async fn write(
        &self,
        rel: &str,
        data: Bytes,
        offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        let full = self.full_path(rel)?;
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true)
            .create(flags.contains(WriteFlag::CREATE))
            .create_new(flags.contains(WriteFlag::EXCLUSIVE))
            .truncate(flags.contains(WriteFlag::TRUNCATE))
            .append(flags.contains(WriteFlag::APPEND) || offset < 0);
        let mut file = opts.open(&full).await?;

        if !flags.contains(WriteFlag::APPEND) && offset >= 0 {
            file.seek(SeekFrom::Start(offset as u64)).await?;
        }
        file.write_all(&data).await?;
        if flags.contains(WriteFlag::SYNC) {
            file.sync_all().await?;
        }
        Ok(data.len() as u64)
    }

    async fn create(&self, rel: &str) -> VfsResult<()> {
        let full = self.full_path(rel)?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await?;
        Ok(())
    }

    async fn mkdir(&self, rel: &str, mode: u32) -> VfsResult<()> {
        let full = self.full_path(rel)?;
        match tokio::fs::create_dir(&full).await {
            Ok(()) => {
                let perms = std::fs::Permissions::from_mode(mode);
                tokio::fs::set_permissions(&full, perms).await?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let meta = tokio::fs::metadata(&full).await?;
                if meta.is_dir() {
                    Ok(())
                } else {
                    Err(VfsError::already_exists(rel))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, rel: &str) -> VfsResult<()> {
        let full = self.full_path(rel)?;
        let meta = tokio::fs::symlink_metadata(&full).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn remove_all(&self, rel: &str) -> VfsResult<()> {
        let full = self.full_path(rel)?;
        let meta = tokio::fs::symlink_metadata(&full).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let from = self.full_path(old)?;
        let to = self.full_path(new)?;
        tokio::fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn chmod(&self, rel: &str, mode: u32) -> VfsResult<()> {
        let full = self.full_path(rel)?;
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(&full, perms).await?;
        Ok(())
    }

    async fn truncate(&self, rel: &str, size: u64) -> VfsResult<()> {
        let full = self.full_path(rel)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&full)
            .await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn open_handle(
        &self,
        rel: &str,
        flags: OpenFlag,
        _mode: u32,
    ) -> VfsResult<Arc<dyn PluginHandle>> {
        let flags = flags.validate()?;
        let full = self.full_path(rel)?;
        let mut opts = tokio::fs::OpenOptions::new();
        opts.read(true)
            .write(flags.contains(OpenFlag::WRITE))
            .create(flags.contains(OpenFlag::CREATE))
            .create_new(flags.contains(OpenFlag::EXCLUSIVE))
            .truncate(flags.contains(OpenFlag::TRUNCATE))
            .append(flags.contains(OpenFlag::APPEND));
        let file = opts.open(&full).await?;
        Ok(Arc::new(LocalHandle {
            file: tokio::sync::Mutex::new(file),
            append: flags.contains(OpenFlag::APPEND),
        }))
    }
}

/// An open host file behind a mutex; the handle manager serialises
/// nothing, so offset seeks must be atomic with their read/write.
struct LocalHandle {
    file: tokio::sync::Mutex<tokio::fs::File>,
    append: bool,
}

impl std::fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandle")
            .field("append", &self.append)
            .finish()
    }
}

#[async_trait]
impl PluginHandle for LocalHandle {
    async fn read_at(&self, offset: u64, size: i64) -> VfsResult<Bytes> {
        let mut file = self.file.lock().await;
        LocalFs::read_from(&mut file, offset, size).await
    }

    async fn write_at(&self, data: Bytes, offset: i64) -> VfsResult<u64> {
        let mut file = self.file.lock().await;
        if self.append || offset < 0 {
            file.seek(SeekFrom::End(0)).await?;
        } else {
            file.seek(SeekFrom::Start(offset as u64)).await?;
        }
        file.write_all(&data).await?;
        Ok(data.len() as u64)
    }

    async fn sync(&self) -> VfsResult<()> {
        let file = self.file.lock().await;
        file.sync_all().await?;
        Ok(())
    }

    async fn close(&self) -> VfsResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFs")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish()
    }
}
