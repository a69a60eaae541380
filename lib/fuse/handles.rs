//! Client-side handle records for the FUSE gateway.
//!
//! Every kernel file handle maps to one of two variants:
//!
//! - `Remote` wraps a server-issued handle id; reads and writes go
//!   through the stateful handle operations.
//! - `Local` is the fallback for backends without handle support. Its
//!   read path fetches the entire payload once and serves every offset
//!   read from that buffer until release, preserving the
//!   one-open-one-payload contract of per-read virtual files. Its write
//!   path forwards each write directly to the stateless `write`, so
//!   queue-like endpoints see one operation per write.

use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::fuse::client::VfsClient;
use crate::handle::HandleId;
use crate::types::{OpenFlag, WriteFlag};

/// How an open file reaches the server.
#[derive(Debug)]
pub enum HandleKind {
    /// Server-side handle.
    Remote { id: HandleId },
    /// Stateless fallback; `buffer` holds the first full read.
    Local { buffer: Option<Bytes> },
}

/// One open kernel file.
#[derive(Debug)]
pub struct HandleRecord {
    pub kind: HandleKind,
    pub path: String,
    pub flags: OpenFlag,
    pub mode: u32,
}

impl HandleRecord {
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.kind, HandleKind::Local { .. })
    }
}

/// Maps kernel file-handle numbers to handle records.
pub struct HandleBridge<C: VfsClient> {
    client: Arc<C>,
    records: FxHashMap<u64, HandleRecord>,
    next_fh: u64,
}

impl<C: VfsClient> HandleBridge<C> {
    #[must_use]
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            records: FxHashMap::default(),
            next_fh: 1,
        }
    }

    /// Open `path`, preferring a server handle and falling back to a
    /// LOCAL record when the backend does not support handles.
    pub async fn open(&mut self, path: &str, flags: OpenFlag, mode: u32) -> VfsResult<u64> {
        let kind = match self.client.open_handle(path, flags, mode).await {
            Ok(grant) => {
                debug!(path, id = grant.id, "opened remote handle");
                HandleKind::Remote { id: grant.id }
            }
            Err(VfsError::NotSupported(_)) => {
                debug!(path, "backend lacks handles, using local record");
                HandleKind::Local { buffer: None }
            }
            Err(e) => return Err(e),
        };

        let fh = self.next_fh;
        self.next_fh += 1;
        self.records.insert(
            fh,
            HandleRecord {
                kind,
                path: path.to_owned(),
                flags,
                mode,
            },
        );
        Ok(fh)
    }

    fn record(&self, fh: u64) -> VfsResult<&HandleRecord> {
        self.records
            .get(&fh)
            .ok_or_else(|| VfsError::not_found(format!("file handle {fh}")))
    }

    /// Read through the record.
    ///
    /// LOCAL reads fill the buffer on first use with one whole-payload
    /// read and slice out of it afterwards.
    pub async fn read(&mut self, fh: u64, offset: u64, size: u32) -> VfsResult<Bytes> {
        enum Plan {
            Remote(HandleId),
            Buffered(Bytes),
            FirstFetch(String),
        }

        let plan = {
            let record = self.record(fh)?;
            match &record.kind {
                HandleKind::Remote { id } => Plan::Remote(*id),
                HandleKind::Local { buffer: Some(buf) } => Plan::Buffered(buf.clone()),
                HandleKind::Local { buffer: None } => Plan::FirstFetch(record.path.clone()),
            }
        };

        match plan {
            Plan::Remote(id) => self.client.read_handle(id, offset, i64::from(size)).await,
            Plan::Buffered(buf) => Ok(slice(&buf, offset, size)),
            Plan::FirstFetch(path) => {
                let data = self.client.read(&path, 0, -1).await?;
                // The handle may have been released while we fetched.
                if let Some(record) = self.records.get_mut(&fh) {
                    if let HandleKind::Local { buffer } = &mut record.kind {
                        *buffer = Some(data.clone());
                    }
                }
                Ok(slice(&data, offset, size))
            }
        }
    }

    /// Write through the record. LOCAL writes forward a full replace to
    /// the stateless write path.
    pub async fn write(&mut self, fh: u64, data: Bytes, offset: i64) -> VfsResult<u64> {
        let record = self.record(fh)?;
        match &record.kind {
            HandleKind::Remote { id } => self.client.write_handle(*id, data, offset).await,
            HandleKind::Local { .. } => {
                let path = record.path.clone();
                let len = data.len() as u64;
                self.client
                    .write(
                        &path,
                        data,
                        0,
                        WriteFlag::CREATE | WriteFlag::TRUNCATE,
                    )
                    .await?;
                Ok(len)
            }
        }
    }

    /// Flush a remote handle; LOCAL records have nothing buffered
    /// server-side.
    pub async fn sync(&mut self, fh: u64) -> VfsResult<()> {
        match &self.record(fh)?.kind {
            HandleKind::Remote { id } => self.client.sync_handle(*id).await,
            HandleKind::Local { .. } => Ok(()),
        }
    }

    /// Release a handle. The record is removed first, so a racing second
    /// release observes not-found rather than a second server close.
    pub async fn release(&mut self, fh: u64) -> VfsResult<()> {
        let record = self
            .records
            .remove(&fh)
            .ok_or_else(|| VfsError::not_found(format!("file handle {fh}")))?;
        match record.kind {
            HandleKind::Remote { id } => self.client.close_handle(id).await,
            HandleKind::Local { .. } => Ok(()),
        }
    }

    /// Close every record (unmount path). Server close errors are
    /// returned after the sweep finishes.
    pub async fn release_all(&mut self) -> VfsResult<()> {
        let records: Vec<HandleRecord> =
            std::mem::take(&mut self.records).into_values().collect();
        let mut last_err = None;
        for record in records {
            if let HandleKind::Remote { id } = record.kind {
                if let Err(e) = self.client.close_handle(id).await {
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Whether `fh` is a LOCAL record (primarily for tests).
    #[must_use]
    pub fn is_local(&self, fh: u64) -> bool {
        self.records.get(&fh).is_some_and(HandleRecord::is_local)
    }
}

fn slice(data: &Bytes, offset: u64, size: u32) -> Bytes {
    let start = (offset as usize).min(data.len());
    let end = (start + size as usize).min(data.len());
    data.slice(start..end)
}
