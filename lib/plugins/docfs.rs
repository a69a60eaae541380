//! Document store with an asynchronous indexing pipeline.
//!
//! Layout within the mount:
//!
//! ```text
//! /                     README plus one directory per namespace
//! /<ns>/docs/<file>     documents, auto-indexed on write
//! /<ns>/.indexing       virtual file listing in-flight indexing work
//! ```
//!
//! Writing a document runs a synchronous phase (blob + metadata through
//! the [`DocumentIndex`] collaborator) and then enqueues a chunk-indexing
//! job on a bounded queue; a worker pool drains it. Indexing failures are
//! logged and never retried, and the in-flight marker is cleared whether
//! the job succeeds or fails. The `.indexing` file is regenerated on
//! every read, which is why this backend deliberately stays without
//! handle support: the FUSE bridge's LOCAL records give such virtual
//! files their one-open-one-payload semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest as _, Sha256};
use tracing::info;

use crate::error::{VfsError, VfsResult};
use crate::plugin::{Capability, Plugin};
use crate::types::{ConfigParam, FileInfo, FileMeta, GrepMatch, WriteFlag};
use crate::workqueue::WorkQueue;

static CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "workers",
        required: false,
        description: "Indexing worker count (default 4)",
    },
    ConfigParam {
        name: "queue-capacity",
        required: false,
        description: "Pending indexing task cap (default 100)",
    },
];

const README_NAME: &str = "README";
const INDEXING_NAME: &str = ".indexing";
const DOCS_DIR: &str = "docs";

const README: &str = "\
Document store with automatic indexing.

  mkdir <ns>                 create a namespace
  write <ns>/docs/<file>     store a document; it is indexed in the
                             background and becomes searchable
  read  <ns>/.indexing       see what is still being indexed
  grep  <ns> <query>         search indexed documents

Documents are deduplicated by content digest; writing identical content
under a second name skips re-indexing.
";

/// Opaque indexing collaborator: blob storage, chunking/embedding, and
/// search live behind this seam.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Synchronous phase of a write: persist the blob and its metadata.
    /// Returns `true` when content with this digest was already present,
    /// in which case chunk indexing is skipped.
    async fn prepare(
        &self,
        namespace: &str,
        digest: &str,
        name: &str,
        content: &Bytes,
    ) -> VfsResult<bool>;

    /// Asynchronous phase: chunk, embed, and store for search.
    async fn index_chunks(
        &self,
        namespace: &str,
        digest: &str,
        name: &str,
        content: &Bytes,
    ) -> VfsResult<()>;

    /// Fetch a stored blob.
    async fn fetch(&self, namespace: &str, digest: &str) -> VfsResult<Bytes>;

    /// Drop a document's blob and chunks.
    async fn delete(&self, namespace: &str, digest: &str) -> VfsResult<()>;

    /// Search a namespace, returning scored matches.
    async fn search(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> VfsResult<Vec<GrepMatch>>;
}

/// One queued chunk-indexing task.
#[derive(Debug, Clone)]
struct IndexJob {
    namespace: String,
    digest: String,
    name: String,
    content: Bytes,
}

#[derive(Debug, Clone)]
struct DocMeta {
    digest: String,
    size: u64,
    mtime: SystemTime,
}

/// Where in the plugin namespace a path points.
enum Loc<'a> {
    Root,
    Readme,
    Namespace(&'a str),
    DocsDir(&'a str),
    Doc(&'a str, &'a str),
    Indexing(&'a str),
}

struct DocInner {
    name: String,
    index: Arc<dyn DocumentIndex>,
    /// namespace -> file name -> metadata
    docs: RwLock<HashMap<String, HashMap<String, DocMeta>>>,
    /// (namespace, digest) -> file name, for `.indexing`
    indexing: Mutex<HashMap<(String, String), String>>,
}

impl DocInner {
    fn mark_indexing(&self, namespace: &str, digest: &str, file: &str) {
        self.indexing
            .lock()
            .expect("indexing status lock poisoned")
            .insert((namespace.to_owned(), digest.to_owned()), file.to_owned());
    }

    fn clear_indexing(&self, namespace: &str, digest: &str) {
        self.indexing
            .lock()
            .expect("indexing status lock poisoned")
            .remove(&(namespace.to_owned(), digest.to_owned()));
    }

    fn indexing_report(&self, namespace: &str) -> String {
        let status = self.indexing.lock().expect("indexing status lock poisoned");
        let mut entries: Vec<(&String, &String)> = status
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, digest), file)| (file, digest))
            .collect();
        if entries.is_empty() {
            return "idle\n".to_owned();
        }
        entries.sort();
        let mut out = format!("indexing {} file(s):\n", entries.len());
        for (file, digest) in entries {
            out.push_str(&format!("  {file} ({digest})\n"));
        }
        out
    }
}

/// Document-store plugin instance.
pub struct DocFs {
    inner: Arc<DocInner>,
    queue: WorkQueue<IndexJob>,
}

impl DocFs {
    /// Build an instance over the given collaborator.
    ///
    /// Zero worker/capacity values fall back to the queue defaults. Must
    /// be called on a tokio runtime.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        index: Arc<dyn DocumentIndex>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let inner = Arc::new(DocInner {
            name: name.into(),
            index,
            docs: RwLock::new(HashMap::new()),
            indexing: Mutex::new(HashMap::new()),
        });

        let handler_inner = Arc::clone(&inner);
        let queue = WorkQueue::new(queue_capacity, workers, move |job: IndexJob| {
            let inner = Arc::clone(&handler_inner);
            async move {
                let res = inner
                    .index
                    .index_chunks(&job.namespace, &job.digest, &job.name, &job.content)
                    .await;
                // Cleared whether indexing succeeded or not; the queue
                // worker logs the failure.
                inner.clear_indexing(&job.namespace, &job.digest);
                res
            }
        });

        Self { inner, queue }
    }

    /// Digests currently being indexed (for tests and status surfaces).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .indexing
            .lock()
            .expect("indexing status lock poisoned")
            .len()
    }

    fn digest_of(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }

    fn locate(rel: &str) -> VfsResult<Loc<'_>> {
        let comps: Vec<&str> = crate::path::components(rel).collect();
        match comps.as_slice() {
            [] => Ok(Loc::Root),
            [README_NAME] => Ok(Loc::Readme),
            [ns] => Ok(Loc::Namespace(ns)),
            [ns, INDEXING_NAME] => Ok(Loc::Indexing(ns)),
            [ns, DOCS_DIR] => Ok(Loc::DocsDir(ns)),
            [ns, DOCS_DIR, file] => Ok(Loc::Doc(ns, file)),
            _ => Err(VfsError::not_found(rel)),
        }
    }

    fn meta_block(&self) -> FileMeta {
        FileMeta {
            plugin: self.inner.name.clone(),
            type_tag: "document".to_owned(),
            content: Default::default(),
        }
    }

    fn namespace_exists(&self, ns: &str) -> bool {
        self.inner
            .docs
            .read()
            .expect("doc table lock poisoned")
            .contains_key(ns)
    }

    fn doc_meta(&self, ns: &str, file: &str) -> VfsResult<DocMeta> {
        self.inner
            .docs
            .read()
            .expect("doc table lock poisoned")
            .get(ns)
            .and_then(|files| files.get(file))
            .cloned()
            .ok_or_else(|| VfsError::not_found(format!("/{ns}/{DOCS_DIR}/{file}")))
    }

    /// Store a whole document: synchronous prepare, then enqueue the
    /// chunk-indexing job. The foreground path never blocks on a full
    /// queue.
    async fn store_document(&self, ns: &str, file: &str, content: Bytes) -> VfsResult<u64> {
        if !self.namespace_exists(ns) {
            return Err(VfsError::not_found(format!("namespace {ns}")));
        }
        let digest = Self::digest_of(&content);
        let already_indexed = self
            .inner
            .index
            .prepare(ns, &digest, file, &content)
            .await?;

        {
            let mut docs = self.inner.docs.write().expect("doc table lock poisoned");
            let files = docs.entry(ns.to_owned()).or_default();
            files.insert(
                file.to_owned(),
                DocMeta {
                    digest: digest.clone(),
                    size: content.len() as u64,
                    mtime: SystemTime::now(),
                },
            );
        }

        if already_indexed {
            info!(namespace = ns, file, "content already indexed, skipping chunks");
            return Ok(content.len() as u64);
        }

        self.inner.mark_indexing(ns, &digest, file);
        let job = IndexJob {
            namespace: ns.to_owned(),
            digest,
            name: file.to_owned(),
            content: content.clone(),
        };
        let inner = Arc::clone(&self.inner);
        self.queue.submit(job, move |job| {
            inner.clear_indexing(&job.namespace, &job.digest);
        });
        Ok(content.len() as u64)
    }
}

#[async_trait]
impl Plugin for DocFs {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn capabilities(&self) -> Capability {
        Capability::WRITABLE | Capability::GREP
    }

    fn config_params(&self) -> &'static [ConfigParam] {
        CONFIG_PARAMS
    }

    async fn stat(&self, rel: &str) -> VfsResult<FileInfo> {
        match Self::locate(rel)? {
            Loc::Root => Ok(FileInfo::directory("", 0o755)),
            Loc::Readme => Ok(FileInfo::file(README_NAME, README.len() as u64, 0o444)),
            Loc::Namespace(ns) => {
                if self.namespace_exists(ns) {
                    Ok(FileInfo::directory(ns, 0o755))
                } else {
                    Err(VfsError::not_found(rel))
                }
            }
            Loc::DocsDir(ns) => {
                if self.namespace_exists(ns) {
                    Ok(FileInfo::directory(DOCS_DIR, 0o755))
                } else {
                    Err(VfsError::not_found(rel))
                }
            }
            Loc::Indexing(ns) => {
                if !self.namespace_exists(ns) {
                    return Err(VfsError::not_found(rel));
                }
                let report = self.inner.indexing_report(ns);
                Ok(FileInfo::file(INDEXING_NAME, report.len() as u64, 0o444))
            }
            Loc::Doc(ns, file) => {
                let meta = self.doc_meta(ns, file)?;
                let mut info = FileInfo::file(file, meta.size, 0o644);
                info.mtime = meta.mtime;
                Ok(info.with_meta(self.meta_block()))
            }
        }
    }

    async fn readdir(&self, rel: &str) -> VfsResult<Vec<FileInfo>> {
        match Self::locate(rel)? {
            Loc::Root => {
                let docs = self.inner.docs.read().expect("doc table lock poisoned");
                let mut out = vec![FileInfo::file(README_NAME, README.len() as u64, 0o444)];
                for ns in docs.keys() {
                    out.push(FileInfo::directory(ns.clone(), 0o755));
                }
                Ok(out)
            }
            Loc::Namespace(ns) => {
                if !self.namespace_exists(ns) {
                    return Err(VfsError::not_found(rel));
                }
                let report = self.inner.indexing_report(ns);
                Ok(vec![
                    FileInfo::directory(DOCS_DIR, 0o755),
                    FileInfo::file(INDEXING_NAME, report.len() as u64, 0o444),
                ])
            }
            Loc::DocsDir(ns) => {
                let docs = self.inner.docs.read().expect("doc table lock poisoned");
                let files = docs
                    .get(ns)
                    .ok_or_else(|| VfsError::not_found(rel))?;
                Ok(files
                    .iter()
                    .map(|(name, meta)| {
                        let mut info = FileInfo::file(name.clone(), meta.size, 0o644);
                        info.mtime = meta.mtime;
                        info.with_meta(self.meta_block())
                    })
                    .collect())
            }
            Loc::Readme | Loc::Indexing(_) | Loc::Doc(..) => {
                Err(VfsError::not_a_directory(rel))
            }
        }
    }

    async fn read(&self, rel: &str, offset: u64, size: i64) -> VfsResult<Bytes> {
        let whole: Bytes = match Self::locate(rel)? {
            Loc::Readme => Bytes::from_static(README.as_bytes()),
            Loc::Indexing(ns) => {
                if !self.namespace_exists(ns) {
                    return Err(VfsError::not_found(rel));
                }
                Bytes::from(self.inner.indexing_report(ns))
            }
            Loc::Doc(ns, file) => {
                let meta = self.doc_meta(ns, file)?;
                self.inner.index.fetch(ns, &meta.digest).await?
            }
            Loc::Root | Loc::Namespace(_) | Loc::DocsDir(_) => {
                return Err(VfsError::is_a_directory(rel));
            }
        };

        let start = (offset as usize).min(whole.len());
        let end = if size < 0 {
            whole.len()
        } else {
            (start + size as usize).min(whole.len())
        };
        Ok(whole.slice(start..end))
    }

    /// Writes store the whole document; offsets are ignored because every
    /// write is an independent store-and-index operation.
    async fn write(
        &self,
        rel: &str,
        data: Bytes,
        _offset: i64,
        flags: WriteFlag,
    ) -> VfsResult<u64> {
        let Loc::Doc(ns, file) = Self::locate(rel)? else {
            return Err(VfsError::permission_denied(format!("{rel} is not writable")));
        };
        if flags.contains(WriteFlag::EXCLUSIVE) && self.doc_meta(ns, file).is_ok() {
            return Err(VfsError::already_exists(rel));
        }
        self.store_document(ns, file, data).await
    }

    async fn create(&self, rel: &str) -> VfsResult<()> {
        let Loc::Doc(ns, file) = Self::locate(rel)? else {
            return Err(VfsError::permission_denied(format!(
                "cannot create files at {rel}"
            )));
        };
        if self.doc_meta(ns, file).is_ok() {
            return Err(VfsError::already_exists(rel));
        }
        self.store_document(ns, file, Bytes::new()).await.map(|_| ())
    }

    async fn mkdir(&self, rel: &str, _mode: u32) -> VfsResult<()> {
        match Self::locate(rel)? {
            Loc::Namespace(ns) => {
                let mut docs = self.inner.docs.write().expect("doc table lock poisoned");
                docs.entry(ns.to_owned()).or_default();
                Ok(())
            }
            // docs/ exists implicitly with its namespace.
            Loc::DocsDir(ns) => {
                if self.namespace_exists(ns) {
                    Ok(())
                } else {
                    Err(VfsError::not_found(rel))
                }
            }
            _ => Err(VfsError::permission_denied(format!(
                "cannot mkdir at {rel}"
            ))),
        }
    }

    async fn remove(&self, rel: &str) -> VfsResult<()> {
        match Self::locate(rel)? {
            Loc::Doc(ns, file) => {
                let meta = self.doc_meta(ns, file)?;
                let last_reference = {
                    let mut docs =
                        self.inner.docs.write().expect("doc table lock poisoned");
                    let files = docs
                        .get_mut(ns)
                        .ok_or_else(|| VfsError::not_found(rel))?;
                    files.remove(file);
                    !files.values().any(|m| m.digest == meta.digest)
                };
                if last_reference {
                    self.inner.index.delete(ns, &meta.digest).await?;
                }
                Ok(())
            }
            Loc::Namespace(ns) => {
                let empty = self
                    .inner
                    .docs
                    .read()
                    .expect("doc table lock poisoned")
                    .get(ns)
                    .is_some_and(|files| files.is_empty());
                if !empty {
                    return Err(VfsError::invalid_argument(format!(
                        "namespace {ns} not empty"
                    )));
                }
                self.inner
                    .docs
                    .write()
                    .expect("doc table lock poisoned")
                    .remove(ns);
                Ok(())
            }
            _ => Err(VfsError::permission_denied(format!("cannot remove {rel}"))),
        }
    }

    async fn remove_all(&self, rel: &str) -> VfsResult<()> {
        match Self::locate(rel)? {
            Loc::Doc(..) => self.remove(rel).await,
            Loc::Namespace(ns) | Loc::DocsDir(ns) => {
                let files = {
                    let mut docs =
                        self.inner.docs.write().expect("doc table lock poisoned");
                    match docs.remove(ns) {
                        Some(files) => files,
                        None => return Err(VfsError::not_found(rel)),
                    }
                };
                let mut digests: Vec<String> =
                    files.into_values().map(|m| m.digest).collect();
                digests.sort();
                digests.dedup();
                for digest in digests {
                    self.inner.index.delete(ns, &digest).await?;
                }
                Ok(())
            }
            _ => Err(VfsError::permission_denied(format!("cannot remove {rel}"))),
        }
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let (Loc::Doc(old_ns, old_file), Loc::Doc(new_ns, new_file)) =
            (Self::locate(old)?, Self::locate(new)?)
        else {
            return Err(VfsError::invalid_argument(
                "only documents can be renamed",
            ));
        };
        if old_ns != new_ns {
            return Err(VfsError::invalid_argument(
                "rename across namespaces is not supported",
            ));
        }
        let mut docs = self.inner.docs.write().expect("doc table lock poisoned");
        let files = docs
            .get_mut(old_ns)
            .ok_or_else(|| VfsError::not_found(old))?;
        let meta = files
            .remove(old_file)
            .ok_or_else(|| VfsError::not_found(old))?;
        files.insert(new_file.to_owned(), meta);
        Ok(())
    }

    /// Documents carry no permission model.
    async fn chmod(&self, _rel: &str, _mode: u32) -> VfsResult<()> {
        Ok(())
    }

    async fn truncate(&self, rel: &str, size: u64) -> VfsResult<()> {
        let Loc::Doc(ns, file) = Self::locate(rel)? else {
            return Err(VfsError::not_supported("truncate"));
        };
        if size != 0 {
            return Err(VfsError::not_supported("partial truncate of a document"));
        }
        if self.doc_meta(ns, file).is_ok() {
            self.store_document(ns, file, Bytes::new()).await.map(|_| ())
        } else {
            Err(VfsError::not_found(rel))
        }
    }

    async fn grep(&self, rel: &str, query: &str, limit: usize) -> VfsResult<Vec<GrepMatch>> {
        let ns = match Self::locate(rel)? {
            Loc::Namespace(ns) | Loc::DocsDir(ns) | Loc::Doc(ns, _) => ns,
            Loc::Root | Loc::Readme | Loc::Indexing(_) => {
                return Err(VfsError::invalid_argument(
                    "search requires a namespace path",
                ));
            }
        };
        if !self.namespace_exists(ns) {
            return Err(VfsError::not_found(rel));
        }
        self.inner.index.search(ns, query, limit).await
    }

    async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

impl std::fmt::Debug for DocFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocFs")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// In-memory [`DocumentIndex`]: blob map plus naive token-overlap search.
///
/// Stands in for the blob-store/embedding/vector-database stack in tests
/// and scratch deployments; the plugin is oblivious to the difference.
#[derive(Default)]
pub struct InMemoryIndex {
    blobs: RwLock<HashMap<(String, String), Bytes>>,
    chunks: RwLock<HashMap<String, Vec<IndexedChunk>>>,
}

#[derive(Debug, Clone)]
struct IndexedChunk {
    digest: String,
    file: String,
    text: String,
}

/// Character window per chunk.
const CHUNK_SIZE: usize = 512;
/// Overlap between adjacent chunks.
const CHUNK_OVERLAP: usize = 50;

fn chunk_text(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + CHUNK_SIZE).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - CHUNK_OVERLAP;
    }
    chunks
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentIndex for InMemoryIndex {
    async fn prepare(
        &self,
        namespace: &str,
        digest: &str,
        _name: &str,
        content: &Bytes,
    ) -> VfsResult<bool> {
        let key = (namespace.to_owned(), digest.to_owned());
        let mut blobs = self.blobs.write().expect("blob lock poisoned");
        let existed = blobs.contains_key(&key);
        blobs.insert(key, content.clone());
        Ok(existed)
    }

    async fn index_chunks(
        &self,
        namespace: &str,
        digest: &str,
        name: &str,
        content: &Bytes,
    ) -> VfsResult<()> {
        let text = std::str::from_utf8(content)
            .map_err(|_| VfsError::invalid_argument("document is not UTF-8"))?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let mut chunks = self.chunks.write().expect("chunk lock poisoned");
        let ns_chunks = chunks.entry(namespace.to_owned()).or_default();
        for text in chunk_text(text) {
            ns_chunks.push(IndexedChunk {
                digest: digest.to_owned(),
                file: name.to_owned(),
                text,
            });
        }
        Ok(())
    }

    async fn fetch(&self, namespace: &str, digest: &str) -> VfsResult<Bytes> {
        self.blobs
            .read()
            .expect("blob lock poisoned")
            .get(&(namespace.to_owned(), digest.to_owned()))
            .cloned()
            .ok_or_else(|| VfsError::not_found(format!("blob {digest}")))
    }

    async fn delete(&self, namespace: &str, digest: &str) -> VfsResult<()> {
        self.blobs
            .write()
            .expect("blob lock poisoned")
            .remove(&(namespace.to_owned(), digest.to_owned()));
        if let Some(ns_chunks) = self
            .chunks
            .write()
            .expect("chunk lock poisoned")
            .get_mut(namespace)
        {
            ns_chunks.retain(|c| c.digest != digest);
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> VfsResult<Vec<GrepMatch>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.chunks.read().expect("chunk lock poisoned");
        let Some(ns_chunks) = chunks.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f64, &IndexedChunk)> = ns_chunks
            .iter()
            .filter_map(|chunk| {
                let haystack = chunk.text.to_lowercase();
                let hits = terms.iter().filter(|t| haystack.contains(*t)).count();
                if hits == 0 {
                    None
                } else {
                    Some((hits as f64 / terms.len() as f64, chunk))
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, chunk)| GrepMatch {
                path: chunk.file.clone(),
                line: None,
                text: chunk.text.clone(),
                score: Some(score),
            })
            .collect())
    }
}
