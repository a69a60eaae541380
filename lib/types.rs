//! Core data types: file metadata, open/write flags, search matches, and
//! the scalar configuration values plugins accept.

use std::collections::BTreeMap;
use std::time::SystemTime;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{VfsError, VfsResult};

/// The kind of an entry in the namespace.
///
/// Exactly one kind applies to any entry; the enum enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

impl FileKind {
    #[must_use]
    pub fn is_file(self) -> bool {
        matches!(self, Self::File)
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }

    #[must_use]
    pub fn is_symlink(self) -> bool {
        matches!(self, Self::Symlink)
    }
}

/// Optional plugin-supplied metadata block attached to a [`FileInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Name of the plugin instance that produced this entry.
    pub plugin: String,
    /// Free-form category tag (e.g. "document", "queue").
    pub type_tag: String,
    /// Free-form content map.
    pub content: BTreeMap<String, String>,
}

/// The uniform metadata record returned by `stat` and `readdir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Leaf name of the entry (never a full path).
    pub name: String,
    /// Size in bytes. For symlinks this is the byte length of the target
    /// string; for directories it is advisory and often zero.
    pub size: u64,
    /// Permission bits (e.g. 0o644).
    pub mode: u32,
    /// Last modification time, nanosecond resolution.
    pub mtime: SystemTime,
    /// Entry kind.
    pub kind: FileKind,
    /// Optional plugin metadata.
    pub meta: Option<FileMeta>,
}

impl FileInfo {
    /// Metadata for a regular file.
    #[must_use]
    pub fn file(name: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            mtime: SystemTime::now(),
            kind: FileKind::File,
            meta: None,
        }
    }

    /// Metadata for a directory.
    #[must_use]
    pub fn directory(name: impl Into<String>, mode: u32) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode,
            mtime: SystemTime::now(),
            kind: FileKind::Directory,
            meta: None,
        }
    }

    /// Metadata for a symlink pointing at `target`.
    #[must_use]
    pub fn symlink(name: impl Into<String>, target: &str) -> Self {
        Self {
            name: name.into(),
            size: target.len() as u64,
            mode: 0o777,
            mtime: SystemTime::now(),
            kind: FileKind::Symlink,
            meta: None,
        }
    }

    /// Attach a metadata block, builder-style.
    #[must_use]
    pub fn with_meta(mut self, meta: FileMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

bitflags! {
    /// Options recognised by the stateless `write` operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlag: u32 {
        /// Write at end of file, ignoring the offset.
        const APPEND    = 1 << 0;
        /// Create the file if absent.
        const CREATE    = 1 << 1;
        /// With CREATE: fail if the file already exists.
        const EXCLUSIVE = 1 << 2;
        /// Empty the file before writing.
        const TRUNCATE  = 1 << 3;
        /// Data is durable when the call returns.
        const SYNC      = 1 << 4;
    }
}

impl WriteFlag {
    /// Apply flag precedence and reject contradictory combinations.
    ///
    /// EXCLUSIVE implies CREATE; TRUNCATE and APPEND are mutually
    /// exclusive.
    pub fn validate(self) -> VfsResult<Self> {
        if self.contains(Self::TRUNCATE | Self::APPEND) {
            return Err(VfsError::invalid_argument(
                "TRUNCATE and APPEND are mutually exclusive",
            ));
        }
        let mut flags = self;
        if flags.contains(Self::EXCLUSIVE) {
            flags |= Self::CREATE;
        }
        Ok(flags)
    }
}

bitflags! {
    /// Flags for stateful opens.
    ///
    /// The low bits carry the access mode; the lifecycle bits mirror
    /// [`WriteFlag`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlag: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const APPEND    = 1 << 2;
        const CREATE    = 1 << 3;
        const EXCLUSIVE = 1 << 4;
        const TRUNCATE  = 1 << 5;
        const SYNC      = 1 << 6;
    }
}

/// The access mode carried by an [`OpenFlag`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlag {
    /// The access mode requested by this flag set. A set with neither
    /// READ nor WRITE is treated as read-only.
    #[must_use]
    pub fn access_mode(self) -> AccessMode {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (_, false) => AccessMode::ReadOnly,
            (false, true) => AccessMode::WriteOnly,
            (true, true) => AccessMode::ReadWrite,
        }
    }

    /// Apply flag precedence and reject contradictory combinations.
    pub fn validate(self) -> VfsResult<Self> {
        if self.contains(Self::TRUNCATE | Self::APPEND) {
            return Err(VfsError::invalid_argument(
                "TRUNCATE and APPEND are mutually exclusive",
            ));
        }
        let mut flags = self;
        if flags.contains(Self::EXCLUSIVE) {
            flags |= Self::CREATE;
        }
        Ok(flags)
    }

    /// The lifecycle subset of these flags, as a [`WriteFlag`] set.
    #[must_use]
    pub fn write_flags(self) -> WriteFlag {
        let mut wf = WriteFlag::empty();
        if self.contains(Self::APPEND) {
            wf |= WriteFlag::APPEND;
        }
        if self.contains(Self::CREATE) {
            wf |= WriteFlag::CREATE;
        }
        if self.contains(Self::EXCLUSIVE) {
            wf |= WriteFlag::EXCLUSIVE;
        }
        if self.contains(Self::TRUNCATE) {
            wf |= WriteFlag::TRUNCATE;
        }
        if self.contains(Self::SYNC) {
            wf |= WriteFlag::SYNC;
        }
        wf
    }
}

/// One match record returned by a plugin's `grep` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrepMatch {
    /// Backend-relative path of the matching entry.
    pub path: String,
    /// Line number, where the backend has one.
    pub line: Option<u64>,
    /// The matching text (a line, or a chunk for semantic backends).
    pub text: String,
    /// Relevance score for semantic backends; `None` for exact matches.
    pub score: Option<f64>,
}

/// A scalar configuration value a plugin accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl ConfigValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Plugin configuration as supplied at startup.
pub type PluginConfig = BTreeMap<String, ConfigValue>;

/// A configuration key a plugin declares it recognises.
///
/// Startup validation fails when a mount's config carries a key its
/// plugin does not declare, or omits a required one.
#[derive(Debug, Clone)]
pub struct ConfigParam {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}
