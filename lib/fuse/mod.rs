//! The FUSE gateway: kernel VFS on one side, the dispatcher protocol on
//! the other.
//!
//! Backends that implement server handles get REMOTE records; everything
//! else falls back to LOCAL records whose buffering preserves the
//! one-open-one-payload semantics of virtual files. Attribute and
//! directory listings are cached with a TTL and invalidated by mutating
//! operations.

/// Per-path TTL caches for attributes and listings.
pub mod cache;
/// The client seam between the gateway and the dispatcher.
pub mod client;
/// REMOTE/LOCAL handle records and the bridge that owns them.
pub mod handles;

mod adapter;

pub use adapter::FuseGateway;
pub use cache::{AttrCache, DirCache, DEFAULT_TTL};
pub use client::{InProcessClient, VfsClient};
pub use handles::{HandleBridge, HandleKind, HandleRecord};
