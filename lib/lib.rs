//! aggfs core library.
//!
//! One POSIX-like namespace over heterogeneous backends: a mount table
//! routes paths to plugins, virtual symlinks cross mounts, a handle
//! manager leases stateful opens, and a FUSE gateway serves the result to
//! the kernel.

/// Top-level operation routing.
pub mod dispatcher;
pub mod error;
/// The FUSE gateway and its caches.
pub mod fuse;
/// Server-side handle registry.
pub mod handle;
/// Mount table and longest-prefix routing.
pub mod mount;
pub mod path;
/// The backend contract.
pub mod plugin;
/// Built-in backends and the registry.
pub mod plugins;
pub mod session;
pub mod symlink;
pub mod types;
/// Bounded queue + worker pool for background work.
pub mod workqueue;

pub use dispatcher::Dispatcher;
pub use error::{ErrorKind, VfsError, VfsResult};
pub use handle::{HandleConfig, HandleId, HandleManager};
pub use mount::MountTable;
pub use session::Session;
pub use symlink::SymlinkStore;
pub use types::{FileInfo, FileKind, GrepMatch, OpenFlag, WriteFlag};
