//! Path-keyed TTL caches for the FUSE bridge.
//!
//! Both caches expire lazily at read time and are invalidated explicitly
//! by mutating operations; there is no background refresh. Keying by path
//! keeps invalidation trivial: a mutation touches the path's attribute
//! entry and its parent's directory listing.

use std::time::{Duration, Instant};

use crate::types::FileInfo;

/// Default time-to-live for both caches.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

struct Dated<T> {
    value: T,
    deadline: Instant,
}

/// Attribute cache: path → [`FileInfo`].
pub struct AttrCache {
    ttl: Duration,
    entries: scc::HashMap<String, Dated<FileInfo>>,
}

impl AttrCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: scc::HashMap::new(),
        }
    }

    /// A live entry for `path`, evicting it if the TTL lapsed.
    pub async fn get(&self, path: &str) -> Option<FileInfo> {
        let now = Instant::now();
        let hit = self
            .entries
            .read_async(path, |_, d| (d.deadline > now).then(|| d.value.clone()))
            .await;
        match hit {
            Some(Some(info)) => Some(info),
            Some(None) => {
                self.entries.remove_async(path).await;
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry, restarting its TTL.
    pub async fn insert(&self, path: &str, info: FileInfo) {
        let dated = Dated {
            value: info,
            deadline: Instant::now() + self.ttl,
        };
        self.entries.upsert_async(path.to_owned(), dated).await;
    }

    /// Drop the entry for `path`, if any.
    pub async fn invalidate(&self, path: &str) {
        self.entries.remove_async(path).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Directory cache: path → full listing.
pub struct DirCache {
    ttl: Duration,
    entries: scc::HashMap<String, Dated<Vec<FileInfo>>>,
}

impl DirCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: scc::HashMap::new(),
        }
    }

    /// A live listing for `path`, evicting it if the TTL lapsed.
    pub async fn get(&self, path: &str) -> Option<Vec<FileInfo>> {
        let now = Instant::now();
        let hit = self
            .entries
            .read_async(path, |_, d| (d.deadline > now).then(|| d.value.clone()))
            .await;
        match hit {
            Some(Some(listing)) => Some(listing),
            Some(None) => {
                self.entries.remove_async(path).await;
                None
            }
            None => None,
        }
    }

    /// Insert or refresh a listing, restarting its TTL.
    pub async fn insert(&self, path: &str, listing: Vec<FileInfo>) {
        let dated = Dated {
            value: listing,
            deadline: Instant::now() + self.ttl,
        };
        self.entries.upsert_async(path.to_owned(), dated).await;
    }

    /// Drop the listing for `path`, if any.
    pub async fn invalidate(&self, path: &str) {
        self.entries.remove_async(path).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
