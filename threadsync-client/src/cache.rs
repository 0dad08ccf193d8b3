use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::api::PostId;

pub fn page_key(post: PostId, page: usize) -> String {
    format!("comments-{}-page-{page}", post.0)
}

/// Prefix shared by all the cache keys of `post`
pub fn post_prefix(post: PostId) -> String {
    format!("comments-{}-", post.0)
}

/// Key-value store whose entries expire after a per-entry duration
///
/// Meant to be constructed once per provider and shared between the views it mounts.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: parking_lot::Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> TtlCache<V> {
        TtlCache {
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expires, v)) if Instant::now() < *expires => Some(v.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Also drops all expired entries
    pub fn set(&self, key: String, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (expires, _)| now < *expires);
        entries.insert(key, (now + ttl, value));
    }

    /// Returns the number of entries removed
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        tracing::trace!(prefix, removed, "invalidated cache entries");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> TtlCache<V> {
        TtlCache::new()
    }
}
