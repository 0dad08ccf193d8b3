use std::time::Duration;

/// How a remotely-deleted comment is reported through the count callback
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RemoteDeleteCounting {
    /// Always -1, whatever the number of replies that went away with it
    Single,

    /// Minus the size of the removed subtree, like local deletions
    Subtree,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of top-level comments per page
    pub page_size: usize,
    pub cache_ttl_ms: u64,
    pub max_content_chars: usize,
    pub remote_delete_counting: RemoteDeleteCounting,

    /// Maximum number of remote replies kept around while waiting for their parent
    pub max_orphans: usize,

    /// Number of remotely-deleted ids remembered to ignore late events about them
    pub max_tombstones: usize,

    /// Display name shown on comments that are not confirmed by the server yet
    pub placeholder_author_name: String,
}

impl SyncConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            page_size: 10,
            cache_ttl_ms: 5 * 60 * 1000,
            max_content_chars: crate::api::MAX_CONTENT_CHARS,
            remote_delete_counting: RemoteDeleteCounting::Single,
            max_orphans: 64,
            max_tombstones: 1024,
            placeholder_author_name: String::from("You"),
        }
    }
}
