use std::collections::HashSet;

use async_trait::async_trait;

use crate::{CommentId, CommentRow, NewComment, PostId, Profile, Subscription, UserId};

/// Everything the sync engine needs from the authoritative store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Top-level comments ordered by creation date descending, `from..=to` being row indices
    async fn list_top_level(
        &self,
        post: PostId,
        from: usize,
        to: usize,
    ) -> anyhow::Result<Vec<CommentRow>>;

    /// Direct replies ordered by creation date ascending
    async fn list_replies(&self, parent: CommentId) -> anyhow::Result<Vec<CommentRow>>;

    async fn get_comment(&self, id: CommentId) -> anyhow::Result<Option<CommentRow>>;

    async fn get_profiles(&self, users: &HashSet<UserId>) -> anyhow::Result<Vec<Profile>>;

    async fn insert_comment(&self, c: NewComment) -> anyhow::Result<CommentRow>;

    /// Only succeeds if `author` is the author of comment `id`
    async fn delete_comment(&self, id: CommentId, author: UserId) -> anyhow::Result<()>;

    async fn check_comment_permission(&self, author: UserId) -> anyhow::Result<bool>;

    async fn count_comments(&self, post: PostId) -> anyhow::Result<usize>;

    async fn subscribe(&self, post: PostId) -> anyhow::Result<Subscription>;
}
