use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_recursion::async_recursion;

use crate::{
    api::{Backend, CommentId, CommentRow, PostId, Profile, UserId},
    cache, Comment, SyncConfig, TtlCache,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Page {
    pub number: usize,

    /// Top-level comments, newest first, with all their replies
    pub comments: Vec<Comment>,

    /// Guessed from whether the page was full, so may be wrong on a page boundary
    pub has_more: bool,
}

pub struct PageFetcher<B> {
    backend: Arc<B>,
    cache: Arc<TtlCache<Page>>,
    config: SyncConfig,
}

impl<B: Backend> PageFetcher<B> {
    pub fn new(backend: Arc<B>, cache: Arc<TtlCache<Page>>, config: SyncConfig) -> PageFetcher<B> {
        PageFetcher {
            backend,
            cache,
            config,
        }
    }

    /// Fetches page `number` of the top-level comments of `post`, along with all their replies
    ///
    /// Never fails: listings that fail are logged and treated as empty.
    pub async fn fetch_page(&self, post: PostId, number: usize) -> Page {
        let key = cache::page_key(post, number);
        if number == 0 {
            if let Some(page) = self.cache.get(&key) {
                tracing::trace!(?post, "serving first page from cache");
                return page;
            }
        }

        let page_size = std::cmp::max(1, self.config.page_size);
        let from = number * page_size;
        let mut degraded = false;
        let top = match self
            .backend
            .list_top_level(post, from, from + page_size - 1)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(?err, ?post, page = number, "failed listing top-level comments");
                degraded = true;
                Vec::new()
            }
        };
        let has_more = top.len() == page_size;

        let mut replies = HashMap::new();
        for row in top.iter() {
            collect_replies(&*self.backend, row.id, &mut replies, &mut degraded).await;
        }

        let authors = top
            .iter()
            .chain(replies.values().flatten())
            .map(|r| r.author_id)
            .collect::<HashSet<_>>();
        let profiles = fetch_profiles(&*self.backend, &authors).await;

        let comments = top
            .into_iter()
            .map(|row| assemble(row, &mut replies, &profiles))
            .collect::<Vec<_>>();
        tracing::debug!(
            ?post,
            page = number,
            top_level = comments.len(),
            total = comments.iter().map(|c| c.subtree_size()).sum::<usize>(),
            "fetched comments page"
        );
        let page = Page {
            number,
            comments,
            has_more,
        };
        // A degraded page would hide comments for the whole ttl, better refetch next time
        if number == 0 && !degraded {
            self.cache.set(key, page.clone(), self.config.cache_ttl());
        }
        page
    }
}

/// Fetches the whole reply subtree below `parent`, depth-first
#[async_recursion]
async fn collect_replies(
    backend: &dyn Backend,
    parent: CommentId,
    into: &mut HashMap<CommentId, Vec<CommentRow>>,
    degraded: &mut bool,
) {
    if into.contains_key(&parent) {
        tracing::warn!(comment = ?parent, "comment reached twice while fetching replies");
        return;
    }
    let rows = match backend.list_replies(parent).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(?err, comment = ?parent, "failed listing replies");
            *degraded = true;
            Vec::new()
        }
    };
    let children = rows.iter().map(|r| r.id).collect::<Vec<_>>();
    into.insert(parent, rows);
    for c in children {
        collect_replies(backend, c, into, degraded).await;
    }
}

pub(crate) async fn fetch_profiles(
    backend: &dyn Backend,
    users: &HashSet<UserId>,
) -> HashMap<UserId, Profile> {
    if users.is_empty() {
        return HashMap::new();
    }
    match backend.get_profiles(users).await {
        Ok(profiles) => profiles.into_iter().map(|p| (p.id, p)).collect(),
        Err(err) => {
            tracing::warn!(?err, num_users = users.len(), "failed fetching author profiles");
            HashMap::new()
        }
    }
}

pub(crate) fn profile_for(profiles: &HashMap<UserId, Profile>, user: UserId) -> Profile {
    profiles
        .get(&user)
        .cloned()
        .unwrap_or_else(|| Profile::unknown(user))
}

fn assemble(
    row: CommentRow,
    replies: &mut HashMap<CommentId, Vec<CommentRow>>,
    profiles: &HashMap<UserId, Profile>,
) -> Comment {
    let children = replies
        .remove(&row.id)
        .unwrap_or_default()
        .into_iter()
        .map(|r| assemble(r, replies, profiles))
        .collect();
    let author = profile_for(profiles, row.author_id);
    Comment::from_row(row, author).with_children(children)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use threadsync_mock_server::{MockServer, Operation};

    use super::*;
    use crate::api::Uuid;

    fn user(n: u128) -> UserId {
        UserId(Uuid::from_u128(n))
    }

    fn fetcher(server: &Arc<MockServer>) -> PageFetcher<MockServer> {
        PageFetcher::new(server.clone(), Arc::new(TtlCache::new()), SyncConfig::default())
    }

    fn ids(comments: &[Comment]) -> Vec<CommentId> {
        comments.iter().map(|c| c.id).collect()
    }

    #[tokio::test]
    async fn pages_are_newest_first_with_full_subtrees() {
        let server = Arc::new(MockServer::new());
        server.add_profile(user(1), "alice");
        server.add_profile(user(2), "bob");
        let post = PostId::stub();
        let first = server.remote_insert(post, user(1), "first", None);
        let second = server.remote_insert(post, user(2), "second", None);
        let reply = server.remote_insert(post, user(2), "reply", Some(first.id));
        let nested = server.remote_insert(post, user(1), "nested", Some(reply.id));
        let reply2 = server.remote_insert(post, user(1), "reply 2", Some(first.id));

        let page = fetcher(&server).fetch_page(post, 0).await;
        assert_eq!(ids(&page.comments), vec![second.id, first.id]);
        assert!(!page.has_more);
        let first = &page.comments[1];
        assert_eq!(ids(&first.children), vec![reply.id, reply2.id]);
        assert_eq!(first.reply_count, 2);
        assert_eq!(ids(&first.children[0].children), vec![nested.id]);
        assert_eq!(first.children[0].author.display_name, "bob");
        assert_eq!(first.children[0].children[0].author.display_name, "alice");
    }

    #[tokio::test]
    async fn profiles_are_fetched_once_per_page() {
        let server = Arc::new(MockServer::new());
        server.add_profile(user(1), "alice");
        let post = PostId::stub();
        let top = server.remote_insert(post, user(1), "top", None);
        for i in 0..5 {
            server.remote_insert(post, user(1), &format!("reply {i}"), Some(top.id));
        }
        fetcher(&server).fetch_page(post, 0).await;
        assert_eq!(server.calls(Operation::GetProfiles), 1);
        assert_eq!(server.calls(Operation::ListReplies), 6);
    }

    #[tokio::test]
    async fn has_more_follows_page_fullness() {
        let server = Arc::new(MockServer::new());
        let post = PostId::stub();
        for i in 0..20 {
            server.remote_insert(post, user(1), &format!("comment {i}"), None);
        }
        let f = fetcher(&server);
        let p0 = f.fetch_page(post, 0).await;
        let p1 = f.fetch_page(post, 1).await;
        let p2 = f.fetch_page(post, 2).await;
        assert_eq!((p0.comments.len(), p0.has_more), (10, true));
        // exactly two full pages: the second one wrongly claims there is more
        assert_eq!((p1.comments.len(), p1.has_more), (10, true));
        assert_eq!((p2.comments.len(), p2.has_more), (0, false));
        assert_eq!(p0.comments[0].content, "comment 19");
        assert_eq!(p1.comments[9].content, "comment 0");
    }

    #[tokio::test]
    async fn unknown_authors_get_a_fallback_profile() {
        let server = Arc::new(MockServer::new());
        let post = PostId::stub();
        server.remote_insert(post, user(7), "hi", None);
        let page = fetcher(&server).fetch_page(post, 0).await;
        assert_eq!(page.comments[0].author, Profile::unknown(user(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_page_is_cached_for_the_ttl() {
        let server = Arc::new(MockServer::new());
        let post = PostId::stub();
        server.remote_insert(post, user(1), "a", None);
        let f = fetcher(&server);
        f.fetch_page(post, 0).await;
        server.remote_insert(post, user(1), "b", None);
        assert_eq!(f.fetch_page(post, 0).await.comments.len(), 1);
        f.fetch_page(post, 1).await;
        f.fetch_page(post, 1).await;
        assert_eq!(server.calls(Operation::ListTopLevel), 3);

        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(f.fetch_page(post, 0).await.comments.len(), 2);
        assert_eq!(server.calls(Operation::ListTopLevel), 4);
    }

    #[tokio::test]
    async fn failed_reply_listing_degrades_to_empty() {
        let server = Arc::new(MockServer::new());
        let post = PostId::stub();
        let top = server.remote_insert(post, user(1), "top", None);
        server.remote_insert(post, user(1), "reply", Some(top.id));
        server.fail(Operation::ListReplies, true);
        let f = fetcher(&server);
        let page = f.fetch_page(post, 0).await;
        assert_eq!(ids(&page.comments), vec![top.id]);
        assert!(page.comments[0].children.is_empty());

        // the degraded page was not cached
        server.fail(Operation::ListReplies, false);
        let page = f.fetch_page(post, 0).await;
        assert_eq!(page.comments[0].children.len(), 1);
    }

    #[tokio::test]
    async fn failed_top_level_listing_degrades_to_empty() {
        let server = Arc::new(MockServer::new());
        let post = PostId::stub();
        server.remote_insert(post, user(1), "top", None);
        server.fail(Operation::ListTopLevel, true);
        let page = fetcher(&server).fetch_page(post, 0).await;
        assert!(page.comments.is_empty());
        assert!(!page.has_more);
    }
}
