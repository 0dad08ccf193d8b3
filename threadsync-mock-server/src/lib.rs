use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::anyhow;
use chrono::TimeZone;
use threadsync_api::{
    self as api, Backend, ChangeEvent, CommentId, CommentRow, NewComment, PostId, Profile,
    Subscription, Time, UserId, Uuid,
};
use tokio::sync::{mpsc, Semaphore};

/// Backend calls, for counting them and making them fail
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    ListTopLevel,
    ListReplies,
    GetComment,
    GetProfiles,
    Insert,
    Delete,
    CheckPermission,
    Count,
    Subscribe,
}

/// Contents that can be loaded in a mock server, eg. from a JSON file
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Fixture {
    pub post: PostId,
    pub profiles: Vec<Profile>,

    /// Parents must come before their replies
    pub comments: Vec<CommentRow>,
}

pub struct MockServer {
    state: parking_lot::Mutex<State>,
}

#[derive(Debug)]
struct State {
    // in creation order
    comments: Vec<CommentRow>,
    profiles: HashMap<UserId, Profile>,
    denied: HashSet<UserId>,
    feeds: HashMap<PostId, Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    failing: HashSet<Operation>,
    calls: HashMap<Operation, usize>,
    clock: Time,

    /// Inserts and deletes wait on this while it is set
    gate: Option<Arc<Semaphore>>,
}

impl State {
    fn relay(&mut self, post: PostId, e: ChangeEvent) {
        if let Some(feeds) = self.feeds.get_mut(&post) {
            feeds.retain_mut(|f| matches!(f.send(e.clone()), Ok(())));
        }
    }

    fn tick(&mut self) -> Time {
        self.clock = self.clock + chrono::Duration::seconds(1);
        self.clock
    }

    fn add(&mut self, c: NewComment) -> CommentRow {
        let row = self.store(c);
        self.relay(
            row.post_id,
            ChangeEvent::Inserted {
                id: row.id,
                post_id: row.post_id,
                author_id: row.author_id,
                parent_id: row.parent_id,
            },
        );
        row
    }

    fn store(&mut self, c: NewComment) -> CommentRow {
        let date = self.tick();
        let row = CommentRow {
            id: CommentId(Uuid::new_v4()),
            post_id: c.post_id,
            author_id: c.author_id,
            parent_id: c.parent_id,
            content: c.content,
            created_at: date,
            updated_at: date,
        };
        self.comments.push(row.clone());
        row
    }

    /// Removes `id` and all its replies, relaying a single deletion
    fn remove(&mut self, id: CommentId) -> Option<CommentRow> {
        let row = self.comments.iter().find(|c| c.id == id)?.clone();
        let mut removed = HashSet::from([id]);
        // comments are in creation order, so parents always come before replies
        for c in self.comments.iter() {
            if c.parent_id.map(|p| removed.contains(&p)).unwrap_or(false) {
                removed.insert(c.id);
            }
        }
        self.comments.retain(|c| !removed.contains(&c.id));
        self.relay(
            row.post_id,
            ChangeEvent::Deleted {
                id,
                post_id: row.post_id,
            },
        );
        Some(row)
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            state: parking_lot::Mutex::new(State {
                comments: Vec::new(),
                profiles: HashMap::new(),
                denied: HashSet::new(),
                feeds: HashMap::new(),
                failing: HashSet::new(),
                calls: HashMap::new(),
                clock: chrono::Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                gate: None,
            }),
        }
    }

    pub fn from_fixture(f: Fixture) -> MockServer {
        let res = MockServer::new();
        {
            let mut state = res.state.lock();
            for p in f.profiles {
                state.profiles.insert(p.id, p);
            }
            for c in f.comments {
                state.clock = std::cmp::max(state.clock, c.created_at);
                state.comments.push(c);
            }
        }
        res
    }

    pub fn add_profile(&self, user: UserId, name: &str) {
        self.state.lock().profiles.insert(
            user,
            Profile {
                id: user,
                display_name: String::from(name),
            },
        );
    }

    /// Adds a comment on behalf of another client, bypassing permissions
    pub fn remote_insert(
        &self,
        post: PostId,
        author: UserId,
        content: &str,
        parent: Option<CommentId>,
    ) -> CommentRow {
        self.state.lock().add(NewComment {
            post_id: post,
            author_id: author,
            content: String::from(content),
            parent_id: parent,
        })
    }

    /// Like `remote_insert`, but without notifying subscribers
    pub fn seed(
        &self,
        post: PostId,
        author: UserId,
        content: &str,
        parent: Option<CommentId>,
    ) -> CommentRow {
        self.state.lock().store(NewComment {
            post_id: post,
            author_id: author,
            content: String::from(content),
            parent_id: parent,
        })
    }

    /// Deletes a comment on behalf of another client, returns false if it did not exist
    pub fn remote_delete(&self, id: CommentId) -> bool {
        self.state.lock().remove(id).is_some()
    }

    /// Sends an arbitrary event to the subscribers of its post, without touching the data
    pub fn emit(&self, e: ChangeEvent) {
        let post = match &e {
            ChangeEvent::Inserted { post_id, .. } => *post_id,
            ChangeEvent::Deleted { post_id, .. } => *post_id,
        };
        self.state.lock().relay(post, e);
    }

    pub fn deny(&self, user: UserId) {
        self.state.lock().denied.insert(user);
    }

    pub fn fail(&self, op: Operation, failing: bool) {
        let mut state = self.state.lock();
        match failing {
            true => state.failing.insert(op),
            false => state.failing.remove(&op),
        };
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Makes inserts and deletes hang until `resume_mutations` is called
    pub fn pause_mutations(&self) {
        let mut state = self.state.lock();
        if state.gate.is_none() {
            state.gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn resume_mutations(&self) {
        if let Some(gate) = self.state.lock().gate.take() {
            // waiters get an error, which lets them through
            gate.close();
        }
    }

    /// Return the number of live subscriptions to `post`
    pub fn test_num_feeds(&self, post: PostId) -> usize {
        self.state
            .lock()
            .feeds
            .get(&post)
            .map(|f| f.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn test_comment(&self, id: CommentId) -> Option<CommentRow> {
        self.state.lock().comments.iter().find(|c| c.id == id).cloned()
    }

    fn start(&self, op: Operation) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failing.contains(&op) {
            true => Err(anyhow!("injected failure of {op:?}")),
            false => Ok(()),
        }
    }

    async fn wait_gate(&self) {
        let gate = self.state.lock().gate.clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

#[async_trait::async_trait]
impl Backend for MockServer {
    async fn list_top_level(
        &self,
        post: PostId,
        from: usize,
        to: usize,
    ) -> anyhow::Result<Vec<CommentRow>> {
        self.start(Operation::ListTopLevel)?;
        let state = self.state.lock();
        let mut res = state
            .comments
            .iter()
            .filter(|c| c.post_id == post && c.parent_id.is_none())
            .cloned()
            .collect::<Vec<_>>();
        res.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(res
            .into_iter()
            .skip(from)
            .take((to + 1).saturating_sub(from))
            .collect())
    }

    async fn list_replies(&self, parent: CommentId) -> anyhow::Result<Vec<CommentRow>> {
        self.start(Operation::ListReplies)?;
        let state = self.state.lock();
        let mut res = state
            .comments
            .iter()
            .filter(|c| c.parent_id == Some(parent))
            .cloned()
            .collect::<Vec<_>>();
        res.sort_by_key(|c| c.created_at);
        Ok(res)
    }

    async fn get_comment(&self, id: CommentId) -> anyhow::Result<Option<CommentRow>> {
        self.start(Operation::GetComment)?;
        Ok(self.test_comment(id))
    }

    async fn get_profiles(&self, users: &HashSet<UserId>) -> anyhow::Result<Vec<Profile>> {
        self.start(Operation::GetProfiles)?;
        let state = self.state.lock();
        Ok(users
            .iter()
            .filter_map(|u| state.profiles.get(u).cloned())
            .collect())
    }

    async fn insert_comment(&self, c: NewComment) -> anyhow::Result<CommentRow> {
        self.start(Operation::Insert)?;
        self.wait_gate().await;
        c.validate(api::MAX_CONTENT_CHARS)?;
        let mut state = self.state.lock();
        if state.denied.contains(&c.author_id) {
            return Err(api::Error::PermissionDenied.into());
        }
        if let Some(parent) = c.parent_id {
            if !state
                .comments
                .iter()
                .any(|r| r.id == parent && r.post_id == c.post_id)
            {
                return Err(api::Error::NotFound.into());
            }
        }
        Ok(state.add(c))
    }

    async fn delete_comment(&self, id: CommentId, author: UserId) -> anyhow::Result<()> {
        self.start(Operation::Delete)?;
        self.wait_gate().await;
        let mut state = self.state.lock();
        match state.comments.iter().find(|c| c.id == id) {
            None => return Err(api::Error::NotFound.into()),
            Some(c) if c.author_id != author => return Err(api::Error::PermissionDenied.into()),
            Some(_) => (),
        }
        state.remove(id);
        Ok(())
    }

    async fn check_comment_permission(&self, author: UserId) -> anyhow::Result<bool> {
        self.start(Operation::CheckPermission)?;
        Ok(!self.state.lock().denied.contains(&author))
    }

    async fn count_comments(&self, post: PostId) -> anyhow::Result<usize> {
        self.start(Operation::Count)?;
        Ok(self
            .state
            .lock()
            .comments
            .iter()
            .filter(|c| c.post_id == post)
            .count())
    }

    async fn subscribe(&self, post: PostId) -> anyhow::Result<Subscription> {
        self.start(Operation::Subscribe)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().feeds.entry(post).or_default().push(sender);
        Ok(Subscription::new(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u128) -> UserId {
        UserId(Uuid::from_u128(n))
    }

    #[tokio::test]
    async fn top_level_range_is_inclusive_and_newest_first() {
        let server = MockServer::new();
        let post = PostId::stub();
        let rows = (0..5)
            .map(|i| server.remote_insert(post, user(1), &format!("c{i}"), None))
            .collect::<Vec<_>>();
        let listed = server.list_top_level(post, 1, 3).await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![rows[3].id, rows[2].id, rows[1].id]
        );
        assert!(server.list_top_level(post, 5, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_and_relays_once() {
        let server = MockServer::new();
        let post = PostId::stub();
        let top = server.remote_insert(post, user(1), "top", None);
        let reply = server.remote_insert(post, user(2), "reply", Some(top.id));
        server.remote_insert(post, user(1), "nested", Some(reply.id));
        let mut sub = server.subscribe(post).await.unwrap();

        assert!(server.delete_comment(top.id, user(2)).await.is_err());
        server.delete_comment(top.id, user(1)).await.unwrap();
        assert_eq!(server.count_comments(post).await.unwrap(), 0);
        assert_eq!(
            sub.try_next(),
            Some(ChangeEvent::Deleted { id: top.id, post_id: post })
        );
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn denied_users_cannot_insert() {
        let server = MockServer::new();
        server.deny(user(1));
        assert!(!server.check_comment_permission(user(1)).await.unwrap());
        let err = server
            .insert_comment(NewComment {
                post_id: PostId::stub(),
                author_id: user(1),
                content: String::from("hi"),
                parent_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<api::Error>(), Some(&api::Error::PermissionDenied));
    }

    #[tokio::test]
    async fn closed_subscriptions_are_not_counted() {
        let server = MockServer::new();
        let post = PostId::stub();
        let mut a = server.subscribe(post).await.unwrap();
        let _b = server.subscribe(post).await.unwrap();
        assert_eq!(server.test_num_feeds(post), 2);
        a.unsubscribe();
        assert_eq!(server.test_num_feeds(post), 1);
    }
}
