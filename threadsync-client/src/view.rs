use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use tokio::sync::mpsc;

use crate::{
    api::{self, Backend, ChangeEvent, CommentId, NewComment, PostId, Profile, Subscription, UserId},
    cache,
    fetch::{fetch_profiles, profile_for},
    Comment, CommentTree, MutationError, Page, PageFetcher, Position, Reconciler, SyncConfig,
    TtlCache,
};

/// Identifies one mounted lifetime of a view, messages from other epochs are dropped
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Epoch(u64);

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(0);

impl Epoch {
    fn next() -> Epoch {
        Epoch(NEXT_EPOCH.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentInput {
    pub content: String,

    /// `None` for a top-level comment
    pub reply_to: Option<CommentId>,
}

#[derive(Debug)]
enum ViewMsg {
    PageLoaded(Page),
    CreateSettled {
        temp_id: CommentId,
        result: Result<Comment, MutationError>,
    },
    DeleteSettled {
        id: CommentId,
        result: Result<(), String>,
    },
    RemoteResolved {
        comments: Vec<Comment>,
        requested: Vec<CommentId>,
    },
}

#[derive(Debug)]
struct Envelope {
    epoch: Epoch,
    msg: ViewMsg,
}

#[derive(Debug)]
struct PendingCreate {
    input: CommentInput,
}

#[derive(Debug)]
struct PendingDelete {
    snapshot: Comment,
    position: Position,
    total: usize,
}

/// Mounts thread views, sharing one backend and one page cache between them
pub struct ThreadProvider<B> {
    backend: Arc<B>,
    cache: Arc<TtlCache<Page>>,
    config: SyncConfig,
}

impl<B: 'static + Backend> ThreadProvider<B> {
    pub fn new(backend: Arc<B>, config: SyncConfig) -> ThreadProvider<B> {
        ThreadProvider::with_cache(backend, Arc::new(TtlCache::new()), config)
    }

    pub fn with_cache(
        backend: Arc<B>,
        cache: Arc<TtlCache<Page>>,
        config: SyncConfig,
    ) -> ThreadProvider<B> {
        ThreadProvider {
            backend,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<TtlCache<Page>> {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribes to the changes of `post`, then loads its first page
    ///
    /// Changes that happen during the first page load are buffered and merged
    /// on the first calls to `step`. `viewer` is `None` for anonymous readers,
    /// who cannot comment.
    pub async fn mount(
        &self,
        post: PostId,
        viewer: Option<UserId>,
        on_count_change: impl 'static + Send + FnMut(i64),
    ) -> ThreadView<B> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = match self.backend.subscribe(post).await {
            Ok(s) => Some(s),
            Err(err) => {
                tracing::warn!(?err, ?post, "failed subscribing to changes, realtime disabled");
                None
            }
        };
        let fetcher = Arc::new(PageFetcher::new(
            self.backend.clone(),
            self.cache.clone(),
            self.config.clone(),
        ));
        let mut view = ThreadView {
            post,
            viewer,
            backend: self.backend.clone(),
            cache: self.cache.clone(),
            fetcher,
            reconciler: Reconciler::new(viewer, &self.config),
            config: self.config.clone(),
            tree: CommentTree::new(),
            on_count_change: Box::new(on_count_change),
            epoch: Epoch::next(),
            alive: true,
            realtime: subscription.is_some(),
            subscription,
            sender,
            receiver,
            input: CommentInput::default(),
            notice: None,
            creates: HashMap::new(),
            deletes: HashMap::new(),
            next_page: 0,
            has_more: false,
            loading: false,
        };
        let page = view.fetcher.fetch_page(post, 0).await;
        view.page_loaded(page);
        tracing::debug!(?post, epoch = ?view.epoch, comments = view.tree.len(), "mounted thread");
        view
    }
}

/// The comments of one post as seen by one viewer, kept in sync with the backend
///
/// Nothing happens in the background on the view itself: spawned tasks and the
/// change feed only send messages, that get applied one at a time by `step`.
pub struct ThreadView<B> {
    post: PostId,
    viewer: Option<UserId>,
    backend: Arc<B>,
    cache: Arc<TtlCache<Page>>,
    fetcher: Arc<PageFetcher<B>>,
    reconciler: Reconciler,
    config: SyncConfig,

    tree: CommentTree,
    on_count_change: Box<dyn Send + FnMut(i64)>,

    epoch: Epoch,
    alive: bool,
    realtime: bool,
    subscription: Option<Subscription>,
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: mpsc::UnboundedReceiver<Envelope>,

    input: CommentInput,
    notice: Option<MutationError>,
    creates: HashMap<CommentId, PendingCreate>,
    deletes: HashMap<CommentId, PendingDelete>,

    next_page: usize,
    has_more: bool,
    loading: bool,
}

impl<B> ThreadView<B> {
    pub fn post(&self) -> PostId {
        self.post
    }

    pub fn viewer(&self) -> Option<UserId> {
        self.viewer
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn tree(&self) -> &CommentTree {
        &self.tree
    }

    /// Top-level comments with their replies, ready for display
    pub fn comments(&self) -> Vec<Comment> {
        self.tree.top_level()
    }

    pub fn input(&self) -> &CommentInput {
        &self.input
    }

    pub fn set_input(&mut self, content: impl Into<String>, reply_to: Option<CommentId>) {
        self.input = CommentInput {
            content: content.into(),
            reply_to,
        };
    }

    /// Last error to show to the user, if any
    pub fn notice(&self) -> Option<&MutationError> {
        self.notice.as_ref()
    }

    pub fn take_notice(&mut self) -> Option<MutationError> {
        self.notice.take()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// False when the change feed could not be set up or was closed by the backend
    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    /// Whether `id` is a local create or delete that the backend did not answer yet
    pub fn is_pending(&self, id: &CommentId) -> bool {
        self.creates.contains_key(id) || self.deletes.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.creates.len() + self.deletes.len()
    }

    /// Releases the change feed and makes the view ignore any further message
    ///
    /// In-flight requests are not cancelled, their results are just dropped.
    pub fn dispose(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        if let Some(mut s) = self.subscription.take() {
            s.unsubscribe();
        }
        self.receiver.close();
        tracing::debug!(post = ?self.post, epoch = ?self.epoch, "disposed thread view");
    }

    fn report(&mut self, delta: i64) {
        if delta != 0 {
            tracing::trace!(post = ?self.post, delta, "comment count changed");
            (self.on_count_change)(delta);
        }
    }

    fn page_loaded(&mut self, page: Page) {
        self.loading = false;
        self.has_more = page.has_more;
        self.next_page = page.number + 1;
        for mut c in page.comments {
            if self.tree.contains(&c.id) || self.reconciler.is_tombstoned(&c.id) {
                tracing::trace!(comment = ?c.id, "skipping already known comment from page");
                continue;
            }
            c.prune(&|id: &CommentId| !self.tree.contains(id) && !self.reconciler.is_tombstoned(id));
            self.tree = self.tree.append_top_level(c);
        }
        self.reconciler.flush_orphans(&mut self.tree);
    }
}

impl<B> Drop for ThreadView<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<B: 'static + Backend> ThreadView<B> {
    /// Waits for the next message or change event and applies it
    ///
    /// Returns false once the view is disposed.
    pub async fn step(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        tokio::select! {
            env = self.receiver.recv() => match env {
                Some(env) => self.handle(env),
                None => return false,
            },
            e = next_change(self.subscription.as_mut()), if self.realtime => match e {
                Some(e) => self.changed(e),
                None => {
                    tracing::warn!(post = ?self.post, "change feed closed, realtime disabled");
                    self.realtime = false;
                }
            },
        }
        self.alive
    }

    /// Applies messages until the view is disposed
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    /// Creates a comment out of the current input
    ///
    /// The comment is shown right away under a temporary id, which is returned.
    /// It is replaced by the confirmed comment or removed once the backend
    /// answers, and the input is restored in the latter case.
    pub fn submit(&mut self) -> Result<CommentId, MutationError> {
        let res = self.try_submit();
        if let Err(err) = &res {
            tracing::debug!(?err, post = ?self.post, "refused comment creation");
            self.notice = Some(err.clone());
        }
        res
    }

    fn try_submit(&mut self) -> Result<CommentId, MutationError> {
        if !self.alive {
            return Err(MutationError::Disposed);
        }
        let author = self.viewer.ok_or(api::Error::NotAuthenticated)?;
        let content =
            String::from(api::validate_content(&self.input.content, self.config.max_content_chars)?);
        let reply_to = self.input.reply_to;
        if let Some(parent) = reply_to {
            if self.creates.contains_key(&parent) {
                return Err(MutationError::ParentPending);
            }
            if !self.tree.contains(&parent) {
                return Err(MutationError::ParentMissing);
            }
        }

        let temp_id = CommentId::new_temporary();
        let now = chrono::Utc::now();
        let placeholder = Comment {
            id: temp_id,
            post_id: self.post,
            author_id: author,
            parent_id: reply_to,
            content: content.clone(),
            created_at: now,
            updated_at: now,
            author: Profile {
                id: author,
                display_name: self.config.placeholder_author_name.clone(),
            },
            children: Vec::new(),
            reply_count: 0,
        };
        self.tree = match reply_to {
            Some(parent) => self.tree.insert_reply(parent, placeholder),
            None => self.tree.prepend_top_level(placeholder),
        };
        self.report(1);
        let input = std::mem::take(&mut self.input);
        self.notice = None;
        self.creates.insert(temp_id, PendingCreate { input });
        tracing::debug!(post = ?self.post, comment = ?temp_id, ?reply_to, "optimistically created comment");

        let backend = self.backend.clone();
        let sender = self.sender.clone();
        let epoch = self.epoch;
        let new = NewComment {
            post_id: self.post,
            author_id: author,
            content,
            parent_id: reply_to,
        };
        tokio::spawn(async move {
            let result = create_comment(&*backend, new).await;
            send(&sender, epoch, ViewMsg::CreateSettled { temp_id, result });
        });
        Ok(temp_id)
    }

    /// Deletes one of the viewer's comments along with all its replies
    ///
    /// Returns the number of comments that went away. They come back if the
    /// backend refuses the deletion.
    pub fn delete(&mut self, id: CommentId) -> Result<usize, MutationError> {
        let res = self.try_delete(id);
        if let Err(err) = &res {
            tracing::debug!(?err, post = ?self.post, comment = ?id, "refused comment deletion");
            self.notice = Some(err.clone());
        }
        res
    }

    fn try_delete(&mut self, id: CommentId) -> Result<usize, MutationError> {
        if !self.alive {
            return Err(MutationError::Disposed);
        }
        let viewer = self.viewer.ok_or(api::Error::NotAuthenticated)?;
        if self.creates.contains_key(&id) {
            return Err(MutationError::StillPending);
        }
        let snapshot = self.tree.get(&id).ok_or(MutationError::NotFound(id))?;
        let position = self.tree.position(&id).ok_or(MutationError::NotFound(id))?;
        if snapshot.author_id != viewer {
            return Err(MutationError::NotOwner);
        }

        let total = snapshot.subtree_size();
        self.tree = self.tree.remove_node(id);
        self.reconciler.own_delete(id);
        self.report(-(total as i64));
        self.notice = None;
        self.deletes.insert(
            id,
            PendingDelete {
                snapshot,
                position,
                total,
            },
        );
        tracing::debug!(post = ?self.post, comment = ?id, total, "optimistically deleted comment");

        let backend = self.backend.clone();
        let sender = self.sender.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = backend
                .delete_comment(id, viewer)
                .await
                .map_err(|err| format!("{err:#}"));
            send(&sender, epoch, ViewMsg::DeleteSettled { id, result });
        });
        Ok(total)
    }

    /// Starts loading the next page, returns false if there is nothing to load
    pub fn load_more(&mut self) -> bool {
        if !self.alive || self.loading || !self.has_more {
            return false;
        }
        self.loading = true;
        let fetcher = self.fetcher.clone();
        let sender = self.sender.clone();
        let (epoch, post, number) = (self.epoch, self.post, self.next_page);
        tokio::spawn(async move {
            let page = fetcher.fetch_page(post, number).await;
            send(&sender, epoch, ViewMsg::PageLoaded(page));
        });
        true
    }

    /// Drops all local state and reloads the first page, without reporting any count change
    ///
    /// Whatever was in flight is forgotten. Also tries to get back the change
    /// feed if it was lost.
    pub async fn refresh(&mut self) {
        if !self.alive {
            return;
        }
        self.epoch = Epoch::next();
        self.cache
            .invalidate_by_prefix(&cache::post_prefix(self.post));
        self.tree = CommentTree::new();
        self.reconciler.reset();
        self.creates.clear();
        self.deletes.clear();
        self.loading = false;
        if !self.realtime {
            match self.backend.subscribe(self.post).await {
                Ok(s) => {
                    tracing::info!(post = ?self.post, "change feed is back");
                    self.subscription = Some(s);
                    self.realtime = true;
                }
                Err(err) => {
                    tracing::warn!(?err, post = ?self.post, "still failing to subscribe to changes")
                }
            }
        }
        let page = self.fetcher.fetch_page(self.post, 0).await;
        self.page_loaded(page);
        tracing::debug!(post = ?self.post, epoch = ?self.epoch, comments = self.tree.len(), "refreshed thread");
    }

    /// Number of comments of the post according to the backend
    ///
    /// The count callback only reports relative changes, this is the way to resynchronize.
    pub async fn exact_count(&self) -> anyhow::Result<usize> {
        self.backend
            .count_comments(self.post)
            .await
            .with_context(|| format!("counting comments of post {:?}", self.post))
    }

    fn handle(&mut self, env: Envelope) {
        if !self.alive {
            return;
        }
        if env.epoch != self.epoch {
            tracing::warn!(post = ?self.post, msg = ?env.msg, "ignoring message from previous epoch");
            return;
        }
        match env.msg {
            ViewMsg::PageLoaded(page) => self.page_loaded(page),
            ViewMsg::CreateSettled { temp_id, result } => self.create_settled(temp_id, result),
            ViewMsg::DeleteSettled { id, result } => self.delete_settled(id, result),
            ViewMsg::RemoteResolved {
                comments,
                requested,
            } => {
                self.reconciler.resolution_done(&requested);
                self.reconciler.apply_resolved(&mut self.tree, comments);
            }
        }
    }

    fn create_settled(&mut self, temp_id: CommentId, result: Result<Comment, MutationError>) {
        let pending = match self.creates.remove(&temp_id) {
            Some(p) => p,
            None => {
                tracing::warn!(comment = ?temp_id, "create settled for unknown comment");
                return;
            }
        };
        match result {
            Ok(comment) if self.reconciler.is_tombstoned(&comment.id) => {
                // the deletion was counted when it came through the feed
                tracing::debug!(comment = ?comment.id, "created comment was already deleted remotely");
                if self.tree.contains(&temp_id) {
                    self.tree = self.tree.remove_node(temp_id);
                }
            }
            Ok(comment) => {
                let id = comment.id;
                self.tree = self.tree.replace_node(temp_id, comment);
                self.cache
                    .invalidate_by_prefix(&cache::post_prefix(self.post));
                tracing::debug!(post = ?self.post, temp = ?temp_id, comment = ?id, "comment creation confirmed");
                // replies from other users may have arrived before we knew the real id
                self.reconciler.flush_orphans(&mut self.tree);
            }
            Err(err) => {
                tracing::error!(?err, post = ?self.post, comment = ?temp_id, "comment creation failed");
                if self.tree.contains(&temp_id) {
                    self.tree = self.tree.remove_node(temp_id);
                    self.report(-1);
                }
                self.input = pending.input;
                self.notice = Some(err);
            }
        }
    }

    fn delete_settled(&mut self, id: CommentId, result: Result<(), String>) {
        let pending = match self.deletes.remove(&id) {
            Some(p) => p,
            None => {
                tracing::warn!(comment = ?id, "delete settled for unknown comment");
                return;
            }
        };
        let err = match result {
            Ok(()) => {
                self.cache
                    .invalidate_by_prefix(&cache::post_prefix(self.post));
                tracing::debug!(post = ?self.post, comment = ?id, "comment deletion confirmed");
                return;
            }
            Err(err) => err,
        };
        tracing::error!(%err, post = ?self.post, comment = ?id, total = pending.total, "comment deletion failed");
        self.notice = Some(MutationError::DeleteFailed(err));
        self.reconciler.own_delete_failed(&id);
        if self.reconciler.is_tombstoned(&id) {
            tracing::debug!(comment = ?id, "comment was deleted remotely meanwhile, not restoring");
            return;
        }
        let mut snapshot = pending.snapshot;
        snapshot.prune(&|c: &CommentId| {
            !self.reconciler.is_tombstoned(c) && !self.creates.contains_key(c) && !self.tree.contains(c)
        });
        let before = self.tree.len();
        self.tree = self.tree.restore_subtree(pending.position, snapshot);
        let restored = self.tree.len() - before;
        self.report(restored as i64);
    }

    fn changed(&mut self, e: ChangeEvent) {
        self.reconciler.enqueue(e);
        while let Some(e) = self.subscription.as_mut().and_then(|s| s.try_next()) {
            self.reconciler.enqueue(e);
        }
        let (delta, to_resolve) = self.reconciler.drain(&mut self.tree);
        self.report(delta);
        if to_resolve.is_empty() {
            return;
        }

        let backend = self.backend.clone();
        let sender = self.sender.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let comments = resolve_comments(&*backend, &to_resolve).await;
            send(
                &sender,
                epoch,
                ViewMsg::RemoteResolved {
                    comments,
                    requested: to_resolve,
                },
            );
        });
    }
}

fn send(sender: &mpsc::UnboundedSender<Envelope>, epoch: Epoch, msg: ViewMsg) {
    if let Err(err) = sender.send(Envelope { epoch, msg }) {
        tracing::trace!(msg = ?err.0.msg, "thread view went away before the result came");
    }
}

async fn next_change(sub: Option<&mut Subscription>) -> Option<ChangeEvent> {
    match sub {
        Some(s) => s.next().await,
        None => None,
    }
}

async fn create_comment(backend: &dyn Backend, new: NewComment) -> Result<Comment, MutationError> {
    match backend.check_comment_permission(new.author_id).await {
        Ok(true) => (),
        Ok(false) => return Err(MutationError::PermissionDenied),
        Err(err) => return Err(MutationError::CreateFailed(format!("{err:#}"))),
    }
    let row = backend.insert_comment(new).await.map_err(|err| {
        match err.downcast_ref::<api::Error>() {
            Some(api::Error::PermissionDenied) => MutationError::PermissionDenied,
            _ => MutationError::CreateFailed(format!("{err:#}")),
        }
    })?;
    let profiles = fetch_profiles(backend, &HashSet::from([row.author_id])).await;
    let author = profile_for(&profiles, row.author_id);
    Ok(Comment::from_row(row, author))
}

/// Fetches remotely-inserted comments, leaving out the ones that are already gone
async fn resolve_comments(backend: &dyn Backend, ids: &[CommentId]) -> Vec<Comment> {
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        match backend.get_comment(*id).await {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => tracing::debug!(comment = ?id, "remotely inserted comment vanished"),
            Err(err) => tracing::warn!(?err, comment = ?id, "failed fetching remotely inserted comment"),
        }
    }
    let authors = rows.iter().map(|r| r.author_id).collect::<HashSet<_>>();
    let profiles = fetch_profiles(backend, &authors).await;
    rows.into_iter()
        .map(|r| {
            let author = profile_for(&profiles, r.author_id);
            Comment::from_row(r, author)
        })
        .collect()
}
