use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    api::{ChangeEvent, CommentId, UserId},
    Comment, CommentTree, RemoteDeleteCounting, SyncConfig,
};

/// Set of ids that forgets the oldest ones past its capacity
#[derive(Debug)]
struct RecentIds {
    ids: HashSet<CommentId>,
    order: VecDeque<CommentId>,
    cap: usize,
}

impl RecentIds {
    fn new(cap: usize) -> RecentIds {
        RecentIds {
            ids: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, id: &CommentId) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if the id was already there
    fn insert(&mut self, id: CommentId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                tracing::trace!(comment = ?old, "forgetting old id");
                self.ids.remove(&old);
            }
        }
        true
    }

    fn remove(&mut self, id: &CommentId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|c| c != id);
        true
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

/// Merges the change feed of a post into its comment tree
///
/// Events are queued in arrival order and applied by `drain`, which returns the
/// count delta to report. Inserts only carry ids, so `drain` also hands back the
/// ids to resolve and the resolved comments come back through `apply_resolved`.
///
/// A remote insert is counted as soon as it is accepted, whether it ends up in
/// the tree, waiting for its parent, or on a page that is not loaded yet. In the
/// same way, a remote delete is counted even when the comment is not loaded.
#[derive(Debug)]
pub struct Reconciler {
    viewer: Option<UserId>,
    counting: RemoteDeleteCounting,
    max_orphans: usize,
    queue: VecDeque<ChangeEvent>,
    resolving: HashSet<CommentId>,
    tombstones: RecentIds,

    /// Deletions issued by the viewer, already reported by the view
    own_deletes: RecentIds,

    /// Replies received before their parent, keyed by parent id, in arrival order
    orphans: HashMap<CommentId, Vec<Comment>>,
}

impl Reconciler {
    pub fn new(viewer: Option<UserId>, config: &SyncConfig) -> Reconciler {
        Reconciler {
            viewer,
            counting: config.remote_delete_counting,
            max_orphans: config.max_orphans,
            queue: VecDeque::new(),
            resolving: HashSet::new(),
            tombstones: RecentIds::new(config.max_tombstones),
            own_deletes: RecentIds::new(config.max_tombstones),
            orphans: HashMap::new(),
        }
    }

    /// Forgets everything but the configuration
    pub fn reset(&mut self) {
        self.queue.clear();
        self.resolving.clear();
        self.tombstones.clear();
        self.own_deletes.clear();
        self.orphans.clear();
    }

    pub fn enqueue(&mut self, e: ChangeEvent) {
        if let ChangeEvent::Inserted { id, author_id, .. } = &e {
            if Some(*author_id) == self.viewer {
                // Already there, either as an optimistic or a confirmed comment
                tracing::trace!(comment = ?id, "ignoring self-authored insert");
                return;
            }
        }
        tracing::trace!(evt = ?e, "queued change event");
        self.queue.push_back(e);
    }

    /// Records a deletion the viewer issued, so that its echo on the feed is not counted again
    pub fn own_delete(&mut self, id: CommentId) {
        self.own_deletes.insert(id);
    }

    /// The backend refused a deletion recorded with `own_delete`
    pub fn own_delete_failed(&mut self, id: &CommentId) {
        self.own_deletes.remove(id);
    }

    pub fn is_tombstoned(&self, id: &CommentId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn num_orphans(&self) -> usize {
        self.orphans.values().map(|v| v.len()).sum()
    }

    fn is_parked(&self, id: &CommentId) -> bool {
        self.orphans.values().flatten().any(|c| c.id == *id)
    }

    /// Applies all queued deletions, and returns the count delta along with the
    /// ids of inserted comments that need fetching
    pub fn drain(&mut self, tree: &mut CommentTree) -> (i64, Vec<CommentId>) {
        let mut delta = 0;
        let mut to_resolve = Vec::new();
        while let Some(e) = self.queue.pop_front() {
            match e {
                ChangeEvent::Inserted { id, .. } => {
                    if tree.contains(&id)
                        || self.tombstones.contains(&id)
                        || self.is_parked(&id)
                        || !self.resolving.insert(id)
                    {
                        tracing::trace!(comment = ?id, "skipping insert of known comment");
                        continue;
                    }
                    to_resolve.push(id);
                    delta += 1;
                }
                ChangeEvent::Deleted { id, .. } => {
                    let known = !self.tombstones.insert(id);
                    let own = self.own_deletes.remove(&id);
                    if let Some(i) = to_resolve.iter().position(|c| *c == id) {
                        to_resolve.remove(i);
                        self.resolving.remove(&id);
                    }
                    let dropped = self.forget_orphan(&id) as i64;
                    delta += match tree.subtree_size(&id) {
                        Some(size) => {
                            *tree = tree.remove_node(id);
                            tracing::debug!(comment = ?id, removed = size, "applied remote deletion");
                            match self.counting {
                                RemoteDeleteCounting::Single => -1,
                                RemoteDeleteCounting::Subtree => -(size as i64) - dropped,
                            }
                        }
                        None if known || own => 0,
                        None => {
                            tracing::debug!(comment = ?id, "comment deleted outside of the loaded pages");
                            match self.counting {
                                RemoteDeleteCounting::Single => -1,
                                RemoteDeleteCounting::Subtree => -1 - dropped,
                            }
                        }
                    };
                }
            }
        }
        (delta, to_resolve)
    }

    /// To be called for every id returned by `drain`, once its resolution is over
    pub fn resolution_done(&mut self, ids: &[CommentId]) {
        for id in ids {
            self.resolving.remove(id);
        }
    }

    /// Inserts remotely-created comments, oldest first
    pub fn apply_resolved(&mut self, tree: &mut CommentTree, mut comments: Vec<Comment>) {
        comments.sort_by_key(|c| c.created_at);
        for c in comments {
            self.insert(tree, c);
        }
    }

    /// Inserts all orphans whose parent is now in the tree
    ///
    /// Orphans that came in with a page load in the meantime are dropped, the
    /// page already has them.
    pub fn flush_orphans(&mut self, tree: &mut CommentTree) {
        let ready = self
            .orphans
            .keys()
            .filter(|p| tree.contains(p))
            .copied()
            .collect::<Vec<_>>();
        for parent in ready {
            self.adopt(tree, parent);
        }
    }

    fn insert(&mut self, tree: &mut CommentTree, c: Comment) {
        let id = c.id;
        if tree.contains(&id) || self.tombstones.contains(&id) {
            return;
        }
        match c.parent_id {
            None => *tree = tree.prepend_top_level(c),
            Some(parent) if self.tombstones.contains(&parent) => {
                tracing::debug!(comment = ?id, ?parent, "dropping reply to deleted comment");
                return;
            }
            Some(parent) if tree.contains(&parent) => *tree = tree.insert_reply(parent, c),
            Some(parent) => {
                self.park(parent, c);
                return;
            }
        }
        tracing::debug!(comment = ?id, "merged remote comment");
        self.adopt(tree, id);
    }

    fn adopt(&mut self, tree: &mut CommentTree, parent: CommentId) {
        let mut waiting = self.orphans.remove(&parent).unwrap_or_default();
        waiting.sort_by_key(|c| c.created_at);
        for c in waiting {
            self.insert(tree, c);
        }
    }

    fn park(&mut self, parent: CommentId, c: Comment) {
        if self.num_orphans() >= self.max_orphans {
            tracing::warn!(comment = ?c.id, ?parent, "too many orphan replies, dropping one");
            return;
        }
        tracing::debug!(comment = ?c.id, ?parent, "parent not loaded, parking reply");
        self.orphans.entry(parent).or_default().push(c);
    }

    /// Drops the orphan with this id and all orphans below it, returns how many
    /// of the latter went away
    fn forget_orphan(&mut self, id: &CommentId) -> usize {
        for waiting in self.orphans.values_mut() {
            waiting.retain(|c| c.id != *id);
        }
        // replies to a deleted comment will never find their parent
        let mut dropped = 0;
        let mut gone = vec![*id];
        while let Some(parent) = gone.pop() {
            if let Some(waiting) = self.orphans.remove(&parent) {
                dropped += waiting.len();
                gone.extend(waiting.into_iter().map(|c| c.id));
            }
        }
        self.orphans.retain(|_, v| !v.is_empty());
        if dropped > 0 {
            tracing::debug!(parent = ?id, num = dropped, "dropped orphans of deleted comment");
        }
        dropped
    }
}
