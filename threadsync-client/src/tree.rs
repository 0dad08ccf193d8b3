use crate::{api::CommentId, Comment};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Position {
    /// `None` for top-level comments
    pub parent: Option<CommentId>,
    pub index: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Node {
    // children is always empty here, the tree structure lives in the fields below
    record: Comment,
    parent: Option<CommentId>,
    children: im::Vector<CommentId>,
}

/// All the comments of a post, stored as an arena indexed by comment id
///
/// Cloning is cheap and all the structural operations return a new tree, leaving
/// `self` untouched. Top-level comments are expected newest first, replies oldest
/// first, but no operation here ever re-sorts anything: callers must insert in
/// the right order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentTree {
    nodes: im::HashMap<CommentId, Node>,
    top_level: im::Vector<CommentId>,
}

impl CommentTree {
    pub fn new() -> CommentTree {
        CommentTree::default()
    }

    pub fn from_top_level(comments: Vec<Comment>) -> CommentTree {
        comments
            .into_iter()
            .fold(CommentTree::new(), |t, c| t.append_top_level(c))
    }

    /// Total number of comments, replies included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &CommentId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn top_level_ids(&self) -> impl '_ + Iterator<Item = CommentId> {
        self.top_level.iter().copied()
    }

    pub fn children_ids(&self, id: &CommentId) -> Option<Vec<CommentId>> {
        self.nodes
            .get(id)
            .map(|n| n.children.iter().copied().collect())
    }

    /// Materializes the subtree rooted at `id`
    pub fn get(&self, id: &CommentId) -> Option<Comment> {
        let node = self.nodes.get(id)?;
        let children = node
            .children
            .iter()
            .filter_map(|c| self.get(c))
            .collect::<Vec<_>>();
        let mut res = node.record.clone();
        res.children = children;
        Some(res)
    }

    pub fn top_level(&self) -> Vec<Comment> {
        self.top_level.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn position(&self, id: &CommentId) -> Option<Position> {
        let parent = self.nodes.get(id)?.parent;
        let index = self.list(parent)?.index_of(id)?;
        Some(Position { parent, index })
    }

    /// Number of comments in the subtree rooted at `id`, itself included
    pub fn subtree_size(&self, id: &CommentId) -> Option<usize> {
        let mut stack = vec![self.nodes.get(id)?];
        let mut res = 0;
        while let Some(n) = stack.pop() {
            res += 1;
            stack.extend(n.children.iter().filter_map(|c| self.nodes.get(c)));
        }
        Some(res)
    }

    /// Appends `reply` at the end of `parent`'s replies
    ///
    /// Returns the tree unchanged if `parent` is not in the tree or `reply` already is.
    pub fn insert_reply(&self, parent: CommentId, reply: Comment) -> CommentTree {
        if !self.nodes.contains_key(&parent) || self.nodes.contains_key(&reply.id) {
            return self.clone();
        }
        let mut res = self.clone();
        let id = reply.id;
        res.graft(Some(parent), reply);
        if let Some(p) = res.nodes.get_mut(&parent) {
            p.children.push_back(id);
            p.record.reply_count += 1;
        }
        res
    }

    pub fn prepend_top_level(&self, comment: Comment) -> CommentTree {
        if self.nodes.contains_key(&comment.id) {
            return self.clone();
        }
        let mut res = self.clone();
        let id = comment.id;
        res.graft(None, comment);
        res.top_level.push_front(id);
        res
    }

    pub fn append_top_level(&self, comment: Comment) -> CommentTree {
        if self.nodes.contains_key(&comment.id) {
            return self.clone();
        }
        let mut res = self.clone();
        let id = comment.id;
        res.graft(None, comment);
        res.top_level.push_back(id);
        res
    }

    /// Substitutes the whole subtree rooted at `target` with `replacement`, at the same position
    ///
    /// The replacement keeps only the children it carries itself. If its id is
    /// already used elsewhere in the tree, that other copy is removed first.
    pub fn replace_node(&self, target: CommentId, replacement: Comment) -> CommentTree {
        if !self.nodes.contains_key(&target) {
            return self.clone();
        }
        let new_id = replacement.id;
        let mut res = match new_id != target && self.contains(&new_id) {
            true if !self.is_ancestor(&target, &new_id) => self.remove_node(new_id),
            _ => self.clone(),
        };
        let parent = match res.nodes.get(&target) {
            Some(n) => n.parent,
            None => return self.clone(),
        };
        res.drop_subtree(target);
        res.graft(parent, replacement);
        if let Some(list) = res.list_mut(parent) {
            if let Some(idx) = list.index_of(&target) {
                list.set(idx, new_id);
            }
        }
        res
    }

    /// Removes `target` and all its replies
    ///
    /// The direct parent's reply count is recomputed from its remaining children.
    pub fn remove_node(&self, target: CommentId) -> CommentTree {
        let parent = match self.nodes.get(&target) {
            Some(n) => n.parent,
            None => return self.clone(),
        };
        let mut res = self.clone();
        res.drop_subtree(target);
        if let Some(list) = res.list_mut(parent) {
            list.retain(|id| *id != target);
        }
        if let Some(p) = parent.and_then(|p| res.nodes.get_mut(&p)) {
            p.record.reply_count = p.children.len();
        }
        res
    }

    /// Puts back a subtree previously removed from `pos`
    ///
    /// The index is clamped to the current length of the target list. Returns the
    /// tree unchanged if the parent vanished or the subtree root is already there.
    pub fn restore_subtree(&self, pos: Position, subtree: Comment) -> CommentTree {
        if self.nodes.contains_key(&subtree.id) {
            return self.clone();
        }
        if let Some(p) = pos.parent {
            if !self.nodes.contains_key(&p) {
                return self.clone();
            }
        }
        let mut res = self.clone();
        let id = subtree.id;
        res.graft(pos.parent, subtree);
        if let Some(list) = res.list_mut(pos.parent) {
            let index = std::cmp::min(pos.index, list.len());
            list.insert(index, id);
        }
        if let Some(p) = pos.parent.and_then(|p| res.nodes.get_mut(&p)) {
            p.record.reply_count = p.children.len();
        }
        res
    }

    fn list(&self, parent: Option<CommentId>) -> Option<&im::Vector<CommentId>> {
        match parent {
            None => Some(&self.top_level),
            Some(p) => self.nodes.get(&p).map(|n| &n.children),
        }
    }

    fn list_mut(&mut self, parent: Option<CommentId>) -> Option<&mut im::Vector<CommentId>> {
        match parent {
            None => Some(&mut self.top_level),
            Some(p) => self.nodes.get_mut(&p).map(|n| &mut n.children),
        }
    }

    fn is_ancestor(&self, ancestor: &CommentId, of: &CommentId) -> bool {
        let mut cur = self.nodes.get(of).and_then(|n| n.parent);
        while let Some(c) = cur {
            if c == *ancestor {
                return true;
            }
            cur = self.nodes.get(&c).and_then(|n| n.parent);
        }
        false
    }

    /// Adds the nodes of `comment`'s subtree, without linking `comment` into its parent's list
    fn graft(&mut self, parent: Option<CommentId>, mut comment: Comment) -> bool {
        if self.nodes.contains_key(&comment.id) {
            tracing::warn!(comment = ?comment.id, "refusing to graft a comment already in the tree");
            return false;
        }
        let id = comment.id;
        let children = std::mem::take(&mut comment.children);
        comment.reply_count = 0;
        self.nodes.insert(
            id,
            Node {
                record: comment,
                parent,
                children: im::Vector::new(),
            },
        );
        for c in children {
            let child_id = c.id;
            if self.graft(Some(id), c) {
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.children.push_back(child_id);
                    n.record.reply_count = n.children.len();
                }
            }
        }
        true
    }

    fn drop_subtree(&mut self, root: CommentId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.nodes.remove(&id) {
                stack.extend(n.children.iter().copied());
            }
        }
    }
}
