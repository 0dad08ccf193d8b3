use crate::api::{CommentId, CommentRow, PostId, Profile, Time, UserId};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub author_id: UserId,
    pub parent_id: Option<CommentId>,
    pub content: String,
    pub created_at: Time,
    pub updated_at: Time,

    /// Snapshot of the author, taken when this comment was fetched or confirmed
    pub author: Profile,

    /// Replies, oldest first
    pub children: Vec<Comment>,

    /// Number of direct children
    pub reply_count: usize,
}

impl Comment {
    pub fn from_row(row: CommentRow, author: Profile) -> Comment {
        Comment {
            id: row.id,
            post_id: row.post_id,
            author_id: row.author_id,
            parent_id: row.parent_id,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
            author,
            children: Vec::new(),
            reply_count: 0,
        }
    }

    pub fn with_children(mut self, children: Vec<Comment>) -> Comment {
        self.reply_count = children.len();
        self.children = children;
        self
    }

    /// Number of comments in this subtree, self included
    pub fn subtree_size(&self) -> usize {
        1 + self.children.iter().map(|c| c.subtree_size()).sum::<usize>()
    }

    /// Drops every descendant for which `keep` returns false, along with its own subtree
    pub fn prune(&mut self, keep: &impl Fn(&CommentId) -> bool) {
        self.children.retain(|c| keep(&c.id));
        for c in self.children.iter_mut() {
            c.prune(keep);
        }
        self.reply_count = self.children.len();
    }
}
