use crate::api::{self, CommentId};

/// Reasons a local create or delete was refused or failed, worded for the user
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    Rejected(#[from] api::Error),

    #[error("Cannot reply to a comment that is still being posted")]
    ParentPending,

    #[error("The comment you are replying to is no longer available")]
    ParentMissing,

    #[error("Comment not found")]
    NotFound(CommentId),

    #[error("Cannot delete a comment that is still being posted")]
    StillPending,

    #[error("You can only delete your own comments")]
    NotOwner,

    #[error("You are not allowed to comment here")]
    PermissionDenied,

    #[error("Failed to post comment, please try again")]
    CreateFailed(String),

    #[error("Failed to delete comment, please try again")]
    DeleteFailed(String),

    #[error("This thread is closed")]
    Disposed,
}
