#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Comment not found")]
    NotFound,

    #[error("Comment cannot be empty")]
    EmptyContent,

    #[error("Comment is {len} characters long, the maximum is {max}")]
    ContentTooLong { len: usize, max: usize },

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),
}
