mod backend;
pub use backend::Backend;

mod comment;
pub use comment::{CommentId, CommentRow, NewComment, PostId};

mod error;
pub use error::Error;

mod feed;
pub use feed::{ChangeEvent, Subscription};

mod user;
pub use user::{Profile, UserId};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<chrono::Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Maximum length of a comment, counted in characters after trimming
pub const MAX_CONTENT_CHARS: usize = 1000;

pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(String::from(s))),
        false => Ok(()),
    }
}

/// Checks user-submitted comment text, returning the text that should actually be sent
pub fn validate_content(content: &str, max_chars: usize) -> Result<&str, Error> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyContent);
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(Error::ContentTooLong { len, max: max_chars });
    }
    validate_string(trimmed)?;
    Ok(trimmed)
}
