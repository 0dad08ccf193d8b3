mod cache;
pub use cache::{page_key, post_prefix, TtlCache};

mod comment;
pub use comment::Comment;

mod config;
pub use config::{RemoteDeleteCounting, SyncConfig};

mod error;
pub use error::MutationError;

mod fetch;
pub use fetch::{Page, PageFetcher};

mod reconcile;
pub use reconcile::Reconciler;

mod tree;
pub use tree::{CommentTree, Position};

mod view;
pub use view::{CommentInput, Epoch, ThreadProvider, ThreadView};

pub mod api {
    pub use threadsync_api::*;
}
