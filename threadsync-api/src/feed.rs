use tokio::sync::mpsc;

use crate::{CommentId, PostId, UserId};

/// Notification pushed by the backend when a comment of a watched post changes
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ChangeEvent {
    Inserted {
        id: CommentId,
        post_id: PostId,
        author_id: UserId,
        parent_id: Option<CommentId>,
    },
    Deleted {
        id: CommentId,
        post_id: PostId,
    },
}

/// Receiving end of a change feed
///
/// The backend keeps the sending half and drops it as soon as a send fails, so
/// unsubscribing is just closing the receiver. Dropping the subscription
/// unsubscribes too.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    active: bool,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>) -> Subscription {
        Subscription {
            events,
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns `None` once unsubscribed or once the backend closed the feed
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        if !self.active {
            return None;
        }
        let res = self.events.recv().await;
        if res.is_none() {
            self.active = false;
        }
        res
    }

    /// Returns whatever was already delivered without waiting
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        match self.active {
            true => self.events.try_recv().ok(),
            false => None,
        }
    }

    /// Returns true iff this call actually released the feed
    pub fn unsubscribe(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.events.close();
        true
    }
}
