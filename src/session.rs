// Per-user conversation sessions
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::feedback::{FeedbackCategory, Rating};
use crate::ids::{TicketId, UserId};
use crate::support::EmailAddress;

/// Where a user is in a multi-step conversation.
/// No entry means the user is just browsing menus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    /// Ticket intake, step one
    AwaitingEmail,
    /// Ticket intake, step two
    AwaitingMessage { email: EmailAddress },
    /// Free-form messages go into this ticket
    InDialogue(TicketId),
    /// Rating given, waiting for an optional comment
    AwaitingRatingComment {
        category: FeedbackCategory,
        rating: Rating,
    },
    /// Category chosen, waiting for the star rating
    AwaitingRating { category: FeedbackCategory },
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user: UserId) -> Option<Session> {
        self.sessions.lock().await.get(&user).cloned()
    }

    pub async fn set(&self, user: UserId, session: Session) {
        self.sessions.lock().await.insert(user, session);
    }

    pub async fn clear(&self, user: UserId) -> Option<Session> {
        self.sessions.lock().await.remove(&user)
    }

    /// Drop a dialogue session pointing at `ticket`, whoever owns it
    pub async fn end_dialogue(&self, ticket: TicketId) {
        self.sessions
            .lock()
            .await
            .retain(|_, s| *s != Session::InDialogue(ticket));
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
