use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feedback::domain::{Classification, FeedbackCategory, Rating};
use crate::gateway::types::{MessageKind, Payload};
use crate::ids::{FeedbackId, MessageId, ThreadId, TicketId, TicketMessageId, UserId};
use crate::notify::NotificationKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
    pub display_name: String,
    pub locale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Where a ticket lives on the staff side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffLink {
    /// Dedicated thread, when the staff group supports them
    pub thread_id: Option<ThreadId>,
    /// The header message posted for the ticket
    pub anchor_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub user_id: UserId,
    pub email: String,
    pub message: String,
    pub is_closed: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_user_message_at: Option<DateTime<Utc>>,
    pub last_staff_response_at: Option<DateTime<Utc>>,
    pub staff_link: Option<StaffLink>,
}

impl Ticket {
    pub fn is_open(&self) -> bool {
        !self.is_closed
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.staff_link.and_then(|link| link.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: TicketMessageId,
    pub ticket_id: TicketId,
    pub sender_id: UserId,
    pub is_staff: bool,
    pub is_admin: bool,
    pub payload: Payload,
    pub kind: MessageKind,
    pub relay_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub user_id: UserId,
    pub last_message_at: DateTime<Utc>,
    pub hour_count: i64,
    pub day_count: i64,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: FeedbackId,
    pub user_id: UserId,
    pub category: FeedbackCategory,
    pub rating: Rating,
    pub comment: Option<String>,
    pub classification: Classification,
    pub admin_response: Option<String>,
    pub responded_by: Option<UserId>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRateLimit {
    pub kind: NotificationKind,
    pub admin_id: UserId,
    pub sent_count: i64,
    pub window_reset_at: DateTime<Utc>,
}
