pub mod domain;
pub mod engine;
pub mod repository;
pub mod stats;

use thiserror::Error;

use crate::db::RepositoryError;
use crate::ids::{TicketId, UserId};

pub use domain::{EmailAddress, InvalidEmail, StaffRole};
pub use engine::{
    ClosedBy, StaffLocator, StaffReplyOutcome, StartOutcome, TicketEngine, TicketHistory,
    TicketSummary,
};
pub use repository::{SqliteSupportRepository, SupportRepository, TicketQuery};

#[derive(Debug, Error)]
pub enum SupportError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    InvalidEmail(#[from] InvalidEmail),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Ticket {0} not found")]
    NotFound(TicketId),

    #[error("Ticket {0} is closed")]
    Closed(TicketId),

    #[error("Ticket {0} belongs to another user")]
    NotOwner(TicketId),

    #[error("User {0} is not support staff")]
    NotStaff(UserId),
}
