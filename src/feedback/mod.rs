pub mod domain;
pub mod engine;
pub mod repository;

use thiserror::Error;

use crate::db::RepositoryError;
use crate::ids::FeedbackId;

pub use domain::{classify, Classification, FeedbackCategory, InvalidRating, Rating};
pub use engine::{FeedbackEngine, FeedbackReceipt};
pub use repository::{FeedbackRepository, FeedbackStats, SqliteFeedbackRepository};

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    InvalidRating(#[from] InvalidRating),

    #[error("Feedback {0} not found")]
    NotFound(FeedbackId),
}
