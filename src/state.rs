use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::clock::DynClock;
use crate::config::Config;
use crate::feedback::{FeedbackEngine, SqliteFeedbackRepository};
use crate::gateway::DynGateway;
use crate::health::HealthChecker;
use crate::mail::Mailer;
use crate::notify::{Notifier, SqliteNotificationRateLimitRepository};
use crate::ratelimit::{RateLimiter, SqliteRateLimitRepository};
use crate::session::SessionStore;
use crate::support::{SqliteSupportRepository, TicketEngine};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Everything the dispatcher and background jobs share, wired once at startup
pub struct Services {
    pub config: Arc<Config>,
    pub clock: DynClock,
    pub db: DbPool,
    pub gateway: DynGateway,
    pub notifier: Arc<Notifier>,
    pub limiter: RateLimiter,
    pub tickets: TicketEngine,
    pub feedback: FeedbackEngine,
    pub sessions: SessionStore,
}

impl Services {
    pub fn new(
        config: Arc<Config>,
        db: DbPool,
        gateway: DynGateway,
        mailer: Option<Mailer>,
        clock: DynClock,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(
            gateway.clone(),
            Arc::new(SqliteNotificationRateLimitRepository::new(db.clone())),
            config.staff.clone(),
            config.channels.clone(),
            config.notifications.clone(),
            clock.clone(),
        ));
        let limiter = RateLimiter::new(
            Arc::new(SqliteRateLimitRepository::new(db.clone())),
            config.limits.clone(),
            clock.clone(),
        );
        let tickets = TicketEngine::new(
            Arc::new(SqliteSupportRepository::new(db.clone())),
            notifier.clone(),
            mailer,
            config.staff.clone(),
            config.support.clone(),
            clock.clone(),
        );
        let feedback = FeedbackEngine::new(
            Arc::new(SqliteFeedbackRepository::new(db.clone())),
            notifier.clone(),
            clock.clone(),
        );

        Self {
            config,
            clock,
            db,
            gateway,
            notifier,
            limiter,
            tickets,
            feedback,
            sessions: SessionStore::new(),
        }
    }
}

/// Shared state for the monitoring endpoints
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub health: Arc<HealthChecker>,
    pub data_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}
