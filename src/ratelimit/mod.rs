// Per-user admission control for messages entering a support dialogue
pub mod repository;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::clock::DynClock;
use crate::config::LimitsConfig;
use crate::db::models::RateLimitRecord;
use crate::db::RepositoryError;
use crate::ids::UserId;

pub use repository::{RateLimitRepository, RateLimitSnapshot, SqliteRateLimitRepository};

/// Proof that the limiter let a message from `user` through.
/// Only [`RateLimiter::check`] can mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    user: UserId,
}

impl Admitted {
    pub fn user(&self) -> UserId {
        self.user
    }

    #[cfg(test)]
    pub(crate) fn for_tests(user: UserId) -> Self {
        Self { user }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub wait_seconds: i64,
    pub reason: String,
    permit: Option<Admitted>,
}

impl RateLimitDecision {
    fn allow(user: UserId) -> Self {
        Self {
            allowed: true,
            wait_seconds: 0,
            reason: String::new(),
            permit: Some(Admitted { user }),
        }
    }

    fn reject(wait_seconds: i64, reason: String) -> Self {
        Self {
            allowed: false,
            wait_seconds,
            reason,
            permit: None,
        }
    }

    pub fn permit(&self) -> Option<Admitted> {
        self.permit
    }
}

/// Whole seconds left until `until`, rounded up
fn seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    let ms = (until - now).num_milliseconds().max(0);
    (ms + 999) / 1000
}

pub struct RateLimiter {
    repo: Arc<dyn RateLimitRepository>,
    limits: LimitsConfig,
    clock: DynClock,
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn RateLimitRepository>, limits: LimitsConfig, clock: DynClock) -> Self {
        Self { repo, limits, clock }
    }

    /// Decide whether `user` may send a message right now.
    ///
    /// Rules, first match wins: active block, cooldown since the last
    /// accepted message, trailing-hour ceiling, trailing-day ceiling.
    /// Window counts come from message history; the counters stored on
    /// the record are informational only. The read and the write happen
    /// in one storage transaction.
    pub async fn check(&self, user: UserId) -> Result<RateLimitDecision, RepositoryError> {
        let now = self.clock.now();
        let limits = &self.limits;
        self.repo
            .evaluate(user, now, &|snapshot| decide(limits, user, now, snapshot))
            .await
    }

    pub async fn record(&self, user: UserId) -> Result<Option<RateLimitRecord>, RepositoryError> {
        self.repo.get(user).await
    }
}

fn decide(
    limits: &LimitsConfig,
    user: UserId,
    now: DateTime<Utc>,
    snapshot: RateLimitSnapshot,
) -> (RateLimitRecord, RateLimitDecision) {
    let Some(mut record) = snapshot.record else {
        let record = RateLimitRecord {
            user_id: user,
            last_message_at: now,
            hour_count: 1,
            day_count: 1,
            is_blocked: false,
            blocked_until: None,
            updated_at: now,
        };
        return (record, RateLimitDecision::allow(user));
    };
    record.updated_at = now;

    if let Some(until) = record.blocked_until.filter(|u| record.is_blocked && *u > now) {
        let wait = seconds_until(now, until);
        tracing::debug!(user_id = %user, wait, "Rejected: active block");
        let reason = format!("Превышен лимит сообщений. Попробуйте через {wait} секунд.");
        return (record, RateLimitDecision::reject(wait, reason));
    }

    let cooldown_ends = record.last_message_at + limits.cooldown();
    if now < cooldown_ends {
        let wait = seconds_until(now, cooldown_ends);
        let reason = format!("Подождите {wait} секунд перед отправкой следующего сообщения.");
        return (record, RateLimitDecision::reject(wait, reason));
    }

    let hour_count = snapshot.hour_count;
    let day_count = snapshot.day_count;
    record.hour_count = hour_count;
    record.day_count = day_count;

    let block = if hour_count >= limits.per_hour {
        Some((
            limits.hour_block(),
            format!(
                "Превышен лимит сообщений в час ({}). Попробуйте через час.",
                limits.per_hour
            ),
        ))
    } else if day_count >= limits.per_day {
        Some((
            limits.day_block(),
            format!(
                "Превышен дневной лимит сообщений ({}). Попробуйте завтра.",
                limits.per_day
            ),
        ))
    } else {
        None
    };

    if let Some((duration, reason)) = block {
        record.is_blocked = true;
        record.blocked_until = Some(now + duration);
        tracing::info!(user_id = %user, hour_count, day_count, "User blocked by rate limit");
        return (record, RateLimitDecision::reject(duration.num_seconds(), reason));
    }

    record.last_message_at = now;
    record.hour_count = hour_count + 1;
    record.day_count = day_count + 1;
    record.is_blocked = false;
    record.blocked_until = None;
    (record, RateLimitDecision::allow(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::state::DbPool;
    use chrono::{Duration, TimeZone};
    use rusqlite::params;

    struct Harness {
        _tmp: tempfile::TempDir,
        pool: DbPool,
        clock: Arc<ManualClock>,
        limiter: RateLimiter,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(&tmp);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 7, 12, 12, 0, 0).unwrap(),
        ));
        let limiter = RateLimiter::new(
            Arc::new(SqliteRateLimitRepository::new(pool.clone())),
            LimitsConfig::default(),
            clock.clone(),
        );
        Harness {
            _tmp: tmp,
            pool,
            clock,
            limiter,
        }
    }

    /// Stores one user message at the current clock time
    fn store_message(h: &Harness, user: UserId) {
        let conn = h.pool.get().unwrap();
        let now = h.clock.now();
        conn.execute(
            "INSERT OR IGNORE INTO users (id, display_name, created_at, last_activity)
             VALUES (?1, 'u', ?2, ?2)",
            params![user, now],
        )
        .unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO tickets (id, user_id, email, created_at)
             VALUES (?1, ?1, 'a@b.c', ?2)",
            params![user, now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ticket_messages (ticket_id, user_id, body, created_at)
             VALUES (?1, ?1, 'hi', ?2)",
            params![user, now],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn first_call_allows_and_seeds_record() {
        let h = harness();
        let decision = h.limiter.check(UserId(1)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.permit().unwrap().user(), UserId(1));

        let record = h.limiter.record(UserId(1)).await.unwrap().unwrap();
        assert_eq!(record.last_message_at, h.clock.now());
        assert!(!record.is_blocked);
    }

    #[tokio::test]
    async fn cooldown_reports_remaining_seconds() {
        let h = harness();
        assert!(h.limiter.check(UserId(1)).await.unwrap().allowed);

        h.clock.advance(Duration::seconds(2));
        let decision = h.limiter.check(UserId(1)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait_seconds, 3);
        assert!(decision.permit().is_none());

        h.clock.advance(Duration::seconds(3));
        assert!(h.limiter.check(UserId(1)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn twenty_first_message_in_an_hour_is_blocked() {
        let h = harness();
        let user = UserId(7);

        for n in 1..=20 {
            let decision = h.limiter.check(user).await.unwrap();
            assert!(decision.allowed, "message {n} should pass");
            store_message(&h, user);
            h.clock.advance(Duration::seconds(10));
        }

        let decision = h.limiter.check(user).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait_seconds, 3600);

        let record = h.limiter.record(user).await.unwrap().unwrap();
        assert!(record.is_blocked);
        assert_eq!(record.blocked_until, Some(h.clock.now() + Duration::hours(1)));

        // Still blocked later, with the remaining time reported
        h.clock.advance(Duration::minutes(10));
        let decision = h.limiter.check(user).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait_seconds, 50 * 60);
    }

    #[tokio::test]
    async fn block_lifts_after_expiry_and_old_messages_age_out() {
        let h = harness();
        let user = UserId(8);
        for _ in 0..20 {
            h.limiter.check(user).await.unwrap();
            store_message(&h, user);
            h.clock.advance(Duration::seconds(10));
        }
        assert!(!h.limiter.check(user).await.unwrap().allowed);

        h.clock.advance(Duration::hours(1) + Duration::seconds(1));
        let decision = h.limiter.check(user).await.unwrap();
        assert!(decision.allowed);
        let record = h.limiter.record(user).await.unwrap().unwrap();
        assert!(!record.is_blocked);
        assert_eq!(record.blocked_until, None);
    }

    #[tokio::test]
    async fn daily_ceiling_blocks_for_a_day() {
        let h = harness();
        let user = UserId(9);
        let mut limits = LimitsConfig::default();
        limits.per_hour = 1000;
        let limiter = RateLimiter::new(
            Arc::new(SqliteRateLimitRepository::new(h.pool.clone())),
            limits,
            h.clock.clone(),
        );

        for _ in 0..100 {
            assert!(limiter.check(user).await.unwrap().allowed);
            store_message(&h, user);
            h.clock.advance(Duration::seconds(6));
        }
        let decision = limiter.check(user).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait_seconds, 86400);
    }

    #[test]
    fn wait_rounds_up_partial_seconds() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(seconds_until(now, now + Duration::milliseconds(2001)), 3);
        assert_eq!(seconds_until(now, now + Duration::seconds(3)), 3);
        assert_eq!(seconds_until(now, now - Duration::seconds(1)), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_checks_admit_one_message() {
        let h = harness();
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(SqliteRateLimitRepository::new(h.pool.clone())),
            LimitsConfig::default(),
            h.clock.clone(),
        ));

        for user in 1..=10 {
            let checks: Vec<_> = (0..4)
                .map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move { limiter.check(UserId(user)).await.unwrap() })
                })
                .collect();
            let mut allowed = 0;
            for check in checks {
                if check.await.unwrap().allowed {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 1, "user {user}");
        }
    }
}
