use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::RateLimitDecision;
use crate::db::models::RateLimitRecord;
use crate::db::{immediate_transaction, RepositoryError};
use crate::ids::UserId;
use crate::state::DbPool;

/// Stored state plus the trailing message counts, read together
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSnapshot {
    pub record: Option<RateLimitRecord>,
    pub hour_count: i64,
    pub day_count: i64,
}

/// Computes the record to store and the answer to give
pub type Decide<'a> =
    dyn Fn(RateLimitSnapshot) -> (RateLimitRecord, RateLimitDecision) + Send + Sync + 'a;

#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    async fn get(&self, user: UserId) -> Result<Option<RateLimitRecord>, RepositoryError>;

    /// Read the user's snapshot as of `now`, store what `decide` returns,
    /// all inside one `BEGIN IMMEDIATE` transaction.
    async fn evaluate(
        &self,
        user: UserId,
        now: DateTime<Utc>,
        decide: &Decide<'_>,
    ) -> Result<RateLimitDecision, RepositoryError>;
}

pub struct SqliteRateLimitRepository {
    pool: DbPool,
}

impl SqliteRateLimitRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn read_record(conn: &Connection, user: UserId) -> Result<Option<RateLimitRecord>, RepositoryError> {
    let record = conn
        .query_row(
            "SELECT user_id, last_message_at, hour_count, day_count, is_blocked,
                    blocked_until, updated_at
             FROM rate_limits WHERE user_id = ?1",
            params![user],
            |row| {
                Ok(RateLimitRecord {
                    user_id: row.get(0)?,
                    last_message_at: row.get(1)?,
                    hour_count: row.get(2)?,
                    day_count: row.get(3)?,
                    is_blocked: row.get(4)?,
                    blocked_until: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()?;

    Ok(record)
}

/// Non-staff ticket messages the user sent strictly after `since`
fn count_user_messages_since(
    conn: &Connection,
    user: UserId,
    since: DateTime<Utc>,
) -> Result<i64, RepositoryError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM ticket_messages
         WHERE user_id = ?1 AND is_staff = 0 AND created_at > ?2",
        params![user, since],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// Single row per user, replaced wholesale
fn write_record(conn: &Connection, record: &RateLimitRecord) -> Result<(), RepositoryError> {
    conn.execute(
        "INSERT INTO rate_limits
            (user_id, last_message_at, hour_count, day_count, is_blocked, blocked_until, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
           last_message_at = excluded.last_message_at,
           hour_count = excluded.hour_count,
           day_count = excluded.day_count,
           is_blocked = excluded.is_blocked,
           blocked_until = excluded.blocked_until,
           updated_at = excluded.updated_at",
        params![
            record.user_id,
            record.last_message_at,
            record.hour_count,
            record.day_count,
            record.is_blocked,
            record.blocked_until,
            record.updated_at,
        ],
    )?;

    Ok(())
}

#[async_trait]
impl RateLimitRepository for SqliteRateLimitRepository {
    async fn get(&self, user: UserId) -> Result<Option<RateLimitRecord>, RepositoryError> {
        let conn = self.pool.get()?;
        read_record(&conn, user)
    }

    async fn evaluate(
        &self,
        user: UserId,
        now: DateTime<Utc>,
        decide: &Decide<'_>,
    ) -> Result<RateLimitDecision, RepositoryError> {
        let conn = self.pool.get()?;

        immediate_transaction(&conn, |conn| {
            let snapshot = RateLimitSnapshot {
                record: read_record(conn, user)?,
                hour_count: count_user_messages_since(conn, user, now - Duration::hours(1))?,
                day_count: count_user_messages_since(conn, user, now - Duration::days(1))?,
            };
            let (record, decision) = decide(snapshot);
            write_record(conn, &record)?;
            Ok(decision)
        })
    }
}
