use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::NotificationKind;
use crate::db::models::NotificationRateLimit;
use crate::db::{immediate_transaction, RepositoryError};
use crate::ids::UserId;
use crate::state::DbPool;

#[async_trait]
pub trait NotificationRateLimitRepository: Send + Sync {
    /// Count one alert of `kind` towards `admin`'s hourly window.
    ///
    /// Returns false, without counting, when the window is already at
    /// `ceiling`. A window whose reset time has passed starts over.
    async fn check_and_increment(
        &self,
        kind: NotificationKind,
        admin: UserId,
        ceiling: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn get(
        &self,
        kind: NotificationKind,
        admin: UserId,
    ) -> Result<Option<NotificationRateLimit>, RepositoryError>;
}

pub struct SqliteNotificationRateLimitRepository {
    pool: DbPool,
}

impl SqliteNotificationRateLimitRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRateLimitRepository for SqliteNotificationRateLimitRepository {
    async fn check_and_increment(
        &self,
        kind: NotificationKind,
        admin: UserId,
        ceiling: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let conn = self.pool.get()?;

        immediate_transaction(&conn, |conn| {
            let current: Option<(i64, DateTime<Utc>)> = conn
                .query_row(
                    "SELECT sent_count, window_reset_at FROM notification_rate_limits
                     WHERE kind = ?1 AND admin_id = ?2",
                    params![kind.as_str(), admin],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (count, reset_at) = match current {
                Some((count, reset_at)) if now < reset_at => (count, reset_at),
                _ => (0, now + Duration::hours(1)),
            };

            if count >= ceiling {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO notification_rate_limits (kind, admin_id, sent_count, window_reset_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, admin_id) DO UPDATE SET
                   sent_count = excluded.sent_count,
                   window_reset_at = excluded.window_reset_at",
                params![kind.as_str(), admin, count + 1, reset_at],
            )?;
            Ok(true)
        })
    }

    async fn get(
        &self,
        kind: NotificationKind,
        admin: UserId,
    ) -> Result<Option<NotificationRateLimit>, RepositoryError> {
        let conn = self.pool.get()?;

        let row = conn
            .query_row(
                "SELECT sent_count, window_reset_at FROM notification_rate_limits
                 WHERE kind = ?1 AND admin_id = ?2",
                params![kind.as_str(), admin],
                |row| {
                    Ok(NotificationRateLimit {
                        kind,
                        admin_id: admin,
                        sent_count: row.get(0)?,
                        window_reset_at: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }
}
