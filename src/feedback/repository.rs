// Repository pattern - isolates feedback storage
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::str::FromStr;

use super::domain::{Classification, FeedbackCategory, FeedbackStatus, Priority, Rating};
use crate::db::models::Feedback;
use crate::db::RepositoryError;
use crate::ids::{FeedbackId, UserId};
use crate::state::DbPool;

#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub user_id: UserId,
    pub category: FeedbackCategory,
    pub rating: Rating,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub category: FeedbackCategory,
    pub count: i64,
    pub average_rating: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total: i64,
    pub average_rating: Option<f64>,
    pub distinct_users: i64,
    pub critical_open: i64,
    pub categories: Vec<CategoryStats>,
}

#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    async fn create(
        &self,
        feedback: &NewFeedback,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Result<Feedback, RepositoryError>;

    async fn get(&self, id: FeedbackId) -> Result<Option<Feedback>, RepositoryError>;

    /// Mark the feedback resolved, keeping the admin's response text if any
    async fn respond(
        &self,
        id: FeedbackId,
        admin: UserId,
        response: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Feedback, RepositoryError>;

    /// Critical feedback nobody has resolved yet, newest first
    async fn critical_unresolved(&self, limit: usize) -> Result<Vec<Feedback>, RepositoryError>;

    async fn recent(&self, limit: usize) -> Result<Vec<Feedback>, RepositoryError>;

    async fn stats(&self) -> Result<FeedbackStats, RepositoryError>;
}

const FEEDBACK_COLUMNS: &str = "id, user_id, category, rating, comment, is_critical, priority, \
     status, admin_response, responded_by, responded_at, created_at";

fn parse_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<Feedback> {
    let rating = Rating::try_from(row.get::<_, i64>(3)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Integer, Box::new(e)))?;
    let priority: Priority = parse_column(row, 6)?;
    let status: FeedbackStatus = parse_column(row, 7)?;

    Ok(Feedback {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: parse_column(row, 2)?,
        rating,
        comment: row.get(4)?,
        classification: Classification {
            is_critical: row.get(5)?,
            priority,
            status,
        },
        admin_response: row.get(8)?,
        responded_by: row.get(9)?,
        responded_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub struct SqliteFeedbackRepository {
    pool: DbPool,
}

impl SqliteFeedbackRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn query(&self, sql: &str, limit: usize) -> Result<Vec<Feedback>, RepositoryError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![limit as i64], feedback_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl FeedbackRepository for SqliteFeedbackRepository {
    async fn create(
        &self,
        feedback: &NewFeedback,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Result<Feedback, RepositoryError> {
        let conn = self.pool.get()?;

        conn.execute(
            "INSERT INTO feedback (user_id, category, rating, comment, is_critical, priority, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                feedback.user_id,
                feedback.category.as_str(),
                feedback.rating.get(),
                feedback.comment,
                classification.is_critical,
                classification.priority.as_str(),
                classification.status.as_str(),
                now,
            ],
        )?;

        Ok(Feedback {
            id: FeedbackId(conn.last_insert_rowid()),
            user_id: feedback.user_id,
            category: feedback.category,
            rating: feedback.rating,
            comment: feedback.comment.clone(),
            classification,
            admin_response: None,
            responded_by: None,
            responded_at: None,
            created_at: now,
        })
    }

    async fn get(&self, id: FeedbackId) -> Result<Option<Feedback>, RepositoryError> {
        let conn = self.pool.get()?;
        let feedback = conn
            .query_row(
                &format!("SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE id = ?1"),
                params![id],
                feedback_from_row,
            )
            .optional()?;
        Ok(feedback)
    }

    async fn respond(
        &self,
        id: FeedbackId,
        admin: UserId,
        response: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Feedback, RepositoryError> {
        {
            let conn = self.pool.get()?;
            let updated = conn.execute(
                "UPDATE feedback
                 SET admin_response = ?1, responded_by = ?2, responded_at = ?3, status = ?4
                 WHERE id = ?5",
                params![
                    response,
                    admin,
                    now,
                    FeedbackStatus::Resolved.as_str(),
                    id
                ],
            )?;
            if updated == 0 {
                return Err(RepositoryError::NotFound(format!("feedback {id}")));
            }
        }

        self.get(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("feedback {id}")))
    }

    async fn critical_unresolved(&self, limit: usize) -> Result<Vec<Feedback>, RepositoryError> {
        self.query(
            &format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback
                 WHERE is_critical = 1 AND status != 'resolved'
                 ORDER BY created_at DESC, id DESC LIMIT ?1"
            ),
            limit,
        )
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Feedback>, RepositoryError> {
        self.query(
            &format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback ORDER BY created_at DESC, id DESC LIMIT ?1"
            ),
            limit,
        )
    }

    async fn stats(&self) -> Result<FeedbackStats, RepositoryError> {
        let conn = self.pool.get()?;

        let (total, average_rating, distinct_users, critical_open) = conn.query_row(
            "SELECT COUNT(*), AVG(rating), COUNT(DISTINCT user_id),
                    COALESCE(SUM(CASE WHEN is_critical = 1 AND status != 'resolved' THEN 1 ELSE 0 END), 0)
             FROM feedback",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*), AVG(rating) FROM feedback
             GROUP BY category ORDER BY COUNT(*) DESC, category",
        )?;
        let categories = stmt
            .query_map([], |row| {
                Ok(CategoryStats {
                    category: parse_column(row, 0)?,
                    count: row.get(1)?,
                    average_rating: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FeedbackStats {
            total,
            average_rating,
            distinct_users,
            critical_open,
            categories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::domain::classify;
    use chrono::{Duration, TimeZone};

    async fn repo() -> (tempfile::TempDir, SqliteFeedbackRepository) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(&tmp);
        {
            let conn = pool.get().unwrap();
            for id in [1, 2, 3] {
                conn.execute(
                    "INSERT INTO users (id, display_name, created_at, last_activity)
                     VALUES (?1, 'user', ?2, ?2)",
                    params![id, Utc::now()],
                )
                .unwrap();
            }
        }
        (tmp, SqliteFeedbackRepository::new(pool))
    }

    fn new_feedback(user: i64, category: FeedbackCategory, rating: i64) -> NewFeedback {
        NewFeedback {
            user_id: UserId(user),
            category,
            rating: Rating::try_from(rating).unwrap(),
            comment: None,
        }
    }

    async fn submit(repo: &SqliteFeedbackRepository, f: NewFeedback, at: DateTime<Utc>) -> Feedback {
        let classification = classify(f.rating);
        repo.create(&f, classification, at).await.unwrap()
    }

    #[tokio::test]
    async fn stored_flags_match_classification() {
        let (_tmp, repo) = repo().await;
        let mut input = new_feedback(1, FeedbackCategory::Food, 1);
        input.comment = Some("холодная еда".into());
        let created = submit(&repo, input, Utc::now()).await;

        let loaded = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(loaded.classification.is_critical);
        assert_eq!(loaded.classification.priority, Priority::Urgent);
        assert_eq!(loaded.comment.as_deref(), Some("холодная еда"));
    }

    #[tokio::test]
    async fn respond_resolves_and_drops_from_critical_list() {
        let (_tmp, repo) = repo().await;
        let now = Utc.with_ymd_and_hms(2025, 7, 12, 10, 0, 0).unwrap();
        let old = submit(&repo, new_feedback(1, FeedbackCategory::Food, 2), now).await;
        let newer = submit(
            &repo,
            new_feedback(2, FeedbackCategory::Lectures, 1),
            now + Duration::minutes(5),
        )
        .await;
        submit(&repo, new_feedback(3, FeedbackCategory::Food, 5), now).await;

        let critical = repo.critical_unresolved(10).await.unwrap();
        assert_eq!(
            critical.iter().map(|f| f.id).collect::<Vec<_>>(),
            vec![newer.id, old.id]
        );

        let resolved = repo
            .respond(old.id, UserId(99), Some("Заменили поставщика"), now)
            .await
            .unwrap();
        assert_eq!(resolved.classification.status, FeedbackStatus::Resolved);
        assert_eq!(resolved.responded_by, Some(UserId(99)));
        assert!(resolved.classification.is_critical);

        let critical = repo.critical_unresolved(10).await.unwrap();
        assert_eq!(critical.len(), 1);
        assert!(matches!(
            repo.respond(FeedbackId(404), UserId(99), None, now).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_aggregate_by_category() {
        let (_tmp, repo) = repo().await;
        let now = Utc::now();
        submit(&repo, new_feedback(1, FeedbackCategory::Food, 2), now).await;
        submit(&repo, new_feedback(2, FeedbackCategory::Food, 4), now).await;
        submit(&repo, new_feedback(2, FeedbackCategory::Festival, 5), now).await;

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.distinct_users, 2);
        assert_eq!(stats.critical_open, 1);
        assert!((stats.average_rating.unwrap() - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.categories[0].category, FeedbackCategory::Food);
        assert_eq!(stats.categories[0].count, 2);
        assert!((stats.categories[0].average_rating - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_table_has_no_average() {
        let (_tmp, repo) = repo().await;
        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_rating, None);
        assert!(stats.categories.is_empty());
    }
}
