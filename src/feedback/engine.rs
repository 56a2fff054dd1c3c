use std::sync::Arc;

use super::domain::{self, FeedbackCategory, Rating};
use super::repository::{FeedbackRepository, FeedbackStats, NewFeedback};
use super::FeedbackError;
use crate::clock::DynClock;
use crate::db::models::Feedback;
use crate::db::RepositoryError;
use crate::gateway::{Button, Keyboard, Sender, Target};
use crate::ids::{FeedbackId, UserId};
use crate::notify::{FanoutReport, Notification, NotificationKind, Notifier, Recipient};

/// What the submitter gets back, plus what happened on the staff side
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackReceipt {
    pub feedback: Feedback,
    pub acknowledgment: String,
    /// Present when the feedback was critical and staff were alerted
    pub alert: Option<FanoutReport>,
}

pub struct FeedbackEngine {
    repo: Arc<dyn FeedbackRepository>,
    notifier: Arc<Notifier>,
    clock: DynClock,
}

impl FeedbackEngine {
    pub fn new(
        repo: Arc<dyn FeedbackRepository>,
        notifier: Arc<Notifier>,
        clock: DynClock,
    ) -> Self {
        Self {
            repo,
            notifier,
            clock,
        }
    }

    /// Persist a rating with its derived flags and fan out as needed.
    ///
    /// Storage comes first: notification failures never lose the feedback.
    pub async fn submit(
        &self,
        sender: &Sender,
        category: FeedbackCategory,
        rating: Rating,
        comment: Option<String>,
    ) -> Result<FeedbackReceipt, FeedbackError> {
        let comment = comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let classification = domain::classify(rating);

        let feedback = self
            .repo
            .create(
                &NewFeedback {
                    user_id: sender.id,
                    category,
                    rating,
                    comment,
                },
                classification,
                self.clock.now(),
            )
            .await?;
        tracing::info!(
            feedback_id = %feedback.id,
            user_id = %sender.id,
            category = %category,
            rating = %rating,
            critical = classification.is_critical,
            "Feedback submitted"
        );

        let alert = if classification.is_critical {
            let notification = Notification::new(
                NotificationKind::CriticalFeedback,
                critical_alert(&feedback, sender),
            )
            .with_keyboard(Keyboard::column([Button::callback(
                "✅ Отметить как решённый",
                format!("resolve_feedback_{}", feedback.id),
            )]));
            let report = self
                .notifier
                .notify(&notification, &self.notifier.staff_recipients())
                .await;
            if report.suppressed > 0 {
                tracing::debug!(feedback_id = %feedback.id, suppressed = report.suppressed, "Some admins already at their alert ceiling");
            }
            Some(report)
        } else {
            None
        };

        if let Some(channel) = self.notifier.feedback_channel() {
            let mirror = Notification::new(NotificationKind::FeedbackMirror, channel_summary(&feedback));
            self.notifier
                .notify(&mirror, &[Recipient::Chat(Target::chat(channel))])
                .await;
        }

        let acknowledgment =
            domain::acknowledgment(category, rating, feedback.comment.is_some());
        Ok(FeedbackReceipt {
            feedback,
            acknowledgment,
            alert,
        })
    }

    /// Resolve a feedback entry. With a response text the author is told too.
    pub async fn respond(
        &self,
        id: FeedbackId,
        admin: UserId,
        response: Option<&str>,
    ) -> Result<Feedback, FeedbackError> {
        let feedback = match self.repo.respond(id, admin, response, self.clock.now()).await {
            Ok(feedback) => feedback,
            Err(RepositoryError::NotFound(_)) => return Err(FeedbackError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(feedback_id = %id, admin_id = %admin, "Feedback resolved");

        if let Some(text) = response.filter(|t| !t.trim().is_empty()) {
            let message = format!(
                "💬 Ответ организаторов на ваш отзыв ({}):\n\n{}",
                feedback.category.label(),
                text
            );
            if let Err(e) = self
                .notifier
                .gateway()
                .send_text(&Target::user(feedback.user_id), &message, None)
                .await
            {
                tracing::warn!(error = %e, feedback_id = %id, "Failed to deliver feedback response");
            }
        }
        Ok(feedback)
    }

    pub async fn critical(&self, limit: usize) -> Result<Vec<Feedback>, FeedbackError> {
        Ok(self.repo.critical_unresolved(limit).await?)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<Feedback>, FeedbackError> {
        Ok(self.repo.recent(limit).await?)
    }

    pub async fn stats(&self) -> Result<FeedbackStats, FeedbackError> {
        Ok(self.repo.stats().await?)
    }
}

fn critical_alert(feedback: &Feedback, sender: &Sender) -> String {
    let username = sender
        .username
        .as_deref()
        .map(|u| format!(" @{u}"))
        .unwrap_or_default();
    let mut text = format!(
        "🚨 Критический отзыв #{}\n\n\
         {} Категория: {}\n\
         🌟 Оценка: {} ({}/5)\n\
         👤 {}{} (ID: {})\n",
        feedback.id,
        domain::severity_emoji(feedback.rating),
        feedback.category.label(),
        feedback.rating.stars(),
        feedback.rating,
        sender.display_name,
        username,
        sender.id,
    );
    if let Some(comment) = &feedback.comment {
        text.push_str(&format!("💬 {comment}\n"));
    }
    text.push_str("\n📋 Рекомендации:\n");
    for item in domain::recommendations_for(feedback.category) {
        text.push_str(&format!("• {item}\n"));
    }
    text
}

/// Public channel summary; carries no user identity
fn channel_summary(feedback: &Feedback) -> String {
    let mut text = format!(
        "{} Новый отзыв\n\n📊 {}\n🌟 {} ({}/5)",
        domain::severity_emoji(feedback.rating),
        feedback.category.label(),
        feedback.rating.stars(),
        feedback.rating,
    );
    if let Some(comment) = &feedback.comment {
        text.push_str(&format!("\n💬 {comment}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ChannelsConfig, NotificationsConfig, StaffConfig};
    use crate::feedback::domain::{FeedbackStatus, Priority};
    use crate::feedback::SqliteFeedbackRepository;
    use crate::gateway::RecordingGateway;
    use crate::ids::ChatId;
    use crate::notify::SqliteNotificationRateLimitRepository;
    use chrono::Utc;
    use rusqlite::params;

    const GROUP: ChatId = ChatId(-1001);
    const CHANNEL: ChatId = ChatId(-2002);

    struct Harness {
        _tmp: tempfile::TempDir,
        gateway: Arc<RecordingGateway>,
        engine: FeedbackEngine,
    }

    fn harness(channel: Option<ChatId>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(&tmp);
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO users (id, display_name, created_at, last_activity) VALUES (100, 'Ann', ?1, ?1)",
                params![Utc::now()],
            )
            .unwrap();
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Arc::new(Notifier::new(
            gateway.clone(),
            Arc::new(SqliteNotificationRateLimitRepository::new(pool.clone())),
            StaffConfig {
                admin_ids: vec![UserId(1), UserId(2)],
                support_staff_ids: vec![],
            },
            ChannelsConfig {
                support_group_id: Some(GROUP),
                support_group_topics: true,
                feedback_channel_id: channel,
            },
            NotificationsConfig::default(),
            clock.clone(),
        ));
        Harness {
            _tmp: tmp,
            gateway,
            engine: FeedbackEngine::new(
                Arc::new(SqliteFeedbackRepository::new(pool)),
                notifier,
                clock,
            ),
        }
    }

    fn ann() -> Sender {
        Sender {
            id: UserId(100),
            display_name: "Ann".into(),
            username: Some("ann".into()),
            locale: None,
        }
    }

    fn rating(value: i64) -> Rating {
        Rating::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn critical_rating_alerts_every_admin_and_the_group() {
        let h = harness(None);
        let receipt = h
            .engine
            .submit(&ann(), FeedbackCategory::Food, rating(1), Some("очередь на час".into()))
            .await
            .unwrap();

        assert_eq!(receipt.feedback.classification.priority, Priority::Urgent);
        assert_eq!(
            receipt.alert,
            Some(FanoutReport {
                sent: 3,
                suppressed: 0,
                failed: 0
            })
        );
        for chat in [ChatId(1), ChatId(2), GROUP] {
            let bodies = h.gateway.bodies_to(chat);
            assert_eq!(bodies.len(), 1, "chat {chat}");
            assert!(bodies[0].contains("очередь на час"));
            assert!(bodies[0].contains(domain::BASE_RECOMMENDATIONS[0]));
        }
        assert!(receipt.acknowledgment.contains("жаль"));
    }

    #[tokio::test]
    async fn good_rating_is_stored_quietly_but_mirrored() {
        let h = harness(Some(CHANNEL));
        let receipt = h
            .engine
            .submit(&ann(), FeedbackCategory::Lectures, rating(5), None)
            .await
            .unwrap();

        assert_eq!(receipt.alert, None);
        assert!(h.gateway.bodies_to(ChatId(1)).is_empty());
        assert!(h.gateway.bodies_to(GROUP).is_empty());
        let mirrored = h.gateway.bodies_to(CHANNEL);
        assert_eq!(mirrored.len(), 1);
        assert!(mirrored[0].starts_with("🟢"));
        assert!(!mirrored[0].contains("Ann"));
    }

    #[tokio::test]
    async fn failed_admin_delivery_does_not_lose_feedback() {
        let h = harness(None);
        h.gateway.fail_deliveries_to(ChatId(1));
        let receipt = h
            .engine
            .submit(&ann(), FeedbackCategory::Infrastructure, rating(2), None)
            .await
            .unwrap();

        let report = receipt.alert.unwrap();
        assert_eq!((report.sent, report.failed), (2, 1));
        assert_eq!(h.engine.critical(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn respond_resolves_and_tells_the_author() {
        let h = harness(None);
        let receipt = h
            .engine
            .submit(&ann(), FeedbackCategory::Food, rating(2), None)
            .await
            .unwrap();
        h.gateway.clear();

        let resolved = h
            .engine
            .respond(receipt.feedback.id, UserId(1), Some("Добавили ещё две точки"))
            .await
            .unwrap();
        assert_eq!(resolved.classification.status, FeedbackStatus::Resolved);
        assert!(h.engine.critical(10).await.unwrap().is_empty());
        assert!(h.gateway.bodies_to(ChatId(100))[0].contains("Добавили ещё две точки"));

        assert!(matches!(
            h.engine.respond(FeedbackId(999), UserId(1), None).await,
            Err(FeedbackError::NotFound(_))
        ));
    }
}
