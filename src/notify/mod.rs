// Notification fan-out: alerts to admins and the staff group, plus ticket posts
pub mod repository;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::DynClock;
use crate::config::{ChannelsConfig, NotificationsConfig, StaffConfig};
use crate::db::models::StaffLink;
use crate::gateway::{send_payload, Attachment, DynGateway, GatewayError, Keyboard, SentMessage, Target};
use crate::ids::{ChatId, UserId};

pub use repository::{NotificationRateLimitRepository, SqliteNotificationRateLimitRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CriticalFeedback,
    UrgentTicket,
    SystemAlert,
    /// Summary mirrored to the public feedback channel
    FeedbackMirror,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CriticalFeedback => "critical_feedback",
            Self::UrgentTicket => "urgent_ticket",
            Self::SystemAlert => "system_alert",
            Self::FeedbackMirror => "feedback_mirror",
        }
    }

    /// Kinds subject to the per-admin hourly ceiling
    pub fn is_throttled(self) -> bool {
        matches!(
            self,
            Self::CriticalFeedback | Self::UrgentTicket | Self::SystemAlert
        )
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// An admin's private chat; throttled per kind
    Admin(UserId),
    /// A group or channel; never throttled
    Chat(Target),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

impl Notification {
    pub fn new(kind: NotificationKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
}

enum Delivery {
    Sent,
    Suppressed,
    Failed,
}

pub struct Notifier {
    gateway: DynGateway,
    limits: Arc<dyn NotificationRateLimitRepository>,
    staff: StaffConfig,
    channels: ChannelsConfig,
    settings: NotificationsConfig,
    clock: DynClock,
}

impl Notifier {
    pub fn new(
        gateway: DynGateway,
        limits: Arc<dyn NotificationRateLimitRepository>,
        staff: StaffConfig,
        channels: ChannelsConfig,
        settings: NotificationsConfig,
        clock: DynClock,
    ) -> Self {
        Self {
            gateway,
            limits,
            staff,
            channels,
            settings,
            clock,
        }
    }

    pub fn gateway(&self) -> &DynGateway {
        &self.gateway
    }

    pub fn staff_group(&self) -> Option<ChatId> {
        self.channels.support_group_id
    }

    pub fn feedback_channel(&self) -> Option<ChatId> {
        self.channels.feedback_channel_id
    }

    /// Every admin individually
    pub fn admin_recipients(&self) -> Vec<Recipient> {
        self.staff
            .admin_ids
            .iter()
            .copied()
            .map(Recipient::Admin)
            .collect()
    }

    /// Every admin plus the staff group, when one is configured
    pub fn staff_recipients(&self) -> Vec<Recipient> {
        let mut recipients = self.admin_recipients();
        if let Some(group) = self.staff_group() {
            recipients.push(Recipient::Chat(Target::chat(group)));
        }
        recipients
    }

    /// Deliver `notification` to each recipient independently.
    /// One recipient failing never affects the others.
    pub async fn notify(&self, notification: &Notification, recipients: &[Recipient]) -> FanoutReport {
        let deliveries = recipients
            .iter()
            .map(|recipient| self.deliver(notification, *recipient));

        join_all(deliveries)
            .await
            .into_iter()
            .fold(FanoutReport::default(), |mut report, delivery| {
                match delivery {
                    Delivery::Sent => report.sent += 1,
                    Delivery::Suppressed => report.suppressed += 1,
                    Delivery::Failed => report.failed += 1,
                }
                report
            })
    }

    async fn deliver(&self, notification: &Notification, recipient: Recipient) -> Delivery {
        let kind = notification.kind;
        let target = match recipient {
            Recipient::Admin(admin) => {
                if kind.is_throttled() {
                    let allowed = self
                        .limits
                        .check_and_increment(
                            kind,
                            admin,
                            self.settings.per_admin_hourly,
                            self.clock.now(),
                        )
                        .await;
                    match allowed {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(%kind, admin_id = %admin, "Notification suppressed by hourly ceiling");
                            return Delivery::Suppressed;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, %kind, admin_id = %admin, "Notification limit check failed");
                            return Delivery::Failed;
                        }
                    }
                }
                Target::user(admin)
            }
            Recipient::Chat(target) => target,
        };

        match self
            .gateway
            .send_text(&target, &notification.text, notification.keyboard.as_ref())
            .await
        {
            Ok(_) => Delivery::Sent,
            Err(e) => {
                tracing::warn!(error = %e, %kind, chat = %target.chat, "Notification delivery failed");
                Delivery::Failed
            }
        }
    }

    /// Post a new ticket into the staff group.
    ///
    /// With topics enabled the ticket gets its own thread, titled `title`;
    /// if the thread cannot be created the post falls back to the flat
    /// group. Returns `None` when no staff group is configured.
    pub async fn open_ticket_post(
        &self,
        title: &str,
        header: &str,
        attachment: Option<&Attachment>,
        keyboard: Option<&Keyboard>,
    ) -> Result<Option<StaffLink>, GatewayError> {
        let Some(group) = self.staff_group() else {
            return Ok(None);
        };

        let thread = if self.channels.support_group_topics {
            match self.gateway.create_thread(group, title).await {
                Ok(thread) => Some(thread),
                Err(e) => {
                    tracing::warn!(error = %e, "Thread creation failed, posting to the flat group");
                    None
                }
            }
        } else {
            None
        };

        let target = Target::in_thread(group, thread);
        let anchor = self.gateway.send_text(&target, header, keyboard).await?;
        if let Some(attachment) = attachment {
            self.gateway.send_media(&target, attachment, None).await?;
        }

        Ok(Some(StaffLink {
            thread_id: thread,
            anchor_message_id: anchor.message_id,
        }))
    }

    /// Post into a ticket's staff-side location: its thread when it has one,
    /// otherwise the flat group.
    pub async fn post_to_staff(
        &self,
        link: Option<StaffLink>,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<Option<SentMessage>, GatewayError> {
        let Some(group) = self.staff_group() else {
            return Ok(None);
        };
        let target = Target::in_thread(group, link.and_then(|l| l.thread_id));
        send_payload(self.gateway.as_ref(), &target, attachment, text)
            .await
            .map(Some)
    }
}
