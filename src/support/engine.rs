// Ticket dialogue engine: intake, relay in both directions, closing, escalation
use chrono::Duration;
use std::sync::Arc;

use super::domain::{self, EmailAddress, StaffRole};
use super::repository::{NewMessage, NewTicket, SupportRepository, TicketQuery};
use super::stats::SupportStats;
use super::SupportError;
use crate::clock::DynClock;
use crate::config::{StaffConfig, SupportConfig};
use crate::db::models::{Ticket, TicketMessage};
use crate::db::RepositoryError;
use crate::gateway::{send_payload, Button, Keyboard, Payload, Sender, Target};
use crate::ids::{MessageId, ThreadId, TicketId, TicketMessageId, UserId};
use crate::mail::{Mailer, TicketNotice};
use crate::notify::{FanoutReport, Notification, NotificationKind, Notifier};
use crate::ratelimit::Admitted;

/// An open ticket as shown when the attendee comes back to support
#[derive(Debug, Clone, PartialEq)]
pub struct TicketSummary {
    pub ticket: Ticket,
    pub recent: Vec<TicketMessage>,
    pub total_messages: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Existing(TicketSummary),
    /// No open ticket; intake starts by asking for a contact e-mail
    NewTicketPrompt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketHistory {
    pub ticket: Ticket,
    pub messages: Vec<TicketMessage>,
    pub total: i64,
}

/// Where a staff message came from on the staff side
#[derive(Debug, Clone, Copy, Default)]
pub struct StaffLocator<'a> {
    pub thread: Option<ThreadId>,
    /// Text of the message being replied to, for groups without threads
    pub reply_text: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaffReplyOutcome {
    Relayed {
        ticket_id: TicketId,
        message_id: TicketMessageId,
    },
    /// Stored, but the attendee could not be reached; staff were told
    DeliveryFailed {
        ticket_id: TicketId,
        message_id: TicketMessageId,
    },
    /// Sender is not staff. Nothing happens and nothing is said.
    Ignored,
    NotFound,
    Closed(TicketId),
}

/// Who closed a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Owner(UserId),
    Staff(UserId),
    /// Superseded by a newer ticket of the same user
    Replaced(TicketId),
    Inactivity,
}

impl ClosedBy {
    fn actor(self) -> Option<UserId> {
        match self {
            Self::Owner(id) | Self::Staff(id) => Some(id),
            Self::Replaced(_) | Self::Inactivity => None,
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Owner(_) => "пользователем".to_string(),
            Self::Staff(id) => format!("сотрудником {id}"),
            Self::Replaced(new) => format!("из-за нового обращения #{new}"),
            Self::Inactivity => "автоматически (нет активности)".to_string(),
        }
    }
}

pub struct TicketEngine {
    repo: Arc<dyn SupportRepository>,
    notifier: Arc<Notifier>,
    mailer: Option<Mailer>,
    staff: StaffConfig,
    settings: SupportConfig,
    clock: DynClock,
}

impl TicketEngine {
    pub fn new(
        repo: Arc<dyn SupportRepository>,
        notifier: Arc<Notifier>,
        mailer: Option<Mailer>,
        staff: StaffConfig,
        settings: SupportConfig,
        clock: DynClock,
    ) -> Self {
        Self {
            repo,
            notifier,
            mailer,
            staff,
            settings,
            clock,
        }
    }

    pub fn repository(&self) -> &Arc<dyn SupportRepository> {
        &self.repo
    }

    pub fn staff_role(&self, user: UserId) -> Option<StaffRole> {
        StaffRole::of(&self.staff, user)
    }

    /// Record that `sender` is around; called for every inbound event
    pub async fn touch_user(&self, sender: &Sender) -> Result<(), SupportError> {
        self.repo.upsert_user(sender, self.clock.now()).await?;
        Ok(())
    }

    pub async fn log_action(
        &self,
        user: UserId,
        action: &str,
        details: Option<serde_json::Value>,
    ) {
        if let Err(e) = self
            .repo
            .log_action(user, action, details, self.clock.now())
            .await
        {
            tracing::error!(error = %e, user_id = %user, action, "Failed to write action log");
        }
    }

    pub async fn start_or_resume(&self, user: UserId) -> Result<StartOutcome, SupportError> {
        match self.repo.find_open_by_user(user).await? {
            Some(ticket) => Ok(StartOutcome::Existing(self.summary(ticket).await?)),
            None => Ok(StartOutcome::NewTicketPrompt),
        }
    }

    pub async fn summary(&self, ticket: Ticket) -> Result<TicketSummary, SupportError> {
        let recent = self
            .repo
            .recent_messages(ticket.id, self.settings.summary_messages)
            .await?;
        let total_messages = self.repo.count_messages(ticket.id).await?;
        Ok(TicketSummary {
            ticket,
            recent,
            total_messages,
        })
    }

    /// Open a ticket for the attendee behind `permit`.
    ///
    /// Any ticket the user still has open is closed first. The ticket and
    /// its first message are stored before anything is posted to staff, so
    /// a failed staff post never loses the request.
    pub async fn create(
        &self,
        permit: Admitted,
        sender: &Sender,
        email: &str,
        payload: Payload,
    ) -> Result<Ticket, SupportError> {
        let email = EmailAddress::parse(email)?;
        if payload.is_empty() {
            return Err(SupportError::EmptyMessage);
        }
        let user = permit.user();
        let now = self.clock.now();

        let created = self
            .repo
            .create_ticket(
                &NewTicket {
                    user_id: user,
                    email: email.clone(),
                    payload: payload.clone(),
                },
                now,
            )
            .await?;
        let mut ticket = created.ticket;
        tracing::info!(ticket_id = %ticket.id, user_id = %user, "Ticket created");
        self.log_action(
            user,
            "ticket_created",
            Some(serde_json::json!({ "ticket_id": ticket.id })),
        )
        .await;

        for old in created.closed {
            self.announce_closed(old, ClosedBy::Replaced(ticket.id)).await;
        }

        let header = staff_header(&ticket, sender);
        let title = format!("#{} {}", ticket.id, sender.display_name);
        let actions = Keyboard::column([Button::callback(
            "🔒 Закрыть обращение",
            domain::staff_close_payload(ticket.id),
        )]);
        match self
            .notifier
            .open_ticket_post(&title, &header, payload.attachment.as_ref(), Some(&actions))
            .await
        {
            Ok(Some(link)) => {
                // The ticket is stored and posted; a lost link only costs routing by thread
                if let Err(e) = self.repo.set_staff_link(ticket.id, link).await {
                    tracing::error!(error = %e, ticket_id = %ticket.id, "Failed to store staff link");
                }
                self.remember_relay(created.first_message.id, link.anchor_message_id)
                    .await;
                ticket.staff_link = Some(link);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, ticket_id = %ticket.id, "Failed to post ticket to staff");
            }
        }

        if let Some(mailer) = &self.mailer {
            let notice = TicketNotice {
                ticket_id: ticket.id,
                user_name: &sender.display_name,
                contact_email: email.as_str(),
                message: payload.text_or_empty(),
                created_at: now,
            };
            if let Err(e) = mailer.send_ticket_notice(&notice).await {
                tracing::warn!(error = %e, ticket_id = %ticket.id, "Failed to e-mail support");
            }
        }

        Ok(ticket)
    }

    /// Add an attendee message to their open ticket and relay it to staff
    pub async fn append_user_message(
        &self,
        permit: Admitted,
        ticket_id: TicketId,
        sender: &Sender,
        payload: Payload,
    ) -> Result<TicketMessage, SupportError> {
        if payload.is_empty() {
            return Err(SupportError::EmptyMessage);
        }
        let ticket = self
            .repo
            .get_ticket(ticket_id)
            .await?
            .ok_or(SupportError::NotFound(ticket_id))?;
        if ticket.user_id != permit.user() {
            return Err(SupportError::NotOwner(ticket_id));
        }
        if ticket.is_closed {
            return Err(SupportError::Closed(ticket_id));
        }

        let message = self
            .repo
            .append_message(
                &NewMessage {
                    ticket_id,
                    sender_id: permit.user(),
                    role: None,
                    payload: payload.clone(),
                },
                self.clock.now(),
            )
            .await
            .map_err(|e| closed_or(e, ticket_id))?;

        let relay = format!(
            "💬 #{} {}:\n{}",
            ticket_id,
            sender.display_name,
            payload.text_or_empty()
        );
        match self
            .notifier
            .post_to_staff(ticket.staff_link, &relay, payload.attachment.as_ref())
            .await
        {
            Ok(Some(sent)) => self.remember_relay(message.id, sent.message_id).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, ticket_id = %ticket_id, "Failed to relay user message to staff");
            }
        }

        Ok(message)
    }

    /// Handle a message written by staff on the staff side.
    ///
    /// The sender's role is checked before anything is looked up. The
    /// attendee sees only the role label, never the staff member's name.
    pub async fn append_staff_message(
        &self,
        staff: &Sender,
        locator: StaffLocator<'_>,
        payload: Payload,
    ) -> Result<StaffReplyOutcome, SupportError> {
        let Some(role) = self.staff_role(staff.id) else {
            return Ok(StaffReplyOutcome::Ignored);
        };
        if payload.is_empty() {
            return Ok(StaffReplyOutcome::Ignored);
        }

        let Some(ticket) = self.resolve_ticket(locator).await? else {
            return Ok(StaffReplyOutcome::NotFound);
        };
        if ticket.is_closed {
            return Ok(StaffReplyOutcome::Closed(ticket.id));
        }

        let message = match self
            .repo
            .append_message(
                &NewMessage {
                    ticket_id: ticket.id,
                    sender_id: staff.id,
                    role: Some(role),
                    payload: payload.clone(),
                },
                self.clock.now(),
            )
            .await
        {
            Ok(message) => message,
            Err(RepositoryError::Conflict(_)) => return Ok(StaffReplyOutcome::Closed(ticket.id)),
            Err(e) => return Err(e.into()),
        };

        let text = format!(
            "{} {}:\n\n{}",
            role.emoji(),
            role.label(),
            payload.text_or_empty()
        );
        let delivered = send_payload(
            self.notifier.gateway().as_ref(),
            &Target::user(ticket.user_id),
            payload.attachment.as_ref(),
            &text,
        )
        .await;

        match delivered {
            Ok(sent) => {
                self.remember_relay(message.id, sent.message_id).await;
                let echo = format!(
                    "✅ Ответ по обращению #{} доставлен пользователю\nОтправил: {} ({})",
                    ticket.id,
                    staff.display_name,
                    role.label()
                );
                self.post_staff_note(&ticket, &echo).await;
                tracing::info!(ticket_id = %ticket.id, staff_id = %staff.id, "Staff reply relayed");
                Ok(StaffReplyOutcome::Relayed {
                    ticket_id: ticket.id,
                    message_id: message.id,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, ticket_id = %ticket.id, user_id = %ticket.user_id, "Staff reply not delivered");
                let report = format!(
                    "⚠️ Не удалось доставить ответ по обращению #{}: {}\n\
                     Ответ сохранён, обращение остаётся открытым.\n\
                     Свяжитесь с пользователем по email: {}",
                    ticket.id, e, ticket.email
                );
                self.post_staff_note(&ticket, &report).await;
                Ok(StaffReplyOutcome::DeliveryFailed {
                    ticket_id: ticket.id,
                    message_id: message.id,
                })
            }
        }
    }

    async fn remember_relay(&self, message: TicketMessageId, relayed_as: MessageId) {
        if let Err(e) = self.repo.set_relay_link(message, relayed_as).await {
            tracing::error!(error = %e, message_id = %message, "Failed to store relay link");
        }
    }

    async fn resolve_ticket(
        &self,
        locator: StaffLocator<'_>,
    ) -> Result<Option<Ticket>, SupportError> {
        if let Some(thread) = locator.thread {
            if let Some(ticket) = self.repo.find_by_thread(thread).await? {
                return Ok(Some(ticket));
            }
        }
        let Some(id) = locator.reply_text.and_then(domain::parse_ticket_reference) else {
            return Ok(None);
        };
        Ok(self.repo.get_ticket(id).await?)
    }

    /// Close a ticket once. Returns false, with no side effects, when it
    /// was already closed.
    pub async fn close(&self, ticket_id: TicketId, by: ClosedBy) -> Result<bool, SupportError> {
        let ticket = self
            .repo
            .get_ticket(ticket_id)
            .await?
            .ok_or(SupportError::NotFound(ticket_id))?;
        match by {
            ClosedBy::Owner(user) if ticket.user_id != user => {
                return Err(SupportError::NotOwner(ticket_id));
            }
            ClosedBy::Staff(user) if self.staff_role(user).is_none() => {
                return Err(SupportError::NotStaff(user));
            }
            _ => {}
        }

        if !self.repo.close_ticket(ticket_id, self.clock.now()).await? {
            return Ok(false);
        }
        self.finish_close(&ticket, by).await;

        if let ClosedBy::Staff(_) = by {
            let text = format!(
                "🔒 Обращение #{} закрыто службой поддержки.\n\n\
                 Если вопрос остался, создайте новое обращение.",
                ticket_id
            );
            if let Err(e) = self
                .notifier
                .gateway()
                .send_text(&Target::user(ticket.user_id), &text, None)
                .await
            {
                tracing::warn!(error = %e, ticket_id = %ticket_id, "Failed to tell user about staff close");
            }
        }
        Ok(true)
    }

    /// Log and announce a close that already happened in storage
    async fn announce_closed(&self, ticket_id: TicketId, by: ClosedBy) {
        match self.repo.get_ticket(ticket_id).await {
            Ok(Some(ticket)) => self.finish_close(&ticket, by).await,
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, ticket_id = %ticket_id, "Failed to load closed ticket"),
        }
    }

    async fn finish_close(&self, ticket: &Ticket, by: ClosedBy) {
        tracing::info!(ticket_id = %ticket.id, closed_by = ?by, "Ticket closed");
        self.log_action(
            by.actor().unwrap_or(ticket.user_id),
            "ticket_closed",
            Some(serde_json::json!({ "ticket_id": ticket.id, "by": format!("{by:?}") })),
        )
        .await;
        let note = format!("🔒 Обращение #{} закрыто {}", ticket.id, by.describe());
        self.post_staff_note(ticket, &note).await;
    }

    async fn post_staff_note(&self, ticket: &Ticket, text: &str) {
        if let Err(e) = self
            .notifier
            .post_to_staff(ticket.staff_link, text, None)
            .await
        {
            tracing::warn!(error = %e, ticket_id = %ticket.id, "Failed to post note to staff");
        }
    }

    /// Open tickets whose attendee has waited longer than the SLA for staff
    pub async fn requires_attention(&self) -> Result<Vec<Ticket>, SupportError> {
        let now = self.clock.now();
        let sla = self.settings.sla();
        Ok(self
            .repo
            .open_tickets()
            .await?
            .into_iter()
            .filter(|t| domain::needs_attention(t, now, sla))
            .collect())
    }

    /// Send the overdue list to every admin. Nothing is sent when nothing is overdue.
    pub async fn escalate_overdue(&self) -> Result<FanoutReport, SupportError> {
        let overdue = self.requires_attention().await?;
        if overdue.is_empty() {
            return Ok(FanoutReport::default());
        }

        let now = self.clock.now();
        let mut text = format!(
            "🚨 Обращения без ответа дольше {} ч: {}\n",
            self.settings.sla_hours,
            overdue.len()
        );
        for ticket in overdue.iter().take(10) {
            let waiting = ticket
                .last_user_message_at
                .map(|t| (now - t).num_minutes())
                .unwrap_or_default();
            text.push_str(&format!(
                "\n#{} · ждёт {} ч {} мин · {}",
                ticket.id,
                waiting / 60,
                waiting % 60,
                preview(&ticket.message, 60)
            ));
        }

        let notification = Notification::new(NotificationKind::UrgentTicket, text);
        Ok(self
            .notifier
            .notify(&notification, &self.notifier.admin_recipients())
            .await)
    }

    /// Close tickets answered by staff whose attendee has been silent for
    /// `max_inactivity_days`, telling each attendee.
    pub async fn auto_close_stale(
        &self,
        max_inactivity_days: i64,
    ) -> Result<Vec<TicketId>, SupportError> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(max_inactivity_days);
        let stale: Vec<Ticket> = self
            .repo
            .open_tickets()
            .await?
            .into_iter()
            .filter(|t| domain::is_stale(t, cutoff))
            .collect();

        let mut closed = Vec::new();
        for ticket in stale {
            if !self.repo.close_ticket(ticket.id, now).await? {
                continue;
            }
            self.finish_close(&ticket, ClosedBy::Inactivity).await;
            let text = format!(
                "🔒 Обращение #{} закрыто автоматически: \
                 от вас не было сообщений {} дн.\n\n\
                 Если вопрос остался, создайте новое обращение.",
                ticket.id, max_inactivity_days
            );
            if let Err(e) = self
                .notifier
                .gateway()
                .send_text(&Target::user(ticket.user_id), &text, None)
                .await
            {
                tracing::warn!(error = %e, ticket_id = %ticket.id, "Failed to tell user about auto-close");
            }
            closed.push(ticket.id);
        }

        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "Auto-closed inactive tickets");
        }
        Ok(closed)
    }

    /// A page of a ticket's messages. Attendees may only read their own tickets.
    pub async fn history(
        &self,
        ticket_id: TicketId,
        viewer: UserId,
        offset: usize,
    ) -> Result<TicketHistory, SupportError> {
        let ticket = self
            .repo
            .get_ticket(ticket_id)
            .await?
            .ok_or(SupportError::NotFound(ticket_id))?;
        if ticket.user_id != viewer && self.staff_role(viewer).is_none() {
            return Err(SupportError::NotOwner(ticket_id));
        }
        let messages = self
            .repo
            .list_messages(ticket_id, self.settings.history_page, offset)
            .await?;
        let total = self.repo.count_messages(ticket_id).await?;
        Ok(TicketHistory {
            ticket,
            messages,
            total,
        })
    }

    pub async fn search(&self, query: &TicketQuery) -> Result<Vec<Ticket>, SupportError> {
        Ok(self.repo.search(query).await?)
    }

    pub async fn stats(&self) -> Result<SupportStats, SupportError> {
        Ok(self.repo.stats(self.clock.now()).await?)
    }
}

fn closed_or(error: RepositoryError, ticket_id: TicketId) -> SupportError {
    match error {
        RepositoryError::Conflict(_) => SupportError::Closed(ticket_id),
        RepositoryError::NotFound(_) => SupportError::NotFound(ticket_id),
        other => other.into(),
    }
}

/// First `max` characters on one line
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}…")
    } else {
        line.to_string()
    }
}

fn staff_header(ticket: &Ticket, sender: &Sender) -> String {
    let username = sender
        .username
        .as_deref()
        .map(|u| format!(" (@{u})"))
        .unwrap_or_default();
    format!(
        "🆕 Обращение #{}\n\
         👤 {}{}\n\
         🆔 {}\n\
         📧 {}\n\
         🕐 {}\n\n\
         {}",
        ticket.id,
        sender.display_name,
        username,
        ticket.user_id,
        ticket.email,
        ticket.created_at.format("%d.%m.%Y %H:%M"),
        if ticket.message.is_empty() {
            "(вложение)"
        } else {
            ticket.message.as_str()
        }
    )
}
