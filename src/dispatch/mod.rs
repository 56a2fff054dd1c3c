// Front-end: routes inbound gateway events to the engines
pub mod actions;
pub mod keyboards;
pub mod queue;
pub mod texts;

use std::sync::Arc;
use thiserror::Error;

use crate::config::parse_coordinates;
use crate::db::models::Ticket;
use crate::db::RepositoryError;
use crate::feedback::{FeedbackCategory, FeedbackError, Rating};
use crate::gateway::{
    CallbackEvent, CommandEvent, InboundEvent, Keyboard, MessageEvent, Sender, Target,
};
use crate::ids::{ChatId, FeedbackId, MessageId, ThreadId, TicketId, UserId};
use crate::ratelimit::Admitted;
use crate::session::Session;
use crate::state::Services;
use crate::support::repository::StatusFilter;
use crate::support::{
    ClosedBy, EmailAddress, StaffLocator, StaffReplyOutcome, StartOutcome, SupportError,
    TicketQuery,
};

pub use actions::CallbackAction;
pub use queue::EventQueue;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Support(#[from] SupportError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

type DispatchResult = Result<(), DispatchError>;

pub struct Dispatcher {
    services: Arc<Services>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Handle one inbound event. Never fails: errors are logged and the
    /// user gets a retry-later message.
    pub async fn handle(&self, event: InboundEvent) {
        let sender = event.sender().id;
        let chat = event.chat();

        if let Err(e) = self.route(&event).await {
            tracing::error!(error = %e, user_id = %sender, chat = %chat, "Failed to handle event");
            if event.is_private() {
                self.say(Target::chat(chat), texts::retry_later(), None).await;
            }
        }
    }

    async fn route(&self, event: &InboundEvent) -> DispatchResult {
        self.services.tickets.touch_user(event.sender()).await?;

        match event {
            InboundEvent::Command(command) if event.is_private() => self.on_command(command).await,
            InboundEvent::Command(_) => Ok(()),
            InboundEvent::Callback(callback) => self.on_callback(callback).await,
            InboundEvent::Message(message) if event.is_private() => {
                self.on_private_message(message).await
            }
            InboundEvent::Message(message) => self.on_group_message(message).await,
        }
    }

    async fn say(&self, target: Target, text: &str, keyboard: Option<&Keyboard>) {
        if let Err(e) = self.services.gateway.send_text(&target, text, keyboard).await {
            tracing::warn!(error = %e, chat = %target.chat, "Failed to send reply");
        }
    }

    async fn reply(&self, user: UserId, text: &str, keyboard: Keyboard) {
        self.say(Target::user(user), text, Some(&keyboard)).await;
    }

    /// Replace the message a button was pressed on, or send a new one
    async fn show(&self, callback: &CallbackEvent, text: &str, keyboard: Keyboard) {
        if let Some(message_id) = callback.message_id {
            match self
                .services
                .gateway
                .edit_message(callback.chat, message_id, text, Some(&keyboard))
                .await
            {
                Ok(()) => return,
                Err(e) => tracing::debug!(error = %e, "Edit failed, sending a new message"),
            }
        }
        self.say(Target::chat(callback.chat), text, Some(&keyboard)).await;
    }

    fn map_url(&self) -> Option<String> {
        let raw = self.services.config.festival.coordinates.as_deref()?;
        let (lat, lon) = parse_coordinates(raw)?;
        Some(format!("https://maps.google.com/?q={lat},{lon}"))
    }

    async fn main_menu(&self, user: UserId) -> Result<Keyboard, DispatchError> {
        let open = self
            .services
            .tickets
            .repository()
            .find_open_by_user(user)
            .await?
            .is_some();
        Ok(keyboards::main_menu(open, self.map_url().as_deref()))
    }

    fn is_admin(&self, user: UserId) -> bool {
        self.services.config.staff.is_admin(user)
    }

    // Commands

    async fn on_command(&self, command: &CommandEvent) -> DispatchResult {
        let user = command.sender.id;
        match command.command.as_str() {
            "start" => {
                self.services.sessions.clear(user).await;
                self.services.tickets.log_action(user, "start", None).await;
                let text = texts::welcome(
                    &self.services.config.festival.name,
                    &command.sender.display_name,
                );
                let menu = self.main_menu(user).await?;
                self.reply(user, &text, menu).await;
            }
            "menu" => {
                self.services.sessions.clear(user).await;
                let menu = self.main_menu(user).await?;
                self.reply(user, texts::main_menu(), menu).await;
            }
            "admin" if self.is_admin(user) => {
                self.reply(user, texts::admin_menu(), keyboards::admin_menu())
                    .await;
            }
            "search" if self.is_admin(user) => {
                let Some(query) = search_query(&command.args) else {
                    self.reply(user, texts::search_usage(), keyboards::admin_menu())
                        .await;
                    return Ok(());
                };
                let tickets = self.services.tickets.search(&query).await?;
                self.reply(user, &texts::search_results(&tickets), keyboards::admin_menu())
                    .await;
            }
            other => tracing::debug!(command = other, user_id = %user, "Ignoring command"),
        }
        Ok(())
    }

    // Callbacks

    async fn on_callback(&self, callback: &CallbackEvent) -> DispatchResult {
        if let Err(e) = self
            .services
            .gateway
            .answer_callback(&callback.id, None)
            .await
        {
            tracing::debug!(error = %e, "Failed to answer callback");
        }

        let action = match callback.data.parse::<CallbackAction>() {
            Ok(action) => action,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unknown callback");
                return Ok(());
            }
        };
        let user = callback.sender.id;

        match action {
            CallbackAction::MainMenu => {
                self.services.sessions.clear(user).await;
                let menu = self.main_menu(user).await?;
                self.show(callback, texts::main_menu(), menu).await;
            }
            CallbackAction::Support => self.show_support(callback).await?,
            CallbackAction::NewTicket => {
                let open = self
                    .services
                    .tickets
                    .repository()
                    .find_open_by_user(user)
                    .await?;
                self.services.sessions.set(user, Session::AwaitingEmail).await;
                self.show(callback, &texts::ask_email(open.as_ref()), keyboards::back_to_main())
                    .await;
            }
            CallbackAction::ContinueDialog(id) => {
                let Some(ticket) = self.own_open_ticket(user, id).await? else {
                    self.show(callback, texts::ticket_unavailable(), keyboards::back_to_main())
                        .await;
                    return Ok(());
                };
                self.services
                    .sessions
                    .set(user, Session::InDialogue(ticket.id))
                    .await;
                self.show(
                    callback,
                    &texts::continue_dialog(&ticket),
                    keyboards::active_dialog(ticket.id),
                )
                .await;
            }
            CallbackAction::ShowHistory(id) => {
                match self.services.tickets.history(id, user, 0).await {
                    Ok(history) => {
                        self.show(callback, &texts::ticket_history(&history), keyboards::history(id))
                            .await;
                    }
                    Err(SupportError::NotFound(_) | SupportError::NotOwner(_)) => {
                        self.show(callback, texts::ticket_unavailable(), keyboards::back_to_main())
                            .await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            CallbackAction::CloseTicket(id) => {
                let Some(ticket) = self.own_open_ticket(user, id).await? else {
                    self.show(callback, texts::ticket_unavailable(), keyboards::back_to_main())
                        .await;
                    return Ok(());
                };
                self.show(
                    callback,
                    &texts::confirm_close(&ticket),
                    keyboards::confirm_close(ticket.id),
                )
                .await;
            }
            CallbackAction::ConfirmClose(id) => self.confirm_close(callback, id).await?,
            CallbackAction::BackToTicket(_) => self.show_support(callback).await?,
            CallbackAction::Feedback => {
                self.services.sessions.clear(user).await;
                self.show(callback, texts::choose_category(), keyboards::feedback_categories())
                    .await;
            }
            CallbackAction::FeedbackCategory(category) => {
                self.services
                    .sessions
                    .set(user, Session::AwaitingRating { category })
                    .await;
                self.show(callback, &texts::choose_rating(category), keyboards::ratings())
                    .await;
            }
            CallbackAction::Rating(rating) => {
                let Some(Session::AwaitingRating { category }) =
                    self.services.sessions.get(user).await
                else {
                    self.show(callback, texts::choose_category(), keyboards::feedback_categories())
                        .await;
                    return Ok(());
                };
                self.services
                    .sessions
                    .set(user, Session::AwaitingRatingComment { category, rating })
                    .await;
                self.show(callback, texts::ask_comment(), keyboards::skip_comment())
                    .await;
            }
            CallbackAction::SkipComment => {
                if let Some(Session::AwaitingRatingComment { category, rating }) =
                    self.services.sessions.get(user).await
                {
                    self.submit_feedback(&callback.sender, category, rating, None)
                        .await?;
                } else {
                    self.show(callback, texts::choose_category(), keyboards::feedback_categories())
                        .await;
                }
            }
            CallbackAction::AdminSupportDashboard if self.is_admin(user) => {
                let stats = self.services.tickets.stats().await?;
                self.show(callback, &texts::support_dashboard(&stats), keyboards::admin_menu())
                    .await;
            }
            CallbackAction::AdminAttention if self.is_admin(user) => {
                let tickets = self.services.tickets.requires_attention().await?;
                let text = texts::attention_list(
                    &tickets,
                    self.services.clock.now(),
                    self.services.config.support.sla_hours,
                );
                self.show(callback, &text, keyboards::admin_menu()).await;
            }
            CallbackAction::AdminCriticalFeedback if self.is_admin(user) => {
                self.show_critical_feedback(callback, None).await?;
            }
            CallbackAction::ResolveFeedback(id) if self.is_admin(user) => {
                self.show_critical_feedback(callback, Some(id)).await?;
            }
            CallbackAction::StaffClose(id) if self.services.config.staff.is_staff(user) => {
                self.staff_close(id, user).await?;
            }
            CallbackAction::AdminSupportDashboard
            | CallbackAction::AdminAttention
            | CallbackAction::AdminCriticalFeedback
            | CallbackAction::ResolveFeedback(_)
            | CallbackAction::StaffClose(_) => {
                tracing::debug!(user_id = %user, "Ignoring staff action from non-staff");
            }
        }
        Ok(())
    }

    async fn own_open_ticket(
        &self,
        user: UserId,
        id: TicketId,
    ) -> Result<Option<Ticket>, DispatchError> {
        let ticket = self.services.tickets.repository().get_ticket(id).await?;
        Ok(ticket.filter(|t| t.user_id == user && t.is_open()))
    }

    async fn show_support(&self, callback: &CallbackEvent) -> DispatchResult {
        let user = callback.sender.id;
        match self.services.tickets.start_or_resume(user).await? {
            StartOutcome::Existing(summary) => {
                self.show(
                    callback,
                    &texts::ticket_summary(&summary),
                    keyboards::open_ticket_menu(summary.ticket.id),
                )
                .await;
            }
            StartOutcome::NewTicketPrompt => {
                self.services.sessions.set(user, Session::AwaitingEmail).await;
                self.show(callback, &texts::ask_email(None), keyboards::no_ticket_menu())
                    .await;
            }
        }
        Ok(())
    }

    async fn confirm_close(&self, callback: &CallbackEvent, id: TicketId) -> DispatchResult {
        let user = callback.sender.id;
        match self.services.tickets.close(id, ClosedBy::Owner(user)).await {
            Ok(closed) => {
                self.services.sessions.end_dialogue(id).await;
                let ticket = self.services.tickets.repository().get_ticket(id).await?;
                let text = match (&ticket, closed) {
                    (Some(t), true) => texts::ticket_closed(t),
                    (Some(t), false) => texts::ticket_already_closed(t),
                    (None, _) => texts::ticket_unavailable().to_string(),
                };
                self.show(callback, &text, keyboards::after_close()).await;
                Ok(())
            }
            Err(SupportError::NotFound(_) | SupportError::NotOwner(_)) => {
                self.show(callback, texts::ticket_unavailable(), keyboards::back_to_main())
                    .await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close from the staff group. The engine tells the attendee and the
    /// group; a second press is a no-op.
    async fn staff_close(&self, id: TicketId, staff: UserId) -> DispatchResult {
        match self.services.tickets.close(id, ClosedBy::Staff(staff)).await {
            Ok(closed) => {
                self.services.sessions.end_dialogue(id).await;
                if !closed {
                    tracing::debug!(ticket_id = %id, "Staff close on an already closed ticket");
                }
                Ok(())
            }
            Err(SupportError::NotFound(_)) => {
                tracing::warn!(ticket_id = %id, "Staff close on an unknown ticket");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn show_critical_feedback(
        &self,
        callback: &CallbackEvent,
        resolve: Option<FeedbackId>,
    ) -> DispatchResult {
        let mut header = String::new();
        if let Some(id) = resolve {
            match self.services.feedback.respond(id, callback.sender.id, None).await {
                Ok(feedback) => header = format!("{}\n\n", texts::feedback_resolved(&feedback)),
                Err(FeedbackError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let items = self.services.feedback.critical(10).await?;
        let stats = self.services.feedback.stats().await?;
        let ids: Vec<FeedbackId> = items.iter().map(|f| f.id).collect();
        let text = format!("{header}{}", texts::critical_feedback(&items, &stats));
        self.show(callback, &text, keyboards::resolve_feedback(&ids))
            .await;
        Ok(())
    }

    // Messages

    /// Run the rate limiter; on rejection the user is told how long to wait
    async fn admit(&self, user: UserId) -> Result<Option<Admitted>, DispatchError> {
        let decision = self.services.limiter.check(user).await?;
        if let Some(permit) = decision.permit() {
            return Ok(Some(permit));
        }
        self.reply(
            user,
            &texts::rate_limited(&decision.reason, decision.wait_seconds),
            keyboards::rate_limited(),
        )
        .await;
        Ok(None)
    }

    async fn on_private_message(&self, message: &MessageEvent) -> DispatchResult {
        let user = message.sender.id;
        let session = self.services.sessions.get(user).await;

        match session {
            Some(Session::AwaitingEmail) => {
                let input = message.payload.text_or_empty();
                match EmailAddress::parse(input) {
                    Ok(email) => {
                        self.services
                            .sessions
                            .set(user, Session::AwaitingMessage { email })
                            .await;
                        self.reply(user, texts::ask_message(), keyboards::back_to_main())
                            .await;
                    }
                    Err(_) => {
                        self.reply(user, &texts::invalid_email(input.trim()), keyboards::back_to_main())
                            .await;
                    }
                }
            }
            Some(Session::AwaitingMessage { email }) => {
                if message.payload.is_empty() {
                    self.reply(user, texts::empty_message(), keyboards::back_to_main())
                        .await;
                    return Ok(());
                }
                let Some(permit) = self.admit(user).await? else {
                    return Ok(());
                };
                let ticket = self
                    .services
                    .tickets
                    .create(permit, &message.sender, email.as_str(), message.payload.clone())
                    .await?;
                self.services
                    .sessions
                    .set(user, Session::InDialogue(ticket.id))
                    .await;
                self.reply(
                    user,
                    &texts::ticket_created(&ticket, self.services.config.support.sla_hours),
                    keyboards::active_dialog(ticket.id),
                )
                .await;
            }
            Some(Session::InDialogue(ticket_id)) => {
                self.continue_dialogue(message, ticket_id).await?;
            }
            Some(Session::AwaitingRatingComment { category, rating }) => {
                let comment = message.payload.text.clone();
                self.submit_feedback(&message.sender, category, rating, comment)
                    .await?;
            }
            Some(Session::AwaitingRating { category }) => {
                self.reply(user, &texts::choose_rating(category), keyboards::ratings())
                    .await;
            }
            None => {
                let menu = self.main_menu(user).await?;
                self.reply(user, texts::use_menu(), menu).await;
            }
        }
        Ok(())
    }

    async fn continue_dialogue(&self, message: &MessageEvent, ticket_id: TicketId) -> DispatchResult {
        let user = message.sender.id;
        if message.payload.is_empty() {
            self.reply(user, texts::empty_message(), keyboards::active_dialog(ticket_id))
                .await;
            return Ok(());
        }
        let Some(permit) = self.admit(user).await? else {
            return Ok(());
        };

        let result = self
            .services
            .tickets
            .append_user_message(permit, ticket_id, &message.sender, message.payload.clone())
            .await;
        match result {
            Ok(_) => {
                if let Some(ticket) = self.services.tickets.repository().get_ticket(ticket_id).await? {
                    self.reply(user, &texts::message_added(&ticket), keyboards::active_dialog(ticket_id))
                        .await;
                }
            }
            Err(SupportError::Closed(_) | SupportError::NotFound(_) | SupportError::NotOwner(_)) => {
                self.services.sessions.clear(user).await;
                self.reply(user, texts::ticket_unavailable(), keyboards::after_close())
                    .await;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn submit_feedback(
        &self,
        sender: &Sender,
        category: FeedbackCategory,
        rating: Rating,
        comment: Option<String>,
    ) -> DispatchResult {
        let receipt = self
            .services
            .feedback
            .submit(sender, category, rating, comment)
            .await?;
        self.services.sessions.clear(sender.id).await;
        self.services
            .tickets
            .log_action(
                sender.id,
                "feedback_submitted",
                Some(serde_json::json!({
                    "feedback_id": receipt.feedback.id,
                    "category": category,
                    "rating": rating,
                })),
            )
            .await;
        self.reply(sender.id, &receipt.acknowledgment, keyboards::after_feedback())
            .await;
        Ok(())
    }

    /// Messages in the staff group: replies inside a ticket thread or to a
    /// ticket post. Plain group chatter is left alone.
    async fn on_group_message(&self, message: &MessageEvent) -> DispatchResult {
        if Some(message.chat) != self.services.notifier.staff_group() {
            return Ok(());
        }
        if message.thread.is_none() && message.reply_to.is_none() {
            return Ok(());
        }

        let locator = StaffLocator {
            thread: message.thread,
            reply_text: message.reply_to.as_ref().and_then(|r| r.text.as_deref()),
        };
        let outcome = self
            .services
            .tickets
            .append_staff_message(&message.sender, locator, message.payload.clone())
            .await?;

        let target = staff_reply_target(message.chat, message.thread, message.message_id);
        match outcome {
            StaffReplyOutcome::NotFound => {
                self.say(target, texts::staff_ticket_not_found(), None).await;
            }
            StaffReplyOutcome::Closed(ticket_id) => {
                self.say(target, &texts::staff_ticket_closed(ticket_id), None)
                    .await;
            }
            StaffReplyOutcome::Relayed { .. }
            | StaffReplyOutcome::DeliveryFailed { .. }
            | StaffReplyOutcome::Ignored => {}
        }
        Ok(())
    }
}

/// `[open|closed] <text>`; `None` when there is nothing to search for
fn search_query(args: &str) -> Option<TicketQuery> {
    let args = args.trim();
    let (status, text) = match args.split_once(char::is_whitespace) {
        Some(("open", rest)) => (Some(StatusFilter::Open), rest.trim()),
        Some(("closed", rest)) => (Some(StatusFilter::Closed), rest.trim()),
        _ => match args {
            "open" => (Some(StatusFilter::Open), ""),
            "closed" => (Some(StatusFilter::Closed), ""),
            other => (None, other),
        },
    };
    if text.is_empty() && status.is_none() {
        return None;
    }
    Some(TicketQuery {
        text: (!text.is_empty()).then(|| text.to_string()),
        user: None,
        status,
        limit: Some(20),
    })
}

fn staff_reply_target(chat: ChatId, thread: Option<ThreadId>, message_id: MessageId) -> Target {
    Target {
        chat,
        thread,
        reply_to: Some(message_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ChannelsConfig, Config, StaffConfig};
    use crate::gateway::{Payload, RecordingGateway, ReplyContext};
    use chrono::{Duration, TimeZone, Utc};

    const GROUP: ChatId = ChatId(-1001);
    const ADMIN: UserId = UserId(1);
    const AGENT: UserId = UserId(2);
    const FAN: UserId = UserId(100);

    struct Harness {
        _tmp: tempfile::TempDir,
        gateway: Arc<RecordingGateway>,
        clock: Arc<ManualClock>,
        services: Arc<Services>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(&tmp);
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 7, 12, 12, 0, 0).unwrap(),
        ));
        let config = Config {
            staff: StaffConfig {
                admin_ids: vec![ADMIN],
                support_staff_ids: vec![AGENT],
            },
            channels: ChannelsConfig {
                support_group_id: Some(GROUP),
                support_group_topics: true,
                feedback_channel_id: None,
            },
            ..Config::default()
        };
        let services = Arc::new(Services::new(
            Arc::new(config),
            pool,
            gateway.clone(),
            None,
            clock.clone(),
        ));
        Harness {
            _tmp: tmp,
            gateway,
            clock,
            dispatcher: Dispatcher::new(services.clone()),
            services,
        }
    }

    fn person(id: UserId, name: &str) -> Sender {
        Sender {
            id,
            display_name: name.into(),
            username: None,
            locale: None,
        }
    }

    fn command(user: UserId, name: &str) -> InboundEvent {
        InboundEvent::Command(CommandEvent {
            sender: person(user, "Аня"),
            chat: user.into(),
            command: name.into(),
            args: String::new(),
        })
    }

    fn press(user: UserId, data: &str) -> InboundEvent {
        InboundEvent::Callback(CallbackEvent {
            id: format!("cb-{data}"),
            sender: person(user, "Аня"),
            chat: user.into(),
            message_id: None,
            data: data.into(),
        })
    }

    fn say(user: UserId, text: &str) -> InboundEvent {
        InboundEvent::Message(MessageEvent {
            sender: person(user, "Аня"),
            chat: user.into(),
            message_id: MessageId(1),
            thread: None,
            reply_to: None,
            payload: Payload::text(text),
        })
    }

    fn last_to(h: &Harness, chat: ChatId) -> String {
        h.gateway.bodies_to(chat).pop().unwrap_or_default()
    }

    async fn open_ticket(h: &Harness) -> TicketId {
        h.dispatcher.handle(press(FAN, "support")).await;
        h.dispatcher.handle(say(FAN, "fan@example.com")).await;
        h.dispatcher.handle(say(FAN, "Потерял кошелёк у сцены")).await;
        match h.services.sessions.get(FAN).await {
            Some(Session::InDialogue(id)) => id,
            other => panic!("expected dialogue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_shows_welcome_with_menu() {
        let h = harness();
        h.dispatcher.handle(command(FAN, "start")).await;

        let sent = h.gateway.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body().unwrap_or_default().contains("Привет, Аня"));
        assert!(h.services.tickets.repository().get_user(FAN).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn intake_rejects_bad_email_then_creates_ticket() {
        let h = harness();
        h.dispatcher.handle(press(FAN, "support")).await;
        assert_eq!(h.services.sessions.get(FAN).await, Some(Session::AwaitingEmail));

        h.dispatcher.handle(say(FAN, "not-an-email")).await;
        assert!(last_to(&h, FAN.into()).contains("не похоже на email"));
        assert_eq!(h.services.sessions.get(FAN).await, Some(Session::AwaitingEmail));

        h.dispatcher.handle(say(FAN, "fan@example.com")).await;
        assert!(matches!(
            h.services.sessions.get(FAN).await,
            Some(Session::AwaitingMessage { .. })
        ));

        h.dispatcher.handle(say(FAN, "Потерял кошелёк у сцены")).await;
        assert!(last_to(&h, FAN.into()).contains("принято"));
        assert_eq!(h.gateway.threads().len(), 1);
    }

    #[tokio::test]
    async fn staff_reply_in_thread_reaches_the_user() {
        let h = harness();
        let ticket = open_ticket(&h).await;
        let (_, _, thread) = h.gateway.threads()[0].clone();
        h.gateway.clear();

        h.dispatcher
            .handle(InboundEvent::Message(MessageEvent {
                sender: person(AGENT, "Олег"),
                chat: GROUP,
                message_id: MessageId(900),
                thread: Some(thread),
                reply_to: None,
                payload: Payload::text("Кошелёк у нас на инфостойке"),
            }))
            .await;

        let to_fan = last_to(&h, FAN.into());
        assert!(to_fan.contains("Кошелёк у нас на инфостойке"));
        assert!(!to_fan.contains("Олег"));
        let ticket = h.services.tickets.repository().get_ticket(ticket).await.unwrap().unwrap();
        assert!(ticket.last_staff_response_at.is_some());
    }

    #[tokio::test]
    async fn staff_reply_without_ticket_reference_gets_hint() {
        let h = harness();
        h.dispatcher
            .handle(InboundEvent::Message(MessageEvent {
                sender: person(AGENT, "Олег"),
                chat: GROUP,
                message_id: MessageId(901),
                thread: None,
                reply_to: Some(ReplyContext {
                    message_id: MessageId(5),
                    text: Some("просто сообщение".into()),
                }),
                payload: Payload::text("ответ"),
            }))
            .await;

        assert!(last_to(&h, GROUP).contains("Не удалось определить обращение"));
    }

    #[tokio::test]
    async fn group_chatter_is_ignored() {
        let h = harness();
        h.dispatcher
            .handle(InboundEvent::Message(MessageEvent {
                sender: person(AGENT, "Олег"),
                chat: GROUP,
                message_id: MessageId(902),
                thread: None,
                reply_to: None,
                payload: Payload::text("кто обедать?"),
            }))
            .await;
        assert!(h.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn rapid_messages_in_dialogue_are_rate_limited() {
        let h = harness();
        let ticket = open_ticket(&h).await;

        h.dispatcher.handle(say(FAN, "ещё деталь")).await;
        assert!(last_to(&h, FAN.into()).starts_with("⏳"));

        h.clock.advance(Duration::seconds(10));
        h.dispatcher.handle(say(FAN, "ещё деталь")).await;
        assert!(last_to(&h, FAN.into()).contains(&format!("#{ticket}")));
        assert_eq!(
            h.services.tickets.repository().count_messages(ticket).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn closing_ends_the_dialogue() {
        let h = harness();
        let ticket = open_ticket(&h).await;

        h.dispatcher.handle(press(FAN, &format!("confirm_close_{ticket}"))).await;
        assert!(last_to(&h, FAN.into()).contains("закрыто"));
        assert_eq!(h.services.sessions.get(FAN).await, None);

        h.dispatcher.handle(press(FAN, &format!("confirm_close_{ticket}"))).await;
        assert!(last_to(&h, FAN.into()).contains("уже закрыто"));
    }

    #[tokio::test]
    async fn low_rating_with_comment_alerts_staff() {
        let h = harness();
        h.dispatcher.handle(press(FAN, "feedback")).await;
        h.dispatcher.handle(press(FAN, "feedback_food")).await;
        h.dispatcher.handle(press(FAN, "rating_1")).await;
        h.dispatcher.handle(say(FAN, "Очередь на час")).await;

        assert!(last_to(&h, FAN.into()).contains("жаль"));
        assert_eq!(h.services.sessions.get(FAN).await, None);
        assert!(h
            .gateway
            .bodies_to(GROUP)
            .iter()
            .any(|b| b.contains("Очередь на час")));
    }

    #[tokio::test]
    async fn rating_without_category_restarts_feedback() {
        let h = harness();
        h.dispatcher.handle(press(FAN, "rating_5")).await;
        assert!(last_to(&h, FAN.into()).contains("Выберите, что хотите оценить"));
        assert_eq!(h.services.sessions.get(FAN).await, None);
    }

    #[tokio::test]
    async fn admin_views_are_silent_for_others() {
        let h = harness();
        h.dispatcher.handle(command(FAN, "admin")).await;
        h.dispatcher.handle(press(FAN, "admin_support_dashboard")).await;
        assert!(h.gateway.bodies_to(FAN.into()).is_empty());

        h.dispatcher.handle(command(ADMIN, "admin")).await;
        h.dispatcher.handle(press(ADMIN, "admin_support_dashboard")).await;
        assert!(last_to(&h, ADMIN.into()).contains("Панель поддержки"));
    }

    fn press_in_group(user: UserId, data: &str) -> InboundEvent {
        InboundEvent::Callback(CallbackEvent {
            id: format!("cb-{data}"),
            sender: person(user, "Олег"),
            chat: GROUP,
            message_id: Some(MessageId(5)),
            data: data.into(),
        })
    }

    fn search(user: UserId, args: &str) -> InboundEvent {
        InboundEvent::Command(CommandEvent {
            sender: person(user, "Аня"),
            chat: user.into(),
            command: "search".into(),
            args: args.into(),
        })
    }

    fn deliveries(h: &Harness) -> usize {
        h.gateway.sent().iter().filter(|o| o.body().is_some()).count()
    }

    #[tokio::test]
    async fn staff_close_button_ends_the_dialogue() {
        let h = harness();
        let ticket = open_ticket(&h).await;

        h.dispatcher
            .handle(press_in_group(AGENT, &format!("staff_close_{ticket}")))
            .await;

        assert_eq!(h.services.sessions.get(FAN).await, None);
        let stored = h
            .services
            .tickets
            .repository()
            .get_ticket(ticket)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_closed);
        assert!(last_to(&h, FAN.into()).contains("закрыто службой поддержки"));

        let before = deliveries(&h);
        h.dispatcher
            .handle(press_in_group(ADMIN, &format!("staff_close_{ticket}")))
            .await;
        assert_eq!(deliveries(&h), before);
    }

    #[tokio::test]
    async fn staff_close_from_outsiders_is_ignored() {
        let h = harness();
        let ticket = open_ticket(&h).await;
        let before = deliveries(&h);

        h.dispatcher
            .handle(press_in_group(UserId(555), &format!("staff_close_{ticket}")))
            .await;
        h.dispatcher
            .handle(press(FAN, &format!("staff_close_{ticket}")))
            .await;

        assert_eq!(deliveries(&h), before);
        assert_eq!(h.services.sessions.get(FAN).await, Some(Session::InDialogue(ticket)));
        let stored = h
            .services
            .tickets
            .repository()
            .get_ticket(ticket)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_open());
    }

    #[tokio::test]
    async fn admin_search_lists_matching_tickets() {
        let h = harness();
        let ticket = open_ticket(&h).await;

        h.dispatcher.handle(search(ADMIN, "кошелёк")).await;
        let found = last_to(&h, ADMIN.into());
        assert!(found.contains(&format!("#{ticket}")));
        assert!(found.contains("fan@example.com"));

        h.dispatcher.handle(search(ADMIN, "closed кошелёк")).await;
        assert!(last_to(&h, ADMIN.into()).contains("Ничего не найдено"));

        h.dispatcher.handle(search(ADMIN, "  ")).await;
        assert!(last_to(&h, ADMIN.into()).contains("Использование"));

        h.dispatcher.handle(search(FAN, "кошелёк")).await;
        assert!(!last_to(&h, FAN.into()).contains("Найдено"));
    }

    #[test]
    fn search_arguments_parse_status_and_text() {
        let query = search_query("open  браслет не работает").unwrap();
        assert_eq!(query.status, Some(StatusFilter::Open));
        assert_eq!(query.text.as_deref(), Some("браслет не работает"));

        let query = search_query("closed").unwrap();
        assert_eq!(query.status, Some(StatusFilter::Closed));
        assert_eq!(query.text, None);

        assert!(search_query("").is_none());
    }
}
