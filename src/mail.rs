// SMTP notice to the support mailbox for every new ticket
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;

use crate::config::SmtpConfig;
use crate::ids::TicketId;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build email: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Mail task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What the support mailbox is told about a new ticket
#[derive(Debug, Clone)]
pub struct TicketNotice<'a> {
    pub ticket_id: TicketId,
    pub user_name: &'a str,
    pub contact_email: &'a str,
    pub message: &'a str,
    pub created_at: DateTime<Utc>,
}

fn notice_subject(notice: &TicketNotice<'_>) -> String {
    format!("Новое обращение #{} от {}", notice.ticket_id, notice.user_name)
}

fn notice_body(notice: &TicketNotice<'_>) -> String {
    format!(
        "Новое обращение в поддержку\n\n\
         ID тикета: #{}\n\
         От пользователя: {}\n\
         Email: {}\n\
         Время: {}\n\n\
         Сообщение:\n{}\n\n\
         ---\n\
         Это автоматическое уведомление от системы поддержки фестиваля.",
        notice.ticket_id,
        notice.user_name,
        notice.contact_email,
        notice.created_at.format("%d.%m.%Y %H:%M:%S"),
        notice.message,
    )
}

#[derive(Clone)]
pub struct Mailer {
    transport: SmtpTransport,
    from: Mailbox,
    to: Mailbox,
}

impl Mailer {
    /// `None` when SMTP is not fully configured
    pub fn from_config(config: &SmtpConfig) -> Result<Option<Self>, MailError> {
        let (Some(server), Some(user), Some(password), Some(support)) = (
            config.server.as_deref(),
            config.user.as_deref(),
            config.password.as_deref(),
            config.support_email.as_deref(),
        ) else {
            return Ok(None);
        };

        // 465 speaks TLS from the first byte, everything else upgrades with STARTTLS
        let builder = if config.port == 465 {
            SmtpTransport::relay(server)?
        } else {
            SmtpTransport::starttls_relay(server)?
        };
        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();

        Ok(Some(Self {
            transport,
            from: user.parse()?,
            to: support.parse()?,
        }))
    }

    pub fn build_notice(&self, notice: &TicketNotice<'_>) -> Result<Message, MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(notice_subject(notice))
            .header(ContentType::TEXT_PLAIN)
            .body(notice_body(notice))?;

        Ok(message)
    }

    /// Sends on the blocking pool; SMTP I/O is synchronous
    pub async fn send_ticket_notice(&self, notice: &TicketNotice<'_>) -> Result<(), MailError> {
        let message = self.build_notice(notice)?;
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message)).await??;
        tracing::info!(ticket_id = %notice.ticket_id, "Support mailbox notified");
        Ok(())
    }
}
