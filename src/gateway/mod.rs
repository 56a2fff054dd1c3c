pub mod recording;
pub mod telegram;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::ids::{ChatId, MessageId, ThreadId};

pub use recording::{Outbound, RecordingGateway};
pub use telegram::TelegramGateway;
pub use types::{
    Attachment, Button, ButtonAction, CallbackEvent, CommandEvent, EventPayload, InboundEvent,
    Keyboard, MediaKind, MessageEvent, MessageKind, Payload, ReplyContext, Sender, SentMessage,
    Target,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The recipient blocked the bot or left the chat
    #[error("Recipient unavailable: {0}")]
    Blocked(String),

    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outbound side of the chat transport
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_text(
        &self,
        target: &Target,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<SentMessage, GatewayError>;

    async fn send_media(
        &self,
        target: &Target,
        attachment: &Attachment,
        caption: Option<&str>,
    ) -> Result<SentMessage, GatewayError>;

    /// Open a dedicated thread inside a group
    async fn create_thread(&self, parent: ChatId, title: &str) -> Result<ThreadId, GatewayError>;

    async fn edit_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), GatewayError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>)
        -> Result<(), GatewayError>;

    /// Liveness probe; returns the bot's own handle
    async fn probe(&self) -> Result<String, GatewayError>;

    /// Release the underlying session
    async fn close(&self) {}
}

pub type DynGateway = Arc<dyn MessagingGateway>;

/// Send text and/or media as one logical message.
/// Media goes first with the text as caption.
pub async fn send_payload(
    gateway: &dyn MessagingGateway,
    target: &Target,
    attachment: Option<&Attachment>,
    text: &str,
) -> Result<SentMessage, GatewayError> {
    match attachment {
        Some(attachment) => {
            let caption = (!text.is_empty()).then_some(text);
            gateway.send_media(target, attachment, caption).await
        }
        None => gateway.send_text(target, text, None).await,
    }
}
