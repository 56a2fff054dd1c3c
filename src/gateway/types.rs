use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{ChatId, MessageId, ThreadId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Document,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Document => "document",
            Self::Video => "video",
        }
    }
}

/// A file already uploaded to the gateway, referenced by its opaque id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: MediaKind,
    pub file_ref: String,
}

impl Attachment {
    pub fn new(kind: MediaKind, file_ref: impl Into<String>) -> Self {
        Self {
            kind,
            file_ref: file_ref.into(),
        }
    }
}

/// Message kind as persisted with every ticket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Document,
    Video,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Document => "document",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "photo" => Ok(Self::Photo),
            "document" => Ok(Self::Document),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

impl From<MediaKind> for MessageKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => Self::Photo,
            MediaKind::Document => Self::Document,
            MediaKind::Video => Self::Video,
        }
    }
}

/// Text and/or one attachment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachment: None,
        }
    }

    pub fn media(attachment: Attachment, caption: Option<String>) -> Self {
        Self {
            text: caption,
            attachment: Some(attachment),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.attachment
            .as_ref()
            .map(|a| MessageKind::from(a.kind))
            .unwrap_or(MessageKind::Text)
    }

    pub fn is_empty(&self) -> bool {
        self.attachment.is_none() && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Where an outbound message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub chat: ChatId,
    pub thread: Option<ThreadId>,
    pub reply_to: Option<MessageId>,
}

impl Target {
    pub fn chat(chat: ChatId) -> Self {
        Self {
            chat,
            thread: None,
            reply_to: None,
        }
    }

    pub fn user(user: UserId) -> Self {
        Self::chat(user.into())
    }

    pub fn in_thread(chat: ChatId, thread: Option<ThreadId>) -> Self {
        Self {
            chat,
            thread,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonAction {
    Callback(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

impl Button {
    pub fn callback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Callback(data.into()),
        }
    }

    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Url(url.into()),
        }
    }
}

/// Inline keyboard, one button per row unless built otherwise
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn column(buttons: impl IntoIterator<Item = Button>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }

    pub fn callbacks(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().flatten().filter_map(|b| match &b.action {
            ButtonAction::Callback(data) => Some(data.as_str()),
            ButtonAction::Url(_) => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub chat: ChatId,
    pub message_id: MessageId,
}

/// Identity of whoever produced an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    pub display_name: String,
    pub username: Option<String>,
    pub locale: Option<String>,
}

/// The message a staff member replied to, when the gateway reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub message_id: MessageId,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub sender: Sender,
    pub chat: ChatId,
    pub command: String,
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub id: String,
    pub sender: Sender,
    pub chat: ChatId,
    pub message_id: Option<MessageId>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub sender: Sender,
    pub chat: ChatId,
    pub message_id: MessageId,
    pub thread: Option<ThreadId>,
    pub reply_to: Option<ReplyContext>,
    pub payload: Payload,
}

/// Everything the gateway can deliver to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Command(CommandEvent),
    Callback(CallbackEvent),
    Message(MessageEvent),
}

/// Borrowed view of what an event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload<'a> {
    Command { name: &'a str, args: &'a str },
    Action(&'a str),
    Content(&'a Payload),
}

impl InboundEvent {
    pub fn sender(&self) -> &Sender {
        match self {
            Self::Command(e) => &e.sender,
            Self::Callback(e) => &e.sender,
            Self::Message(e) => &e.sender,
        }
    }

    pub fn chat(&self) -> ChatId {
        match self {
            Self::Command(e) => e.chat,
            Self::Callback(e) => e.chat,
            Self::Message(e) => e.chat,
        }
    }

    /// Where an answer to this event should go
    pub fn reply_target(&self) -> Target {
        match self {
            Self::Message(e) => Target::in_thread(e.chat, e.thread),
            other => Target::chat(other.chat()),
        }
    }

    pub fn payload(&self) -> EventPayload<'_> {
        match self {
            Self::Command(e) => EventPayload::Command {
                name: &e.command,
                args: &e.args,
            },
            Self::Callback(e) => EventPayload::Action(&e.data),
            Self::Message(e) => EventPayload::Content(&e.payload),
        }
    }

    pub fn is_private(&self) -> bool {
        self.chat().get() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Sender {
        Sender {
            id: UserId(10),
            display_name: "Ann".into(),
            username: None,
            locale: Some("ru".into()),
        }
    }

    #[test]
    fn payload_kind_follows_attachment() {
        assert_eq!(Payload::text("hi").kind(), MessageKind::Text);
        let photo = Payload::media(Attachment::new(MediaKind::Photo, "AgAD"), None);
        assert_eq!(photo.kind(), MessageKind::Photo);
        assert!(!photo.is_empty());
        assert!(Payload::text("   ").is_empty());
    }

    #[test]
    fn message_kind_parses_its_own_names() {
        for kind in [
            MessageKind::Text,
            MessageKind::Photo,
            MessageKind::Document,
            MessageKind::Video,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("sticker".parse::<MessageKind>().is_err());
    }

    #[test]
    fn reply_target_keeps_thread_for_messages() {
        let event = InboundEvent::Message(MessageEvent {
            sender: sender(),
            chat: ChatId(-100),
            message_id: MessageId(5),
            thread: Some(ThreadId(77)),
            reply_to: None,
            payload: Payload::text("hello"),
        });
        assert_eq!(
            event.reply_target(),
            Target::in_thread(ChatId(-100), Some(ThreadId(77)))
        );
        assert!(!event.is_private());
        assert!(matches!(event.payload(), EventPayload::Content(p) if p.text_or_empty() == "hello"));
    }

    #[test]
    fn callback_exposes_action_data() {
        let event = InboundEvent::Callback(CallbackEvent {
            id: "cb".into(),
            sender: sender(),
            chat: ChatId(10),
            message_id: Some(MessageId(3)),
            data: "support".into(),
        });
        assert_eq!(event.sender().id, UserId(10));
        assert_eq!(event.payload(), EventPayload::Action("support"));
        assert!(event.is_private());
    }
}
