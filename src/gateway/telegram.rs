// Telegram Bot API gateway over HTTPS
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    Attachment, ButtonAction, CallbackEvent, CommandEvent, GatewayError, InboundEvent, Keyboard,
    MediaKind, MessageEvent, MessagingGateway, Payload, ReplyContext, Sender, SentMessage, Target,
};
use crate::ids::{ChatId, MessageId, ThreadId, UserId};

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ReplyMarkup<'a> {
    inline_keyboard: Vec<Vec<InlineButton<'a>>>,
}

impl<'a> From<&'a Keyboard> for ReplyMarkup<'a> {
    fn from(keyboard: &'a Keyboard) -> Self {
        let inline_keyboard = keyboard
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|button| match &button.action {
                        ButtonAction::Callback(data) => InlineButton {
                            text: &button.label,
                            callback_data: Some(data),
                            url: None,
                        },
                        ButtonAction::Url(url) => InlineButton {
                            text: &button.label,
                            callback_data: None,
                            url: Some(url),
                        },
                    })
                    .collect()
            })
            .collect();
        Self { inline_keyboard }
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyMarkup<'a>>,
}

#[derive(Debug, Serialize)]
struct SendMedia<'a> {
    chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CreateForumTopic<'a> {
    chat_id: i64,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyMarkup<'a>>,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackQuery<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: [&'static str; 2],
}

#[derive(Debug, Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgFile {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: TgChat,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub is_topic_message: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TgFile>>,
    #[serde(default)]
    pub document: Option<TgFile>,
    #[serde(default)]
    pub video: Option<TgFile>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub callback_query: Option<TgCallbackQuery>,
}

impl From<&TgUser> for Sender {
    fn from(user: &TgUser) -> Self {
        let display_name = match &user.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", user.first_name, last),
            _ => user.first_name.clone(),
        };
        Self {
            id: UserId(user.id),
            display_name,
            username: user.username.clone(),
            locale: user.language_code.clone(),
        }
    }
}

impl TgMessage {
    fn attachment(&self) -> Option<Attachment> {
        if let Some(sizes) = &self.photo {
            // Telegram lists sizes ascending; keep the largest
            return sizes
                .last()
                .map(|f| Attachment::new(MediaKind::Photo, f.file_id.clone()));
        }
        if let Some(doc) = &self.document {
            return Some(Attachment::new(MediaKind::Document, doc.file_id.clone()));
        }
        self.video
            .as_ref()
            .map(|v| Attachment::new(MediaKind::Video, v.file_id.clone()))
    }

    fn visible_text(&self) -> Option<String> {
        self.text.clone().or_else(|| self.caption.clone())
    }
}

/// Convert a raw update into a dispatcher event. Updates from bots and
/// unsupported kinds are dropped.
pub fn parse_update(update: Update) -> Option<InboundEvent> {
    if let Some(query) = update.callback_query {
        let chat = query
            .message
            .as_ref()
            .map(|m| ChatId(m.chat.id))
            .unwrap_or(ChatId(query.from.id));
        return Some(InboundEvent::Callback(CallbackEvent {
            sender: Sender::from(&query.from),
            chat,
            message_id: query.message.as_ref().map(|m| MessageId(m.message_id)),
            data: query.data.unwrap_or_default(),
            id: query.id,
        }));
    }

    let message = update.message?;
    let from = message.from.as_ref()?;
    if from.is_bot {
        return None;
    }
    let sender = Sender::from(from);
    let chat = ChatId(message.chat.id);

    if let Some(text) = message.text.as_deref() {
        if let Some(rest) = text.strip_prefix('/') {
            let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            // "/start@festival_bot" addresses this bot explicitly in groups
            let command = head.split('@').next().unwrap_or(head).to_lowercase();
            return Some(InboundEvent::Command(CommandEvent {
                sender,
                chat,
                command,
                args: args.trim().to_string(),
            }));
        }
    }

    let payload = Payload {
        text: message.visible_text(),
        attachment: message.attachment(),
    };
    if payload.is_empty() {
        return None;
    }

    // In forum groups every topic message carries the thread id, but a
    // reply to the topic's root is not a reply to a real message.
    let reply_to = message
        .reply_to_message
        .as_ref()
        .filter(|parent| Some(parent.message_id) != message.message_thread_id)
        .map(|parent| ReplyContext {
            message_id: MessageId(parent.message_id),
            text: parent.visible_text(),
        });

    Some(InboundEvent::Message(MessageEvent {
        sender,
        chat,
        message_id: MessageId(message.message_id),
        thread: message
            .is_topic_message
            .then_some(message.message_thread_id)
            .flatten()
            .map(ThreadId),
        reply_to,
        payload,
    }))
}

pub struct TelegramGateway {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramGateway {
    pub fn new(token: &str, api_base: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(75))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    async fn call<P, R>(&self, method: &str, payload: &P) -> Result<R, GatewayError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, method);
        let response: ApiResponse<R> = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await?
            .json()
            .await?;

        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            (ok, _) => {
                let code = response.error_code.unwrap_or(if ok { 200 } else { 500 });
                let description = response
                    .description
                    .unwrap_or_else(|| format!("{method} returned no result"));
                if code == 403 {
                    Err(GatewayError::Blocked(description))
                } else {
                    Err(GatewayError::Api { code, description })
                }
            }
        }
    }

    /// Long-poll for new updates starting at `offset`
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, GatewayError> {
        self.call(
            "getUpdates",
            &GetUpdates {
                offset,
                timeout: timeout_secs,
                allowed_updates: ["message", "callback_query"],
            },
        )
        .await
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send_text(
        &self,
        target: &Target,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<SentMessage, GatewayError> {
        let sent: TgMessage = self
            .call(
                "sendMessage",
                &SendMessage {
                    chat_id: target.chat.get(),
                    text,
                    message_thread_id: target.thread.map(ThreadId::get),
                    reply_to_message_id: target.reply_to.map(MessageId::get),
                    reply_markup: keyboard.map(ReplyMarkup::from),
                },
            )
            .await?;
        Ok(SentMessage {
            chat: ChatId(sent.chat.id),
            message_id: MessageId(sent.message_id),
        })
    }

    async fn send_media(
        &self,
        target: &Target,
        attachment: &Attachment,
        caption: Option<&str>,
    ) -> Result<SentMessage, GatewayError> {
        let file = Some(attachment.file_ref.as_str());
        let (method, photo, document, video) = match attachment.kind {
            MediaKind::Photo => ("sendPhoto", file, None, None),
            MediaKind::Document => ("sendDocument", None, file, None),
            MediaKind::Video => ("sendVideo", None, None, file),
        };
        let sent: TgMessage = self
            .call(
                method,
                &SendMedia {
                    chat_id: target.chat.get(),
                    photo,
                    document,
                    video,
                    caption,
                    message_thread_id: target.thread.map(ThreadId::get),
                    reply_to_message_id: target.reply_to.map(MessageId::get),
                },
            )
            .await?;
        Ok(SentMessage {
            chat: ChatId(sent.chat.id),
            message_id: MessageId(sent.message_id),
        })
    }

    async fn create_thread(&self, parent: ChatId, title: &str) -> Result<ThreadId, GatewayError> {
        // Topic names are capped at 128 characters
        let name: String = title.chars().take(128).collect();
        let topic: ForumTopic = self
            .call(
                "createForumTopic",
                &CreateForumTopic {
                    chat_id: parent.get(),
                    name: &name,
                },
            )
            .await?;
        Ok(ThreadId(topic.message_thread_id))
    }

    async fn edit_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .call(
                "editMessageText",
                &EditMessageText {
                    chat_id: chat.get(),
                    message_id: message_id.get(),
                    text,
                    reply_markup: keyboard.map(ReplyMarkup::from),
                },
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), GatewayError> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                &AnswerCallbackQuery {
                    callback_query_id: callback_id,
                    text,
                },
            )
            .await?;
        Ok(())
    }

    async fn probe(&self) -> Result<String, GatewayError> {
        let me: TgUser = self.call("getMe", &serde_json::json!({})).await?;
        Ok(me.username.unwrap_or(me.first_name))
    }

    async fn close(&self) {
        tracing::info!("Telegram gateway session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Button, EventPayload};

    fn update(json: serde_json::Value) -> Update {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_command_with_bot_suffix() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "from": {"id": 42, "is_bot": false, "first_name": "Ivan", "last_name": "Petrov"},
                "chat": {"id": 42},
                "text": "/start@festival_bot hello"
            }
        })))
        .unwrap();

        match event {
            InboundEvent::Command(cmd) => {
                assert_eq!(cmd.command, "start");
                assert_eq!(cmd.args, "hello");
                assert_eq!(cmd.sender.display_name, "Ivan Petrov");
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn parses_photo_with_caption_keeping_largest_size() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 2,
            "message": {
                "message_id": 11,
                "from": {"id": 42, "first_name": "Ivan"},
                "chat": {"id": 42},
                "caption": "broken gate",
                "photo": [{"file_id": "small"}, {"file_id": "large"}]
            }
        })))
        .unwrap();

        let EventPayload::Content(payload) = event.payload() else {
            panic!("expected content");
        };
        assert_eq!(payload.text.as_deref(), Some("broken gate"));
        assert_eq!(
            payload.attachment,
            Some(Attachment::new(MediaKind::Photo, "large"))
        );
    }

    #[test]
    fn topic_message_carries_thread_but_not_root_reply() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 3,
            "message": {
                "message_id": 90,
                "from": {"id": 7, "first_name": "Staff"},
                "chat": {"id": -100123},
                "message_thread_id": 55,
                "is_topic_message": true,
                "text": "We are on it",
                "reply_to_message": {
                    "message_id": 55,
                    "chat": {"id": -100123},
                    "text": "topic created"
                }
            }
        })))
        .unwrap();

        let InboundEvent::Message(message) = event else {
            panic!("expected message");
        };
        assert_eq!(message.thread, Some(ThreadId(55)));
        assert!(message.reply_to.is_none());
    }

    #[test]
    fn reply_in_flat_group_keeps_parent_text() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 4,
            "message": {
                "message_id": 91,
                "from": {"id": 7, "first_name": "Staff"},
                "chat": {"id": -100123},
                "text": "Answer",
                "reply_to_message": {
                    "message_id": 80,
                    "chat": {"id": -100123},
                    "text": "🆕 Обращение #12"
                }
            }
        })))
        .unwrap();

        let InboundEvent::Message(message) = event else {
            panic!("expected message");
        };
        assert_eq!(message.thread, None);
        let reply = message.reply_to.unwrap();
        assert_eq!(reply.message_id, MessageId(80));
        assert_eq!(reply.text.as_deref(), Some("🆕 Обращение #12"));
    }

    #[test]
    fn parses_callback_query() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 5,
            "callback_query": {
                "id": "cbq",
                "from": {"id": 42, "first_name": "Ivan"},
                "message": {"message_id": 12, "chat": {"id": 42}},
                "data": "close_ticket_3"
            }
        })))
        .unwrap();
        assert_eq!(event.payload(), EventPayload::Action("close_ticket_3"));
        assert_eq!(event.chat(), ChatId(42));
    }

    #[test]
    fn ignores_bots_and_empty_messages() {
        assert!(parse_update(update(serde_json::json!({
            "update_id": 6,
            "message": {
                "message_id": 1,
                "from": {"id": 1, "is_bot": true, "first_name": "Bot"},
                "chat": {"id": -5},
                "text": "beep"
            }
        })))
        .is_none());
        assert!(parse_update(update(serde_json::json!({"update_id": 7}))).is_none());
    }

    #[test]
    fn keyboard_serializes_to_inline_markup() {
        let keyboard = Keyboard::column([
            Button::callback("Close", "close_ticket_1"),
            Button::url("Map", "https://example.com"),
        ]);
        let json = serde_json::to_value(ReplyMarkup::from(&keyboard)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"inline_keyboard": [
                [{"text": "Close", "callback_data": "close_ticket_1"}],
                [{"text": "Map", "url": "https://example.com"}]
            ]})
        );
    }

    #[test]
    fn api_error_response_decodes() {
        let response: ApiResponse<TgMessage> = serde_json::from_str(
            r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#,
        )
        .unwrap();
        assert!(!response.ok);
        assert_eq!(response.error_code, Some(403));
        assert!(response.result.is_none());
    }
}
