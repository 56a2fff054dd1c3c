// In-memory gateway: records every outbound call instead of talking to a network
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::{Attachment, GatewayError, Keyboard, MessagingGateway, SentMessage, Target};
use crate::ids::{ChatId, MessageId, ThreadId};

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text {
        target: Target,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Media {
        target: Target,
        attachment: Attachment,
        caption: Option<String>,
    },
    Thread {
        parent: ChatId,
        title: String,
        thread: ThreadId,
    },
    Edit {
        chat: ChatId,
        message_id: MessageId,
        text: String,
    },
    CallbackAnswer {
        id: String,
        text: Option<String>,
    },
}

impl Outbound {
    pub fn chat(&self) -> Option<ChatId> {
        match self {
            Self::Text { target, .. } | Self::Media { target, .. } => Some(target.chat),
            Self::Thread { parent, .. } => Some(*parent),
            Self::Edit { chat, .. } => Some(*chat),
            Self::CallbackAnswer { .. } => None,
        }
    }

    /// Visible text of a delivered message, caption included
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } | Self::Edit { text, .. } => Some(text),
            Self::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct RecordingGateway {
    log: Mutex<Vec<Outbound>>,
    failing: Mutex<HashSet<ChatId>>,
    probe_fails: Mutex<bool>,
    next_message: AtomicI64,
    next_thread: AtomicI64,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            probe_fails: Mutex::new(false),
            next_message: AtomicI64::new(1000),
            next_thread: AtomicI64::new(500),
        }
    }

    /// Make every delivery to `chat` fail as if the bot were blocked
    pub fn fail_deliveries_to(&self, chat: ChatId) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(chat);
    }

    pub fn restore_deliveries_to(&self, chat: ChatId) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).remove(&chat);
    }

    pub fn fail_probe(&self, fail: bool) {
        *self.probe_fails.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Bodies of every text/media delivered to `chat`, in order
    pub fn bodies_to(&self, chat: ChatId) -> Vec<String> {
        self.sent()
            .iter()
            .filter(|o| matches!(o, Outbound::Text { .. } | Outbound::Media { .. }))
            .filter(|o| o.chat() == Some(chat))
            .filter_map(|o| o.body().map(str::to_string))
            .collect()
    }

    pub fn threads(&self) -> Vec<(ChatId, String, ThreadId)> {
        self.sent()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Thread {
                    parent,
                    title,
                    thread,
                } => Some((parent, title, thread)),
                _ => None,
            })
            .collect()
    }

    fn check_delivery(&self, chat: ChatId) -> Result<(), GatewayError> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&chat)
        {
            return Err(GatewayError::Blocked(format!("chat {chat} unreachable")));
        }
        Ok(())
    }

    fn record(&self, entry: Outbound) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }

    fn next_message_id(&self) -> MessageId {
        MessageId(self.next_message.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send_text(
        &self,
        target: &Target,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<SentMessage, GatewayError> {
        self.check_delivery(target.chat)?;
        self.record(Outbound::Text {
            target: *target,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(SentMessage {
            chat: target.chat,
            message_id: self.next_message_id(),
        })
    }

    async fn send_media(
        &self,
        target: &Target,
        attachment: &Attachment,
        caption: Option<&str>,
    ) -> Result<SentMessage, GatewayError> {
        self.check_delivery(target.chat)?;
        self.record(Outbound::Media {
            target: *target,
            attachment: attachment.clone(),
            caption: caption.map(str::to_string),
        });
        Ok(SentMessage {
            chat: target.chat,
            message_id: self.next_message_id(),
        })
    }

    async fn create_thread(&self, parent: ChatId, title: &str) -> Result<ThreadId, GatewayError> {
        self.check_delivery(parent)?;
        let thread = ThreadId(self.next_thread.fetch_add(1, Ordering::SeqCst));
        self.record(Outbound::Thread {
            parent,
            title: title.to_string(),
            thread,
        });
        Ok(thread)
    }

    async fn edit_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<(), GatewayError> {
        self.check_delivery(chat)?;
        self.record(Outbound::Edit {
            chat,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.record(Outbound::CallbackAnswer {
            id: callback_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn probe(&self) -> Result<String, GatewayError> {
        if *self.probe_fails.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(GatewayError::Api {
                code: 502,
                description: "probe failed".into(),
            });
        }
        Ok("recording_bot".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MediaKind;

    #[tokio::test]
    async fn records_deliveries_in_order() {
        let gateway = RecordingGateway::new();
        let target = Target::chat(ChatId(5));

        gateway.send_text(&target, "one", None).await.unwrap();
        gateway
            .send_media(
                &target,
                &Attachment::new(MediaKind::Photo, "file-1"),
                Some("two"),
            )
            .await
            .unwrap();

        assert_eq!(gateway.bodies_to(ChatId(5)), vec!["one", "two"]);
        assert!(gateway.bodies_to(ChatId(6)).is_empty());
    }

    #[tokio::test]
    async fn failing_chat_returns_blocked() {
        let gateway = RecordingGateway::new();
        gateway.fail_deliveries_to(ChatId(9));

        let err = gateway
            .send_text(&Target::chat(ChatId(9)), "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Blocked(_)));
        assert!(gateway.sent().is_empty());

        gateway.restore_deliveries_to(ChatId(9));
        assert!(gateway
            .send_text(&Target::chat(ChatId(9)), "x", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn threads_get_distinct_ids() {
        let gateway = RecordingGateway::new();
        let a = gateway.create_thread(ChatId(-1), "a").await.unwrap();
        let b = gateway.create_thread(ChatId(-1), "b").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(gateway.threads().len(), 2);
    }
}
