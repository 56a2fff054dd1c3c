#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use festdesk::clock::ManualClock;
use festdesk::config::{ChannelsConfig, Config, StaffConfig};
use festdesk::db;
use festdesk::dispatch::Dispatcher;
use festdesk::gateway::{
    CallbackEvent, CommandEvent, InboundEvent, MessageEvent, Payload, RecordingGateway, Sender,
};
use festdesk::ids::{ChatId, MessageId, ThreadId, UserId};
use festdesk::state::Services;
use tempfile::TempDir;

pub const GROUP: ChatId = ChatId(-100_200);
pub const FEED: ChatId = ChatId(-100_300);
pub const ADMIN: UserId = UserId(10);
pub const AGENT: UserId = UserId(20);

pub struct Desk {
    _tmp: TempDir,
    pub gateway: Arc<RecordingGateway>,
    pub clock: Arc<ManualClock>,
    pub services: Arc<Services>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn desk(topics: bool) -> Desk {
    let tmp = TempDir::new().unwrap();
    let pool = db::create_pool(&tmp.path().join("festdesk.db")).expect("Failed to create test database");
    db::run_migrations(&pool).expect("Failed to run migrations");

    let config = Config {
        staff: StaffConfig {
            admin_ids: vec![ADMIN],
            support_staff_ids: vec![AGENT],
        },
        channels: ChannelsConfig {
            support_group_id: Some(GROUP),
            support_group_topics: topics,
            feedback_channel_id: Some(FEED),
        },
        ..Config::default()
    };
    let gateway = Arc::new(RecordingGateway::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 7, 12, 10, 0, 0).unwrap(),
    ));
    let services = Arc::new(Services::new(
        Arc::new(config),
        pool,
        gateway.clone(),
        None,
        clock.clone(),
    ));

    Desk {
        _tmp: tmp,
        gateway,
        clock,
        dispatcher: Arc::new(Dispatcher::new(services.clone())),
        services,
    }
}

pub fn person(id: UserId, name: &str) -> Sender {
    Sender {
        id,
        display_name: name.to_string(),
        username: None,
        locale: Some("ru".to_string()),
    }
}

pub fn command(who: &Sender, name: &str) -> InboundEvent {
    InboundEvent::Command(CommandEvent {
        sender: who.clone(),
        chat: who.id.into(),
        command: name.to_string(),
        args: String::new(),
    })
}

pub fn press(who: &Sender, data: &str) -> InboundEvent {
    InboundEvent::Callback(CallbackEvent {
        id: format!("cb-{data}"),
        sender: who.clone(),
        chat: who.id.into(),
        message_id: None,
        data: data.to_string(),
    })
}

pub fn write(who: &Sender, text: &str) -> InboundEvent {
    InboundEvent::Message(MessageEvent {
        sender: who.clone(),
        chat: who.id.into(),
        message_id: MessageId(1),
        thread: None,
        reply_to: None,
        payload: Payload::text(text),
    })
}

pub fn staff_in_thread(who: &Sender, thread: ThreadId, text: &str) -> InboundEvent {
    InboundEvent::Message(MessageEvent {
        sender: who.clone(),
        chat: GROUP,
        message_id: MessageId(77),
        thread: Some(thread),
        reply_to: None,
        payload: Payload::text(text),
    })
}

impl Desk {
    pub fn last_to(&self, chat: ChatId) -> String {
        self.gateway.bodies_to(chat).pop().unwrap_or_default()
    }
}
