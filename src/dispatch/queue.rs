// Per-chat serialisation of inbound events
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tokio_util::task::TaskTracker;

use super::Dispatcher;
use crate::gateway::InboundEvent;
use crate::ids::ChatId;

type Flows = Arc<Mutex<HashMap<ChatId, UnboundedSender<InboundEvent>>>>;

fn lock(flows: &Flows) -> MutexGuard<'_, HashMap<ChatId, UnboundedSender<InboundEvent>>> {
    flows.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hands events to the dispatcher so that each chat sees them one at a
/// time and in arrival order, while different chats run concurrently.
///
/// A chat gets a worker on its first event; the worker exits once its
/// queue is empty. Enqueueing and the worker's final emptiness check
/// both happen under the same lock, so no event is stranded.
pub struct EventQueue {
    dispatcher: Arc<Dispatcher>,
    flows: Flows,
    tracker: TaskTracker,
}

impl EventQueue {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            flows: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn push(&self, event: InboundEvent) {
        let chat = event.chat();
        let mut flows = lock(&self.flows);

        let event = match flows.get(&chat) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                // Worker died mid-flow; start a fresh one
                Err(SendError(event)) => event,
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            return;
        }
        flows.insert(chat, tx);
        drop(flows);

        self.tracker.spawn(run_flow(
            chat,
            rx,
            self.dispatcher.clone(),
            self.flows.clone(),
        ));
    }

    /// Chats with queued or running events
    pub fn active_flows(&self) -> usize {
        lock(&self.flows).len()
    }

    /// Stop accepting workers and wait until every queued event is handled
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_flow(
    chat: ChatId,
    mut rx: UnboundedReceiver<InboundEvent>,
    dispatcher: Arc<Dispatcher>,
    flows: Flows,
) {
    loop {
        let next = {
            let mut flows = lock(&flows);
            match rx.try_recv() {
                Ok(event) => Some(event),
                Err(_) => {
                    flows.remove(&chat);
                    None
                }
            }
        };
        match next {
            Some(event) => dispatcher.handle(event).await,
            None => break,
        }
    }
    tracing::trace!(chat = %chat, "Event flow idle");
}
