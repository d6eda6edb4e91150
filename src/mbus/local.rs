//! In-process message bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::mbus::{BusError, Message, MessageBus, Subscription};

/// Fan-out bus that delivers every published message to all live
/// subscriptions on the exact subject.
#[derive(Debug)]
pub struct LocalBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    connected: AtomicBool,
}

impl LocalBus {
    /// Connected bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the bus connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for LocalBus {
    fn publish_message(&self, message: Message) -> Result<(), BusError> {
        if !self.ping() {
            return Err(BusError::Disconnected);
        }
        if message.subject.is_empty() {
            return Err(BusError::InvalidSubject(message.subject));
        }

        let mut subscribers = self.subscribers.lock().expect("bus mutex poisoned");
        if let Some(senders) = subscribers.get_mut(&message.subject) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(&message.subject);
            }
        }
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        if subject.is_empty() {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("bus mutex poisoned")
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn ping(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
