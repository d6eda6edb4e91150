//! Bus to registry bridge.
//!
//! # Responsibilities
//! - Apply `router.register` / `router.unregister` messages to the registry
//! - Answer `router.greet` with the router's identity
//! - Announce the router on `router.start`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::mbus::{subjects, BusError, Message, MessageBus};
use crate::registry::{Registry, RegistryMessage};

/// Payload of greet replies and the start announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGreeting {
    pub id: String,
    pub hosts: Vec<String>,
    #[serde(rename = "minimumRegisterIntervalInSeconds")]
    pub minimum_register_interval_secs: u64,
}

impl RouterGreeting {
    /// Greeting for a router reachable at `ip`, with a fresh random id.
    pub fn new(ip: &str, minimum_register_interval_secs: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hosts: vec![ip.to_string()],
            minimum_register_interval_secs,
        }
    }
}

/// Feeds bus traffic into a [`Registry`].
#[derive(Clone)]
pub struct RouteSubscriber {
    registry: Arc<Registry>,
    bus: Arc<dyn MessageBus>,
    greeting: RouterGreeting,
}

impl RouteSubscriber {
    /// Bridge `bus` into `registry`. Nothing is subscribed until `spawn`.
    pub fn new(registry: Arc<Registry>, bus: Arc<dyn MessageBus>, greeting: RouterGreeting) -> Self {
        Self {
            registry,
            bus,
            greeting,
        }
    }

    /// Payload sent on `router.start` and in greet replies.
    pub fn greeting(&self) -> &RouterGreeting {
        &self.greeting
    }

    /// Publish the greeting on `router.start` so backends register promptly.
    pub fn announce(&self) -> Result<(), BusError> {
        let payload = self.greeting_payload();
        self.bus.publish(subjects::START, &payload)
    }

    /// Subscribe to the router subjects and process messages until shutdown.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>, BusError> {
        let mut register = self.bus.subscribe(subjects::REGISTER)?;
        let mut unregister = self.bus.subscribe(subjects::UNREGISTER)?;
        let mut greet = self.bus.subscribe(subjects::GREET)?;

        tracing::info!(router_id = %self.greeting.id, "Route subscriber started");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = register.recv() => self.handle_register(&message),
                    Some(message) = unregister.recv() => self.handle_unregister(&message),
                    Some(message) = greet.recv() => self.handle_greet(&message),
                    _ = shutdown.recv() => {
                        tracing::info!("Route subscriber received shutdown signal, exiting loop");
                        break;
                    }
                    else => break,
                }
            }
        }))
    }

    fn handle_register(&self, message: &Message) {
        if let Some(decoded) = decode(message) {
            self.registry.register(&decoded);
        }
    }

    fn handle_unregister(&self, message: &Message) {
        if let Some(decoded) = decode(message) {
            self.registry.unregister(&decoded);
        }
    }

    fn handle_greet(&self, message: &Message) {
        let Some(reply_to) = &message.reply_to else {
            tracing::debug!("Greet without reply subject");
            return;
        };

        let reply = Message::new(reply_to.clone(), self.greeting_payload());
        if let Err(e) = self.bus.publish_message(reply) {
            tracing::warn!(error = %e, reply_to = %reply_to, "Failed to answer greet");
        }
    }

    fn greeting_payload(&self) -> Vec<u8> {
        serde_json::to_vec(&self.greeting).unwrap_or_default()
    }
}

fn decode(message: &Message) -> Option<RegistryMessage> {
    match RegistryMessage::from_json(&message.payload) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!(
                subject = %message.subject,
                error = %e,
                payload = %String::from_utf8_lossy(&message.payload),
                "Dropping malformed registry message"
            );
            None
        }
    }
}
