//! Message bus contract.
//!
//! # Data Flow
//! ```text
//! Backends / other components
//!     → publish(router.register | router.unregister | router.greet)
//!     → MessageBus
//!     → subscriptions (registry::subscriber)
//! ```
//!
//! The router only needs publish, subscribe and a liveness ping. A NATS client
//! adapter implements [`MessageBus`] outside this crate; [`LocalBus`] is the
//! in-process implementation used by the default binary and the tests.

pub mod local;

use tokio::sync::mpsc;

pub use local::LocalBus;

/// Subjects the router listens on or publishes to.
pub mod subjects {
    /// A backend announces its address and uris.
    pub const REGISTER: &str = "router.register";
    /// A backend withdraws some or all of its uris.
    pub const UNREGISTER: &str = "router.unregister";
    /// Request for the router's greeting, answered on the reply subject.
    pub const GREET: &str = "router.greet";
    /// Published once at startup so backends register right away.
    pub const START: &str = "router.start";
}

/// A message delivered on a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Subject a responder should publish its answer to.
    pub reply_to: Option<String>,
}

impl Message {
    /// Message without a reply subject.
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply_to: None,
        }
    }

    /// Ask responders to answer on `reply_to`.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Stream of messages for one subscription. Dropping it unsubscribes.
pub type Subscription = mpsc::UnboundedReceiver<Message>;

/// Errors reported by a `MessageBus`.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus is disconnected")]
    Disconnected,
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
}

/// Publish/subscribe transport consumed by the router.
pub trait MessageBus: Send + Sync {
    fn publish_message(&self, message: Message) -> Result<(), BusError>;

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// True while the bus connection is believed healthy.
    fn ping(&self) -> bool;

    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        self.publish_message(Message::new(subject, payload))
    }
}
