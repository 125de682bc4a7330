//! Polymorphic subscribers.
//!
//! A subscriber is either a connected session that receives PUBLISH packets
//! on its socket, or an in-process handler that receives the message
//! directly. Identity is the pointed-to allocation, so registering the same
//! consumer twice on a pattern collapses to a single entry.

use crate::broker::message::Message;
use crate::broker::session::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// An in-process consumer of broker messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()>;
}

#[derive(Clone)]
pub enum Subscriber {
    Session(Arc<Session>),
    Handler(Arc<dyn MessageHandler>),
}

impl Subscriber {
    pub fn session(session: Arc<Session>) -> Self {
        Self::Session(session)
    }

    pub fn handler(handler: Arc<dyn MessageHandler>) -> Self {
        Self::Handler(handler)
    }

    /// Stable identity for set membership: the address of the consumer.
    pub fn id(&self) -> usize {
        match self {
            Self::Session(s) => Arc::as_ptr(s) as usize,
            Self::Handler(h) => Arc::as_ptr(h) as *const () as usize,
        }
    }

    /// Deliver one message. Errors are the caller's to log; they never abort
    /// delivery to other subscribers.
    pub async fn deliver(&self, topic: &str, message: &Message) -> Result<()> {
        match self {
            Self::Session(session) => {
                session.publish(topic, message).await?;
                Ok(())
            }
            Self::Handler(handler) => handler.handle_message(topic, message.clone()).await,
        }
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Subscriber {}
