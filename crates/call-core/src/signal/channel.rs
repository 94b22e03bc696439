//! Transport seam for signaling traffic
//!
//! A [`SignalChannel`] is an ordered, at-least-once, per-conversation pub/sub
//! transport (typically the platform's chat channel). The call core sends raw
//! text into it and registers one handler for everything it delivers.
//! Registration returns a [`Subscription`]; dropping it or calling
//! [`Subscription::unsubscribe`] detaches the handler.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::call::ConversationId;
use crate::error::CallResult;

/// Raw text delivered by the channel, tagged with its conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub conversation_id: ConversationId,
    pub text: String,
}

/// Callback invoked for every inbound message
pub type SignalHandler = Arc<dyn Fn(InboundSignal) + Send + Sync>;

/// Ordered pub/sub transport carrying call-control text
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Publish `text` to every member of the conversation
    async fn send(&self, conversation_id: &ConversationId, text: String) -> CallResult<()>;

    /// Register a handler for inbound messages
    fn subscribe(&self, handler: SignalHandler) -> Subscription;
}

/// Disposer returned by a subscription
///
/// The detach closure runs exactly once, either on [`unsubscribe`](Self::unsubscribe)
/// or on drop.
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing to detach
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    /// Detach now
    pub fn unsubscribe(mut self) {
        self.dispose_now();
    }

    pub fn is_active(&self) -> bool {
        self.dispose.is_some()
    }

    fn dispose_now(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
