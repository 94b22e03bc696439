//! In-memory signal transport
//!
//! [`SignalHub`] plays the role of the platform's chat backend: it knows which
//! users belong to which conversation and fans every message out to all
//! members, the sender included (clients see their own messages echoed, as
//! they do on the real channel). Each user talks to the hub through a
//! [`HubChannel`].
//!
//! The hub can simulate at-least-once delivery (`set_redelivery`) and an
//! unreachable backend for one user (`set_offline`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::channel::{InboundSignal, SignalChannel, SignalHandler, Subscription};
use crate::call::{ConversationId, UserId};
use crate::error::{CallError, CallResult};

#[derive(Default)]
struct HubState {
    conversations: HashMap<ConversationId, HashSet<UserId>>,
    subscribers: HashMap<UserId, Vec<(u64, SignalHandler)>>,
    offline: HashSet<UserId>,
    log: Vec<(UserId, ConversationId, String)>,
}

/// Shared in-memory conversation backend
#[derive(Default)]
pub struct SignalHub {
    state: Mutex<HubState>,
    next_subscriber: AtomicU64,
    redelivery: AtomicUsize,
}

impl SignalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or extend) a conversation with the given members
    pub fn add_conversation(&self, conversation_id: impl Into<ConversationId>, members: &[UserId]) {
        let mut state = self.state.lock();
        state
            .conversations
            .entry(conversation_id.into())
            .or_default()
            .extend(members.iter().cloned());
    }

    /// Channel handle for one user
    pub fn connect(self: &Arc<Self>, user_id: impl Into<UserId>) -> Arc<HubChannel> {
        Arc::new(HubChannel {
            hub: Arc::downgrade(self),
            user_id: user_id.into(),
        })
    }

    /// Deliver every message this many extra times
    pub fn set_redelivery(&self, extra_copies: usize) {
        self.redelivery.store(extra_copies, Ordering::SeqCst);
    }

    /// Make sends from `user_id` fail as if the backend were unreachable
    pub fn set_offline(&self, user_id: &UserId, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(user_id.clone());
        } else {
            state.offline.remove(user_id);
        }
    }

    /// Every message accepted by the hub, in send order
    pub fn sent_messages(&self) -> Vec<(UserId, ConversationId, String)> {
        self.state.lock().log.clone()
    }

    /// Messages sent by one user whose text starts with `prefix`
    pub fn count_sent(&self, user_id: &UserId, prefix: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(sender, _, text)| sender == user_id && text.starts_with(prefix))
            .count()
    }

    fn publish(&self, sender: &UserId, conversation_id: &ConversationId, text: String) -> CallResult<()> {
        let handlers: Vec<SignalHandler> = {
            let mut state = self.state.lock();
            if state.offline.contains(sender) {
                return Err(CallError::signal_delivery(conversation_id.clone(), "backend unreachable"));
            }

            let Some(members) = state.conversations.get(conversation_id) else {
                return Err(CallError::signal_delivery(conversation_id.clone(), "unknown conversation"));
            };
            if !members.contains(sender) {
                return Err(CallError::signal_delivery(
                    conversation_id.clone(),
                    format!("{} is not a member", sender),
                ));
            }

            let handlers = members
                .iter()
                .filter_map(|member| state.subscribers.get(member))
                .flat_map(|subs| subs.iter().map(|(_, handler)| handler.clone()))
                .collect();

            state.log.push((sender.clone(), conversation_id.clone(), text.clone()));
            handlers
        };

        let copies = 1 + self.redelivery.load(Ordering::SeqCst);
        debug!(%conversation_id, %sender, receivers = handlers.len(), copies, "Hub fan-out");
        for _ in 0..copies {
            for handler in &handlers {
                handler(InboundSignal {
                    conversation_id: conversation_id.clone(),
                    text: text.clone(),
                });
            }
        }
        Ok(())
    }

    fn add_subscriber(&self, user_id: &UserId, handler: SignalHandler) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .subscribers
            .entry(user_id.clone())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove_subscriber(&self, user_id: &UserId, id: u64) {
        let mut state = self.state.lock();
        if let Some(subs) = state.subscribers.get_mut(user_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// One user's connection to a [`SignalHub`]
pub struct HubChannel {
    hub: Weak<SignalHub>,
    user_id: UserId,
}

impl HubChannel {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

#[async_trait]
impl SignalChannel for HubChannel {
    async fn send(&self, conversation_id: &ConversationId, text: String) -> CallResult<()> {
        let hub = self.hub.upgrade().ok_or(CallError::ChannelClosed)?;
        hub.publish(&self.user_id, conversation_id, text)
    }

    fn subscribe(&self, handler: SignalHandler) -> Subscription {
        let Some(hub) = self.hub.upgrade() else {
            warn!(user_id = %self.user_id, "Subscribe on a closed hub");
            return Subscription::noop();
        };

        let id = hub.add_subscriber(&self.user_id, handler);
        let weak = Arc::downgrade(&hub);
        let user_id = self.user_id.clone();
        Subscription::new(move || {
            if let Some(hub) = weak.upgrade() {
                hub.remove_subscriber(&user_id, id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (SignalHandler, Arc<Mutex<Vec<InboundSignal>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: SignalHandler = Arc::new(move |signal| sink.lock().push(signal));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender_echo() {
        let hub = SignalHub::new();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        hub.add_conversation("k", &[alice.clone(), bob.clone()]);

        let a = hub.connect(alice.clone());
        let b = hub.connect(bob.clone());
        let (ha, seen_a) = collector();
        let (hb, seen_b) = collector();
        let _sa = a.subscribe(ha);
        let _sb = b.subscribe(hb);

        a.send(&ConversationId::from("k"), "hi".to_string()).await.unwrap();
        assert_eq!(seen_a.lock().len(), 1);
        assert_eq!(seen_b.lock()[0].text, "hi");
        assert_eq!(hub.count_sent(&alice, "hi"), 1);
    }

    #[tokio::test]
    async fn test_membership_and_offline_errors() {
        let hub = SignalHub::new();
        let alice = UserId::from("alice");
        hub.add_conversation("k", &[UserId::from("bob")]);
        let a = hub.connect(alice.clone());

        let err = a.send(&ConversationId::from("k"), "x".into()).await.unwrap_err();
        assert!(err.is_recoverable());
        let err = a.send(&ConversationId::from("nope"), "x".into()).await.unwrap_err();
        assert_eq!(err.category(), "signaling");

        hub.add_conversation("k", &[alice.clone()]);
        hub.set_offline(&alice, true);
        assert!(a.send(&ConversationId::from("k"), "x".into()).await.is_err());
        hub.set_offline(&alice, false);
        assert!(a.send(&ConversationId::from("k"), "x".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_redelivery() {
        let hub = SignalHub::new();
        let bob = UserId::from("bob");
        hub.add_conversation("k", &[bob.clone()]);
        let b = hub.connect(bob.clone());
        let (handler, seen) = collector();
        let sub = b.subscribe(handler);

        hub.set_redelivery(2);
        b.send(&ConversationId::from("k"), "dup".into()).await.unwrap();
        assert_eq!(seen.lock().len(), 3);

        sub.unsubscribe();
        b.send(&ConversationId::from("k"), "after".into()).await.unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_dropped_hub_closes_channel() {
        let hub = SignalHub::new();
        let a = hub.connect("alice");
        drop(hub);
        let err = a.send(&ConversationId::from("k"), "x".into()).await.unwrap_err();
        assert!(matches!(err, CallError::ChannelClosed));
    }
}
