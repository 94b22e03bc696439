//! Notification bridge: call events for UI consumers
//!
//! Every transition the [`CallSessionStore`](crate::store::CallSessionStore)
//! performs is republished here as a [`CallEvent`]. Consumers pick whichever
//! shape suits them:
//!
//! - **Handler subscriptions** - implement [`CallEventHandler`], register it
//!   with an [`EventFilter`], keep the returned [`Subscription`] alive.
//!   Delivery is sequential and in publish order.
//! - **Broadcast stream** - [`NotificationBridge::events`].
//! - **Current state** - [`NotificationBridge::snapshot`] is a `watch`
//!   receiver holding the live invite and session.
//!
//! ```rust
//! use studylink_call_core::events::{EventFilter, EventPriority};
//!
//! let filter = EventFilter {
//!     min_priority: Some(EventPriority::High),
//!     ..Default::default()
//! };
//! assert!(filter.call_ids.is_none());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::call::{CallId, CallInvite, CallSession, CallState, UserId};
use crate::error::CallError;
use crate::signal::{SignalKind, Subscription};

/// Event priority levels for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Information about a session state change
#[derive(Debug, Clone)]
pub struct CallStatusInfo {
    pub call_id: CallId,
    pub previous_state: CallState,
    pub new_state: CallState,
    /// Why the transition happened (e.g. "remote accepted", "ring timeout")
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// How an inbound invite left the pending state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InviteResolution {
    Accepted,
    Rejected,
    /// Ring timer fired before anyone answered
    Expired,
    /// The caller hung up before an answer
    Withdrawn,
    /// The UI closed the prompt without answering; nothing was sent
    Dismissed,
}

/// Events published by the call core
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A new inbound call is ringing
    IncomingInvite { invite: CallInvite, priority: EventPriority },
    /// The pending invite was answered, expired or dropped
    InviteResolved {
        call_id: CallId,
        resolution: InviteResolution,
        priority: EventPriority,
    },
    /// A session moved along the state machine
    CallStateChanged { info: CallStatusInfo, priority: EventPriority },
    /// An outbound signal could not be delivered; dismissible, the call goes on
    SignalDeliveryFailed {
        call_id: Option<CallId>,
        kind: SignalKind,
        error: CallError,
        priority: EventPriority,
    },
    /// The media join failed and the call ended `Failed`; the user may call again
    MediaJoinFailed {
        call_id: CallId,
        error: CallError,
        priority: EventPriority,
    },
    /// A request arrived while busy and was turned away
    BusyRejected {
        call_id: CallId,
        caller_id: UserId,
        priority: EventPriority,
    },
}

impl CallEvent {
    pub fn incoming_invite(invite: CallInvite) -> Self {
        CallEvent::IncomingInvite {
            invite,
            priority: EventPriority::High,
        }
    }

    pub fn invite_resolved(call_id: CallId, resolution: InviteResolution) -> Self {
        CallEvent::InviteResolved {
            call_id,
            resolution,
            priority: EventPriority::Normal,
        }
    }

    pub fn state_changed(info: CallStatusInfo) -> Self {
        let priority = match info.new_state {
            CallState::Failed => EventPriority::High,
            CallState::Connected | CallState::Ended | CallState::Rejected | CallState::Expired => {
                EventPriority::Normal
            }
            _ => EventPriority::Low,
        };
        CallEvent::CallStateChanged { info, priority }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            CallEvent::IncomingInvite { priority, .. }
            | CallEvent::InviteResolved { priority, .. }
            | CallEvent::CallStateChanged { priority, .. }
            | CallEvent::SignalDeliveryFailed { priority, .. }
            | CallEvent::MediaJoinFailed { priority, .. }
            | CallEvent::BusyRejected { priority, .. } => *priority,
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            CallEvent::IncomingInvite { invite, .. } => Some(&invite.call_id),
            CallEvent::InviteResolved { call_id, .. }
            | CallEvent::MediaJoinFailed { call_id, .. }
            | CallEvent::BusyRejected { call_id, .. } => Some(call_id),
            CallEvent::CallStateChanged { info, .. } => Some(&info.call_id),
            CallEvent::SignalDeliveryFailed { call_id, .. } => call_id.as_ref(),
        }
    }

    /// Check if this event passes the given filter
    pub fn passes_filter(&self, filter: &EventFilter) -> bool {
        if let Some(min_priority) = filter.min_priority {
            if self.priority() < min_priority {
                return false;
            }
        }

        if let Some(call_ids) = &filter.call_ids {
            match self.call_id() {
                Some(call_id) if call_ids.contains(call_id) => {}
                _ => return false,
            }
        }

        if let Some(call_states) = &filter.call_states {
            if let CallEvent::CallStateChanged { info, .. } = self {
                if !call_states.contains(&info.new_state) {
                    return false;
                }
            }
        }

        true
    }
}

/// Event filtering options for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for these calls (None = all calls)
    pub call_ids: Option<HashSet<CallId>>,
    /// Only state changes into these states (None = all states)
    pub call_states: Option<HashSet<CallState>>,
    /// Minimum event priority (None = all priorities)
    pub min_priority: Option<EventPriority>,
}

/// Receives call events
///
/// Every method has a no-op default; override the ones the surface cares
/// about. [`on_call_event`](Self::on_call_event) routes to the specific
/// methods unless overridden itself.
#[async_trait]
pub trait CallEventHandler: Send + Sync {
    async fn on_incoming_invite(&self, _invite: CallInvite) {}

    async fn on_invite_resolved(&self, _call_id: CallId, _resolution: InviteResolution) {}

    async fn on_call_state_changed(&self, _info: CallStatusInfo) {}

    /// Non-fatal notices: delivery failures, media failures, busy rejections
    async fn on_notice(&self, _event: CallEvent) {}

    async fn on_call_event(&self, event: CallEvent) {
        match event {
            CallEvent::IncomingInvite { invite, .. } => self.on_incoming_invite(invite).await,
            CallEvent::InviteResolved {
                call_id, resolution, ..
            } => self.on_invite_resolved(call_id, resolution).await,
            CallEvent::CallStateChanged { info, .. } => self.on_call_state_changed(info).await,
            other => self.on_notice(other).await,
        }
    }
}

/// A registered handler with its filter
#[derive(Clone)]
pub struct EventSubscription {
    handler: Arc<dyn CallEventHandler>,
    filter: EventFilter,
    id: uuid::Uuid,
}

impl EventSubscription {
    pub fn new(handler: Arc<dyn CallEventHandler>, filter: EventFilter) -> Self {
        Self {
            handler,
            filter,
            id: uuid::Uuid::new_v4(),
        }
    }

    pub fn all_events(handler: Arc<dyn CallEventHandler>) -> Self {
        Self::new(handler, EventFilter::default())
    }

    /// Only events about one call
    pub fn call_events(handler: Arc<dyn CallEventHandler>, call_id: CallId) -> Self {
        let mut call_ids = HashSet::new();
        call_ids.insert(call_id);
        Self::new(
            handler,
            EventFilter {
                call_ids: Some(call_ids),
                ..Default::default()
            },
        )
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn should_receive(&self, event: &CallEvent) -> bool {
        event.passes_filter(&self.filter)
    }

    pub async fn deliver_event(&self, event: CallEvent) {
        if self.should_receive(&event) {
            self.handler.on_call_event(event).await;
        }
    }
}

/// The live invite and session, as last published
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub invite: Option<CallInvite>,
    pub session: Option<CallSession>,
}

/// Republishes store transitions to consumers
pub struct NotificationBridge {
    subscriptions: Arc<RwLock<Vec<EventSubscription>>>,
    event_tx: broadcast::Sender<CallEvent>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    dispatch_tx: mpsc::UnboundedSender<CallEvent>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
}

impl NotificationBridge {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            event_tx,
            snapshot_tx,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
        }
    }

    /// Publish an event. Never blocks; safe to call under the store lock.
    pub fn publish(&self, event: CallEvent) {
        trace!(?event, "Publishing call event");
        let _ = self.event_tx.send(event.clone());
        let _ = self.dispatch_tx.send(event);
    }

    /// Replace the current-state snapshot
    pub fn update_snapshot(&self, snapshot: CallSnapshot) {
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Register a handler subscription; drop the returned disposer to detach
    pub fn subscribe(&self, subscription: EventSubscription) -> Subscription {
        let id = subscription.id();
        self.subscriptions.write().push(subscription);

        let subscriptions = Arc::downgrade(&self.subscriptions);
        Subscription::new(move || {
            if let Some(subscriptions) = subscriptions.upgrade() {
                subscriptions.write().retain(|s| s.id() != id);
            }
        })
    }

    /// Stream of every published event
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Receiver for the current invite/session snapshot
    pub fn snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Start delivering events to handler subscriptions
    ///
    /// Returns `None` if the dispatcher is already running.
    pub fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.dispatch_rx.lock().take()?;
        let subscriptions = self.subscriptions.clone();

        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let targets: Vec<EventSubscription> = subscriptions
                    .read()
                    .iter()
                    .filter(|s| s.should_receive(&event))
                    .cloned()
                    .collect();

                for target in targets {
                    target.handler.on_call_event(event.clone()).await;
                }
            }
            debug!("Event dispatcher stopped");
        }))
    }
}
