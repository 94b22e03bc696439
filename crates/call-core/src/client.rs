//! Call client: builder and composition root
//!
//! [`CallClientBuilder`] wires one user's [`CallSessionStore`],
//! [`CallLifecycleController`], [`InviteListener`] and [`NotificationBridge`]
//! around a [`SignalChannel`] and a [`MediaSessionGateway`]. Nothing here is
//! global: each client owns its components and two clients can share a
//! process (the integration tests and the demo binary run caller and callee
//! side by side).
//!
//! # Examples
//!
//! ```rust
//! use studylink_call_core::{CallClientBuilder, ConversationId, LoopbackMediaGateway, SignalHub, UserId};
//!
//! # tokio_test::block_on(async {
//! let hub = SignalHub::new();
//! hub.add_conversation("study-group", &[UserId::from("alice"), UserId::from("bob")]);
//!
//! let alice = CallClientBuilder::new()
//!     .local_user("alice")
//!     .display_name("Alice")
//!     .signal_channel(hub.connect("alice"))
//!     .media_gateway(LoopbackMediaGateway::new())
//!     .build()
//!     .await
//!     .expect("Failed to build client");
//!
//! alice.start().unwrap();
//! let call_id = alice.initiate(ConversationId::from("study-group")).await.unwrap();
//! alice.leave(&call_id).await.unwrap();
//! alice.shutdown().await;
//! # })
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallId, CallInvite, CallSession, ConversationId, UserId};
use crate::config::{BusyPolicy, CallConfig, LocalUser};
use crate::controller::CallLifecycleController;
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, CallEventHandler, CallSnapshot, EventFilter, EventSubscription, NotificationBridge};
use crate::listener::{InviteListener, ListenerHandle};
use crate::media::MediaSessionGateway;
use crate::signal::{SignalChannel, Subscription};
use crate::store::CallSessionStore;

/// Fluent builder for [`CallClient`]
///
/// A signal channel and a media gateway are required; everything else has a
/// default from [`CallConfig`]. A full configuration can be handed in with
/// [`config`](Self::config) and then adjusted with the other methods.
#[derive(Default)]
pub struct CallClientBuilder {
    config: CallConfig,
    channel: Option<Arc<dyn SignalChannel>>,
    media: Option<Arc<dyn MediaSessionGateway>>,
}

impl CallClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete configuration
    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_user(mut self, user_id: impl Into<UserId>) -> Self {
        let display_name = self.config.local_user.display_name.take();
        self.config.local_user = LocalUser {
            id: user_id.into(),
            display_name,
        };
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.config.local_user.display_name = Some(name.into());
        self
    }

    pub fn ring_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_ring_timeout(timeout);
        self
    }

    pub fn media_join_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_media_join_timeout(timeout);
        self
    }

    pub fn busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.config = self.config.with_busy_policy(policy);
        self
    }

    pub fn signal_channel(mut self, channel: Arc<dyn SignalChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn media_gateway(mut self, media: Arc<dyn MediaSessionGateway>) -> Self {
        self.media = Some(media);
        self
    }

    /// Validate the configuration and wire the client
    ///
    /// The client is idle until [`CallClient::start`] is called.
    pub async fn build(self) -> CallResult<Arc<CallClient>> {
        self.config.validate()?;
        let channel = self
            .channel
            .ok_or_else(|| CallError::invalid_configuration("signal_channel", "required"))?;
        let media = self
            .media
            .ok_or_else(|| CallError::invalid_configuration("media_gateway", "required"))?;

        let bridge = Arc::new(NotificationBridge::new(self.config.event_channel_capacity));
        let store = Arc::new(CallSessionStore::new(
            self.config.local_user.id.clone(),
            bridge.clone(),
            self.config.dedup_window,
        ));
        let controller = Arc::new(CallLifecycleController::new(
            self.config.clone(),
            store.clone(),
            channel.clone(),
            media,
        ));
        let listener = Arc::new(InviteListener::new(&self.config, controller.clone()));

        info!(user_id = %self.config.local_user.id, "Call client built");
        Ok(Arc::new(CallClient {
            config: self.config,
            bridge,
            store,
            controller,
            listener,
            channel,
            running: Mutex::new(None),
            dispatcher: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }
}

/// One user's call client
pub struct CallClient {
    config: CallConfig,
    bridge: Arc<NotificationBridge>,
    store: Arc<CallSessionStore>,
    controller: Arc<CallLifecycleController>,
    listener: Arc<InviteListener>,
    channel: Arc<dyn SignalChannel>,
    running: Mutex<Option<ListenerHandle>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl CallClient {
    /// Start listening for signals and delivering events to handlers
    ///
    /// Must be called from within a tokio runtime. Starting twice is a no-op.
    pub fn start(&self) -> CallResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CallError::internal_error("client was shut down"));
        }

        let mut running = self.running.lock();
        if running.is_some() {
            debug!(user_id = %self.local_user(), "Client already started");
            return Ok(());
        }

        if let Some(dispatcher) = self.bridge.spawn_dispatcher() {
            *self.dispatcher.lock() = Some(dispatcher);
        }
        *running = Some(self.listener.start(self.channel.as_ref()));
        info!(user_id = %self.local_user(), "Call client started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop the client
    ///
    /// Leaves the live session (media and `USER_LEFT`), drops a pending
    /// invite without answering it and detaches from the signal channel.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = self.running.lock().take();
        if let Some(listener) = listener {
            listener.stop();
        }

        if let Some(session) = self.store.active_session() {
            if let Err(e) = self.controller.leave_with_reason(&session.call_id, "client shutdown").await {
                warn!(call_id = %session.call_id, error = %e, "Leave on shutdown failed");
            }
        }
        if let Some(invite) = self.store.pending_invite() {
            self.controller.dismiss(&invite.call_id);
        }

        info!(user_id = %self.local_user(), "Call client shut down");
    }

    pub fn local_user(&self) -> &UserId {
        &self.config.local_user.id
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Call everyone in a conversation
    pub async fn initiate(&self, conversation_id: ConversationId) -> CallResult<CallId> {
        self.controller.initiate(conversation_id).await
    }

    pub async fn accept(&self, call_id: &CallId) -> CallResult<()> {
        self.controller.accept(call_id).await
    }

    pub async fn reject(&self, call_id: &CallId) -> CallResult<()> {
        self.controller.reject(call_id).await
    }

    /// Drop the pending invite without telling the caller
    pub fn dismiss(&self, call_id: &CallId) -> bool {
        self.controller.dismiss(call_id)
    }

    pub async fn leave(&self, call_id: &CallId) -> CallResult<()> {
        self.controller.leave(call_id).await
    }

    /// Report that the media service lost this client's session
    pub async fn handle_media_disconnect(&self, call_id: &CallId) -> CallResult<()> {
        self.controller.handle_media_disconnect(call_id).await
    }

    pub fn active_session(&self) -> Option<CallSession> {
        self.store.active_session()
    }

    pub fn pending_invite(&self) -> Option<CallInvite> {
        self.store.pending_invite()
    }

    /// Stream of every event published from now on
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.bridge.events()
    }

    /// Receiver always holding the current invite and session
    pub fn snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.bridge.snapshot()
    }

    /// Register a handler; events flow to it while the returned
    /// [`Subscription`] is alive and the client is started
    pub fn subscribe(&self, handler: Arc<dyn CallEventHandler>, filter: EventFilter) -> Subscription {
        self.bridge.subscribe(EventSubscription::new(handler, filter))
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let Some(session) = self.store.active_session() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(call_id = %session.call_id, "Client dropped with a live call, leaving");
                let controller = self.controller.clone();
                runtime.spawn(async move {
                    let _ = controller.leave_with_reason(&session.call_id, "client dropped").await;
                });
            }
            Err(_) => {
                warn!(call_id = %session.call_id, "Client dropped with a live call outside a runtime");
            }
        }
    }
}
