//! Call lifecycle controller
//!
//! [`CallLifecycleController`] owns the outbound side of a call: it sends the
//! call-control signals, joins and leaves the media session and runs the ring
//! timers. All state it relies on lives in the [`CallSessionStore`]; the
//! controller only acts on claims the store hands out, so an operation invoked
//! twice (or from two tasks at once) has its side effects exactly once.
//!
//! Outbound signal delivery is best-effort. A send is retried once; if it still
//! fails a [`CallEvent::SignalDeliveryFailed`] notice is published and the
//! lifecycle carries on.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallId, CallState, ConversationId, UserId};
use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, EventPriority, InviteResolution, NotificationBridge};
use crate::media::{media_session_id, MediaParticipant, MediaSessionGateway};
use crate::recovery::{retry_with_backoff, with_timeout};
use crate::signal::{codec, now_millis, CallRequest, CallResponse, SignalChannel, SignalMessage};
use crate::store::{AcceptClaim, CallSessionStore, LeaveClaim};

/// Drives sessions through their lifecycle
pub struct CallLifecycleController {
    config: CallConfig,
    store: Arc<CallSessionStore>,
    channel: Arc<dyn SignalChannel>,
    media: Arc<dyn MediaSessionGateway>,
    ring_timers: DashMap<CallId, JoinHandle<()>>,
    media_joins: DashMap<CallId, JoinHandle<()>>,
}

impl CallLifecycleController {
    pub fn new(
        config: CallConfig,
        store: Arc<CallSessionStore>,
        channel: Arc<dyn SignalChannel>,
        media: Arc<dyn MediaSessionGateway>,
    ) -> Self {
        Self {
            config,
            store,
            channel,
            media,
            ring_timers: DashMap::new(),
            media_joins: DashMap::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.config.local_user.id
    }

    pub fn store(&self) -> &Arc<CallSessionStore> {
        &self.store
    }

    fn bridge(&self) -> &Arc<NotificationBridge> {
        self.store.bridge()
    }

    /// Start an outbound call in `conversation_id`
    ///
    /// Fails with [`CallError::CallAlreadyActive`] while another session is
    /// live. A failed `CALL_REQUEST` send does not fail the call: it keeps
    /// ringing until the ring timer expires it.
    pub async fn initiate(self: &Arc<Self>, conversation_id: ConversationId) -> CallResult<CallId> {
        let call_id = CallId::new_v4();
        self.store.begin_outgoing(call_id.clone(), conversation_id.clone())?;
        self.start_ring_timer(call_id.clone());

        let request = SignalMessage::CallRequest(CallRequest {
            call_id: call_id.clone(),
            caller_id: self.local_user().clone(),
            caller_name: self.config.local_user.display_name.clone(),
            timestamp: now_millis(),
        });
        info!(%call_id, %conversation_id, "Initiating call");
        self.send_signal(&conversation_id, request).await;

        Ok(call_id)
    }

    /// Accept a pending invite and join its media session
    ///
    /// Only the first accept of an invite has any effect; later calls return
    /// `Ok(())`. A media join failure ends the session `Failed` and is
    /// returned here as [`CallError::MediaJoin`]; the `CALL_ACCEPTED` already
    /// sent is not repeated.
    pub async fn accept(&self, call_id: &CallId) -> CallResult<()> {
        let session = match self.store.claim_accept(call_id)? {
            AcceptClaim::Claimed { session, .. } => session,
            AcceptClaim::AlreadyHandled => return Ok(()),
        };
        self.cancel_ring_timer(call_id);

        let accepted = CallResponse::new(call_id.clone(), self.local_user().clone());
        self.send_signal(&session.conversation_id, SignalMessage::CallAccepted(accepted))
            .await;

        self.connect_media(call_id).await
    }

    /// Decline a pending invite and tell the caller
    pub async fn reject(&self, call_id: &CallId) -> CallResult<()> {
        let Some(invite) = self.store.claim_reject(call_id)? else {
            return Ok(());
        };
        self.cancel_ring_timer(call_id);

        info!(%call_id, caller_id = %invite.caller_id, "Rejecting call");
        let rejected = CallResponse::new(call_id.clone(), self.local_user().clone());
        self.send_signal(&invite.conversation_id, SignalMessage::CallRejected(rejected))
            .await;
        Ok(())
    }

    /// Drop a pending invite locally without answering the caller
    ///
    /// Returns whether an invite was dropped.
    pub fn dismiss(&self, call_id: &CallId) -> bool {
        let dismissed = self
            .store
            .resolve_invite(call_id, InviteResolution::Dismissed)
            .is_some();
        if dismissed {
            self.cancel_ring_timer(call_id);
            debug!(%call_id, "Invite dismissed");
        }
        dismissed
    }

    /// End a session; safe to call any number of times
    pub async fn leave(&self, call_id: &CallId) -> CallResult<()> {
        self.leave_with_reason(call_id, "local leave").await
    }

    /// Treat a disconnect reported by the media service as the end of the call
    pub async fn handle_media_disconnect(&self, call_id: &CallId) -> CallResult<()> {
        warn!(%call_id, "Media session disconnected");
        self.leave_with_reason(call_id, "media disconnected").await
    }

    pub(crate) async fn leave_with_reason(&self, call_id: &CallId, reason: &str) -> CallResult<()> {
        let session = match self.store.claim_leave(call_id, reason) {
            LeaveClaim::Claimed { session } => session,
            LeaveClaim::AlreadyLeft => {
                debug!(%call_id, "Leave already handled");
                return Ok(());
            }
            LeaveClaim::NotFound => {
                return Err(CallError::CallNotFound {
                    call_id: call_id.clone(),
                })
            }
        };
        self.cancel_ring_timer(call_id);

        if let Some(handle) = &session.media_handle {
            self.media.leave(handle).await;
        }

        let left = CallResponse::new(call_id.clone(), self.local_user().clone());
        self.send_signal(&session.conversation_id, SignalMessage::UserLeft(left))
            .await;
        Ok(())
    }

    /// Move an accepted session through `Connecting` into the media session
    pub(crate) async fn connect_media(&self, call_id: &CallId) -> CallResult<()> {
        let Some(session) = self
            .store
            .transition(call_id, CallState::Connecting, Some("joining media"))
        else {
            debug!(%call_id, "Session gone before media join");
            return Ok(());
        };

        let participant = MediaParticipant {
            user_id: self.local_user().clone(),
            display_name: self.config.local_user.display_name.clone(),
        };
        let session_id = media_session_id(call_id);
        let joined = with_timeout(
            "media_join",
            self.config.media_join_timeout(),
            self.media.create_or_join(&session_id, &participant),
        )
        .await;

        match joined {
            Ok(handle) => match self.store.attach_media(call_id, handle) {
                Ok(()) => {
                    self.store
                        .transition(call_id, CallState::Connected, Some("media joined"));
                    Ok(())
                }
                Err(handle) => {
                    info!(%call_id, session_id = %handle.session_id, "Call ended during media join, releasing session");
                    self.media.leave(&handle).await;
                    Ok(())
                }
            },
            Err(e) => {
                let error = match e {
                    CallError::MediaJoin { .. } => e,
                    other => CallError::media_join(call_id.clone(), other.to_string()),
                };
                let reason = error.to_string();
                if self
                    .store
                    .transition(call_id, CallState::Failed, Some(&reason))
                    .is_none()
                {
                    debug!(%call_id, error = %error, "Media join failed after the call ended");
                    return Ok(());
                }

                self.bridge().publish(CallEvent::MediaJoinFailed {
                    call_id: call_id.clone(),
                    error: error.clone(),
                    priority: EventPriority::High,
                });

                // the peer may already be in the room waiting for us
                let left = CallResponse::new(call_id.clone(), self.local_user().clone())
                    .with_reason("media failed");
                self.send_signal(&session.conversation_id, SignalMessage::UserLeft(left))
                    .await;
                Err(error)
            }
        }
    }

    /// Join the media session of an accepted outgoing call in its own task
    ///
    /// Returns immediately so inbound signals keep flowing while the gateway
    /// works. A leave that lands mid-join is settled by the store: the late
    /// handle is refused by `attach_media` and released.
    pub(crate) fn spawn_media_join(self: &Arc<Self>, call_id: CallId) {
        let controller = self.clone();
        let join_id = call_id.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = controller.connect_media(&join_id).await {
                warn!(call_id = %join_id, error = %e, "Outgoing call failed to connect");
            }
            controller.media_joins.remove(&join_id);
        });
        self.media_joins.insert(call_id.clone(), handle);
        // the join may have finished before its handle was recorded
        self.media_joins.remove_if(&call_id, |_, handle| handle.is_finished());
    }

    /// Number of media joins still in flight
    pub fn pending_media_joins(&self) -> usize {
        self.media_joins.len()
    }

    /// Send `CALL_REJECTED{reason:"busy"}` for a request that arrived while busy
    pub(crate) async fn reject_busy(&self, conversation_id: &ConversationId, request: &CallRequest) {
        info!(call_id = %request.call_id, caller_id = %request.caller_id, "Busy, rejecting call");
        let rejected = CallResponse::new(request.call_id.clone(), self.local_user().clone()).with_reason("busy");
        self.send_signal(conversation_id, SignalMessage::CallRejected(rejected))
            .await;
        self.bridge().publish(CallEvent::BusyRejected {
            call_id: request.call_id.clone(),
            caller_id: request.caller_id.clone(),
            priority: EventPriority::Low,
        });
    }

    /// Encode and send one signal; returns whether it was delivered
    pub(crate) async fn send_signal(&self, conversation_id: &ConversationId, message: SignalMessage) -> bool {
        let kind = message.kind();
        let call_id = message.call_id().clone();

        let result = match codec::encode(&message) {
            Ok(text) => {
                retry_with_backoff(kind.tag(), self.config.signal_retry(), || {
                    self.channel.send(conversation_id, text.clone())
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(%call_id, %kind, %conversation_id, "Signal sent");
                true
            }
            Err(error) => {
                warn!(%call_id, %kind, %conversation_id, error = %error, "Signal not delivered");
                self.bridge().publish(CallEvent::SignalDeliveryFailed {
                    call_id: Some(call_id),
                    kind,
                    error,
                    priority: EventPriority::Low,
                });
                false
            }
        }
    }

    /// Expire an outbound call that nobody answers in time
    fn start_ring_timer(self: &Arc<Self>, call_id: CallId) {
        let controller = Arc::downgrade(self);
        let timeout = self.config.ring_timeout();
        let timer_id = call_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(controller) = controller.upgrade() {
                controller.ring_timers.remove(&timer_id);
                controller.expire_outgoing(&timer_id).await;
            }
        });
        self.ring_timers.insert(call_id, handle);
    }

    /// Expire an inbound invite that is not answered in time
    pub(crate) fn start_invite_timer(self: &Arc<Self>, call_id: CallId) {
        let controller = Arc::downgrade(self);
        let timeout = self.config.ring_timeout();
        let timer_id = call_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(controller) = controller.upgrade() {
                controller.ring_timers.remove(&timer_id);
                if controller
                    .store
                    .resolve_invite(&timer_id, InviteResolution::Expired)
                    .is_some()
                {
                    info!(call_id = %timer_id, "Invite expired unanswered");
                }
            }
        });
        self.ring_timers.insert(call_id, handle);
    }

    async fn expire_outgoing(&self, call_id: &CallId) {
        let Some(session) = self
            .store
            .transition(call_id, CallState::Expired, Some("ring timeout"))
        else {
            return;
        };

        info!(%call_id, "Outgoing call expired unanswered");
        let left = CallResponse::new(call_id.clone(), self.local_user().clone()).with_reason("ring timeout");
        self.send_signal(&session.conversation_id, SignalMessage::UserLeft(left))
            .await;
    }

    pub(crate) fn cancel_ring_timer(&self, call_id: &CallId) {
        if let Some((_, handle)) = self.ring_timers.remove(call_id) {
            handle.abort();
        }
    }

    /// Number of ring timers still armed
    pub fn pending_timers(&self) -> usize {
        self.ring_timers.len()
    }
}

impl Drop for CallLifecycleController {
    fn drop(&mut self) {
        for entry in self.ring_timers.iter().chain(self.media_joins.iter()) {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallInvite;
    use crate::config::LocalUser;
    use crate::media::LoopbackMediaGateway;
    use crate::signal::{SignalHandler, Subscription};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Records outbound text; optionally fails every send
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        attempts: Mutex<u32>,
        fail: bool,
    }

    #[async_trait]
    impl SignalChannel for RecordingChannel {
        async fn send(&self, conversation_id: &ConversationId, text: String) -> CallResult<()> {
            *self.attempts.lock() += 1;
            if self.fail {
                return Err(CallError::signal_delivery(conversation_id.clone(), "offline"));
            }
            self.sent.lock().push(text);
            Ok(())
        }

        fn subscribe(&self, _handler: SignalHandler) -> Subscription {
            Subscription::noop()
        }
    }

    impl RecordingChannel {
        fn count(&self, prefix: &str) -> usize {
            self.sent.lock().iter().filter(|t| t.starts_with(prefix)).count()
        }
    }

    fn controller(
        channel: Arc<RecordingChannel>,
        media: Arc<LoopbackMediaGateway>,
    ) -> Arc<CallLifecycleController> {
        let config = CallConfig::new(LocalUser::new("bob").with_display_name("Bob"))
            .with_ring_timeout(Duration::from_secs(40));
        let bridge = Arc::new(NotificationBridge::new(64));
        let store = Arc::new(CallSessionStore::new(UserId::from("bob"), bridge, 16));
        Arc::new(CallLifecycleController::new(config, store, channel, media))
    }

    fn ring(controller: &CallLifecycleController, id: &str) -> CallId {
        let call_id = CallId::from(id);
        controller.store().insert_invite(CallInvite::new(
            call_id.clone(),
            UserId::from("alice"),
            None,
            ConversationId::from("k"),
        ));
        call_id
    }

    fn notices(rx: &mut broadcast::Receiver<CallEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CallEvent::SignalDeliveryFailed { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_accept_twice_sends_one_accept() {
        let channel = Arc::new(RecordingChannel::default());
        let media = LoopbackMediaGateway::new();
        let controller = controller(channel.clone(), media.clone());
        let call_id = ring(&controller, "c1");

        controller.accept(&call_id).await.unwrap();
        controller.accept(&call_id).await.unwrap();

        assert_eq!(channel.count("CALL_ACCEPTED:"), 1);
        let session = controller.store().session(&call_id).unwrap();
        assert_eq!(session.state, CallState::Connected);
        assert_eq!(media.members(&media_session_id(&call_id)), vec![UserId::from("bob")]);

        // reject after accept is a no-op
        controller.reject(&call_id).await.unwrap();
        assert_eq!(channel.count("CALL_REJECTED:"), 0);
    }

    #[tokio::test]
    async fn test_leave_releases_media_once() {
        let channel = Arc::new(RecordingChannel::default());
        let media = LoopbackMediaGateway::new();
        let controller = controller(channel.clone(), media.clone());
        let call_id = ring(&controller, "c1");
        controller.accept(&call_id).await.unwrap();

        for _ in 0..3 {
            controller.leave(&call_id).await.unwrap();
        }
        assert_eq!(media.leave_count(), 1);
        assert_eq!(channel.count("USER_LEFT:"), 1);
        assert!(controller.store().active_session().is_none());
    }

    #[tokio::test]
    async fn test_media_failure_fails_session() {
        let channel = Arc::new(RecordingChannel::default());
        let media = LoopbackMediaGateway::new();
        media.set_fail_joins(true);
        let controller = controller(channel.clone(), media);
        let call_id = ring(&controller, "c1");

        let err = controller.accept(&call_id).await.unwrap_err();
        assert_eq!(err.category(), "media");
        assert!(controller.store().is_finished(&call_id));
        assert!(controller.store().active_session().is_none());
        assert_eq!(channel.count("CALL_ACCEPTED:"), 1);

        controller.accept(&call_id).await.unwrap();
        assert_eq!(channel.count("CALL_ACCEPTED:"), 1);
    }

    #[tokio::test]
    async fn test_dismiss_sends_nothing() {
        let channel = Arc::new(RecordingChannel::default());
        let controller = controller(channel.clone(), LoopbackMediaGateway::new());
        let call_id = ring(&controller, "c1");

        assert!(controller.dismiss(&call_id));
        assert!(!controller.dismiss(&call_id));
        assert!(channel.sent.lock().is_empty());
        assert!(controller.store().pending_invite().is_none());
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_found() {
        let controller = controller(Arc::new(RecordingChannel::default()), LoopbackMediaGateway::new());
        let missing = CallId::from("missing");
        assert!(matches!(
            controller.accept(&missing).await,
            Err(CallError::CallNotFound { .. })
        ));
        assert!(matches!(
            controller.leave(&missing).await,
            Err(CallError::CallNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_is_a_notice() {
        let channel = Arc::new(RecordingChannel {
            fail: true,
            ..Default::default()
        });
        let controller = controller(channel.clone(), LoopbackMediaGateway::new());
        let mut events = controller.store().bridge().events();

        let call_id = controller.initiate(ConversationId::from("k")).await.unwrap();
        assert_eq!(*channel.attempts.lock(), 2);
        assert_eq!(notices(&mut events), 1);
        assert_eq!(
            controller.store().session(&call_id).map(|s| s.state),
            Some(CallState::RingingOut)
        );
        assert!(matches!(
            controller.initiate(ConversationId::from("k")).await,
            Err(CallError::CallAlreadyActive { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_expires_outgoing_call() {
        let channel = Arc::new(RecordingChannel::default());
        let controller = controller(channel.clone(), LoopbackMediaGateway::new());

        let call_id = controller.initiate(ConversationId::from("k")).await.unwrap();
        assert_eq!(controller.pending_timers(), 1);

        tokio::time::sleep(Duration::from_secs(41)).await;

        assert!(controller.store().session(&call_id).is_none());
        assert!(controller.store().is_finished(&call_id));
        assert_eq!(channel.count("USER_LEFT:"), 1);
        assert_eq!(controller.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_expires_silently() {
        let channel = Arc::new(RecordingChannel::default());
        let controller = controller(channel.clone(), LoopbackMediaGateway::new());
        let call_id = ring(&controller, "c1");
        controller.start_invite_timer(call_id.clone());

        tokio::time::sleep(Duration::from_secs(41)).await;

        assert!(controller.store().pending_invite().is_none());
        assert!(channel.sent.lock().is_empty());
        controller.reject(&call_id).await.unwrap();
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_outgoing_media_join_runs_in_background() {
        let channel = Arc::new(RecordingChannel::default());
        let media = LoopbackMediaGateway::new();
        let controller = controller(channel.clone(), media.clone());
        let call_id = controller.initiate(ConversationId::from("k")).await.unwrap();
        controller.cancel_ring_timer(&call_id);
        controller.store().add_participant(&call_id, UserId::from("alice"));
        controller
            .store()
            .transition(&call_id, CallState::Accepted, Some("remote accepted"))
            .unwrap();

        controller.spawn_media_join(call_id.clone());

        tokio::time::timeout(Duration::from_secs(1), async {
            while controller.pending_media_joins() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let session = controller.store().session(&call_id).unwrap();
        assert_eq!(session.state, CallState::Connected);
        assert!(session.media_handle.is_some());
        assert_eq!(media.members(&media_session_id(&call_id)), vec![UserId::from("bob")]);
    }
}
