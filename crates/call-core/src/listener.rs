//! Inbound signal handling
//!
//! [`InviteListener`] turns decoded messages from the signal channel into
//! store changes. Messages are processed one at a time in a single task, in
//! arrival order; media joins run in their own tasks so they never hold up
//! the queue. The channel delivers at least once and echoes our own
//! messages back, so everything here tolerates duplicates and loopback.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::call::{CallInvite, CallRole, CallState, ConversationId, UserId};
use crate::config::{BusyPolicy, CallConfig};
use crate::controller::CallLifecycleController;
use crate::events::InviteResolution;
use crate::signal::{codec, CallRequest, CallResponse, InboundSignal, SignalChannel, SignalMessage, Subscription};
use crate::store::{CallSessionStore, InviteInsert, RecentIds};

/// Running listener; stop it to detach from the channel
pub struct ListenerHandle {
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Unsubscribe from the channel and stop processing
    pub fn stop(self) {
        self.subscription.unsubscribe();
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Applies inbound call-control messages to the store
pub struct InviteListener {
    local_user: UserId,
    busy_policy: BusyPolicy,
    store: Arc<CallSessionStore>,
    controller: Arc<CallLifecycleController>,
    seen_requests: Mutex<RecentIds>,
}

impl InviteListener {
    pub fn new(config: &CallConfig, controller: Arc<CallLifecycleController>) -> Self {
        Self {
            local_user: config.local_user.id.clone(),
            busy_policy: config.busy_policy,
            store: controller.store().clone(),
            controller,
            seen_requests: Mutex::new(RecentIds::new(config.dedup_window)),
        }
    }

    /// Subscribe to `channel` and process its messages in a spawned task
    pub fn start(self: &Arc<Self>, channel: &dyn SignalChannel) -> ListenerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = channel.subscribe(Arc::new(move |signal: InboundSignal| {
            let _ = tx.send(signal);
        }));

        let listener = self.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                listener.handle(signal).await;
            }
            debug!(user_id = %listener.local_user, "Signal listener stopped");
        });

        ListenerHandle { subscription, task }
    }

    /// Process one raw inbound message; unrelated text is skipped
    pub async fn handle(&self, signal: InboundSignal) {
        let Some(message) = codec::decode(&signal.text) else {
            trace!(conversation_id = %signal.conversation_id, "Not a call signal");
            return;
        };
        self.handle_message(&signal.conversation_id, message).await;
    }

    /// Process one decoded message
    pub async fn handle_message(&self, conversation_id: &ConversationId, message: SignalMessage) {
        match message {
            SignalMessage::CallRequest(request) => self.on_request(conversation_id, request).await,
            SignalMessage::CallAccepted(response) => self.on_accepted(response),
            SignalMessage::CallRejected(response) => self.on_rejected(response),
            SignalMessage::UserLeft(response) => self.on_user_left(response).await,
        }
    }

    async fn on_request(&self, conversation_id: &ConversationId, request: CallRequest) {
        let call_id = request.call_id.clone();
        if request.caller_id == self.local_user {
            trace!(%call_id, "Own call request echoed back");
            return;
        }
        if !self.seen_requests.lock().insert(call_id.clone()) {
            debug!(%call_id, "Duplicate call request dropped");
            return;
        }

        let invite = CallInvite::new(
            call_id.clone(),
            request.caller_id.clone(),
            request.caller_name.clone(),
            conversation_id.clone(),
        );
        match self.store.insert_invite(invite) {
            InviteInsert::Created => self.controller.start_invite_timer(call_id),
            InviteInsert::Duplicate => debug!(%call_id, "Known call request dropped"),
            InviteInsert::Busy => match self.busy_policy {
                BusyPolicy::AutoReject => self.controller.reject_busy(conversation_id, &request).await,
                BusyPolicy::Ignore => {
                    info!(%call_id, caller_id = %request.caller_id, "Busy, ignoring call request")
                }
            },
        }
    }

    /// True if `response` answers the call we are ringing out
    fn answers_outgoing(&self, response: &CallResponse) -> bool {
        if response.user_id == self.local_user {
            trace!(call_id = %response.call_id, "Own response echoed back");
            return false;
        }
        match self.store.session(&response.call_id) {
            Some(session) => session.local_role == CallRole::Caller && session.state == CallState::RingingOut,
            None => false,
        }
    }

    fn on_accepted(&self, response: CallResponse) {
        if !self.answers_outgoing(&response) {
            debug!(call_id = %response.call_id, "Stale or foreign accept ignored");
            return;
        }

        let call_id = response.call_id;
        self.controller.cancel_ring_timer(&call_id);
        self.store.add_participant(&call_id, response.user_id.clone());
        if self
            .store
            .transition(&call_id, CallState::Accepted, Some("remote accepted"))
            .is_none()
        {
            return;
        }

        info!(%call_id, user_id = %response.user_id, "Call accepted by remote");
        self.controller.spawn_media_join(call_id);
    }

    fn on_rejected(&self, response: CallResponse) {
        if !self.answers_outgoing(&response) {
            debug!(call_id = %response.call_id, "Stale or foreign reject ignored");
            return;
        }

        let call_id = response.call_id;
        self.controller.cancel_ring_timer(&call_id);
        let reason = match &response.reason {
            Some(reason) => format!("remote rejected: {}", reason),
            None => "remote rejected".to_string(),
        };
        self.store.transition(&call_id, CallState::Rejected, Some(&reason));
        info!(%call_id, user_id = %response.user_id, "Call rejected by remote");
    }

    async fn on_user_left(&self, response: CallResponse) {
        let call_id = response.call_id.clone();
        if response.user_id == self.local_user {
            trace!(%call_id, "Own leave echoed back");
            return;
        }

        let withdrawn = self
            .store
            .invite(&call_id)
            .is_some_and(|invite| invite.caller_id == response.user_id);
        if withdrawn {
            if self
                .store
                .resolve_invite(&call_id, InviteResolution::Withdrawn)
                .is_some()
            {
                self.controller.cancel_ring_timer(&call_id);
                info!(%call_id, caller_id = %response.user_id, "Caller withdrew the invite");
            }
            return;
        }

        // the callee gave up before its accept reached us
        if self.answers_outgoing(&response) {
            info!(%call_id, user_id = %response.user_id, "Callee left while ringing");
            if let Err(e) = self.controller.leave_with_reason(&call_id, "remote left").await {
                debug!(%call_id, error = %e, "Leave after remote departure");
            }
            return;
        }

        match self.store.remove_participant(&call_id, &response.user_id) {
            Some(0) => {
                info!(%call_id, user_id = %response.user_id, "Last remote participant left");
                if let Err(e) = self.controller.leave_with_reason(&call_id, "remote left").await {
                    debug!(%call_id, error = %e, "Leave after remote departure");
                }
            }
            Some(remaining) => debug!(%call_id, remaining, "Participant left"),
            None => debug!(%call_id, user_id = %response.user_id, "Leave for unknown call or participant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallId;
    use crate::config::LocalUser;
    use crate::error::CallResult;
    use crate::events::NotificationBridge;
    use crate::media::LoopbackMediaGateway;
    use crate::signal::{encode, now_millis, SignalHandler};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalChannel for RecordingChannel {
        async fn send(&self, _conversation_id: &ConversationId, text: String) -> CallResult<()> {
            self.sent.lock().push(text);
            Ok(())
        }

        fn subscribe(&self, _handler: SignalHandler) -> Subscription {
            Subscription::noop()
        }
    }

    fn setup(policy: BusyPolicy) -> (Arc<InviteListener>, Arc<RecordingChannel>) {
        let config = CallConfig::new(LocalUser::new("bob")).with_busy_policy(policy);
        let channel = Arc::new(RecordingChannel::default());
        let store = Arc::new(CallSessionStore::new(
            UserId::from("bob"),
            Arc::new(NotificationBridge::new(64)),
            16,
        ));
        let controller = Arc::new(CallLifecycleController::new(
            config.clone(),
            store,
            channel.clone(),
            LoopbackMediaGateway::new(),
        ));
        (Arc::new(InviteListener::new(&config, controller)), channel)
    }

    fn request(call_id: &str, caller: &str) -> InboundSignal {
        let message = SignalMessage::CallRequest(CallRequest {
            call_id: CallId::from(call_id),
            caller_id: UserId::from(caller),
            caller_name: None,
            timestamp: now_millis(),
        });
        InboundSignal {
            conversation_id: ConversationId::from("k"),
            text: encode(&message).unwrap(),
        }
    }

    fn left(call_id: &str, user: &str) -> InboundSignal {
        let message = SignalMessage::UserLeft(CallResponse::new(CallId::from(call_id), UserId::from(user)));
        InboundSignal {
            conversation_id: ConversationId::from("k"),
            text: encode(&message).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_requests_create_one_invite() {
        let (listener, _) = setup(BusyPolicy::AutoReject);
        let mut events = listener.store.bridge().events();

        for _ in 0..3 {
            listener.handle(request("c1", "alice")).await;
        }

        let invite = listener.store.pending_invite().unwrap();
        assert_eq!(invite.call_id, CallId::from("c1"));
        let mut incoming = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, crate::events::CallEvent::IncomingInvite { .. }) {
                incoming += 1;
            }
        }
        assert_eq!(incoming, 1);
    }

    #[tokio::test]
    async fn test_loopback_and_noise_are_ignored() {
        let (listener, channel) = setup(BusyPolicy::AutoReject);
        listener.handle(request("c1", "bob")).await;
        listener
            .handle(InboundSignal {
                conversation_id: ConversationId::from("k"),
                text: "see you at the library".to_string(),
            })
            .await;

        assert!(listener.store.pending_invite().is_none());
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_busy_policy() {
        let (listener, channel) = setup(BusyPolicy::AutoReject);
        listener.handle(request("c1", "alice")).await;
        listener.handle(request("c2", "carol")).await;
        assert_eq!(listener.store.pending_invite().unwrap().call_id, CallId::from("c1"));
        let sent = channel.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("CALL_REJECTED:"));
        assert!(sent[0].contains("\"reason\":\"busy\""));

        let (listener, channel) = setup(BusyPolicy::Ignore);
        listener.handle(request("c1", "alice")).await;
        listener.handle(request("c2", "carol")).await;
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_caller_leaving_withdraws_invite() {
        let (listener, channel) = setup(BusyPolicy::AutoReject);
        listener.handle(request("c1", "alice")).await;

        // only the caller can withdraw
        listener.handle(left("c1", "mallory")).await;
        assert!(listener.store.pending_invite().is_some());

        listener.handle(left("c1", "alice")).await;
        assert!(listener.store.pending_invite().is_none());
        assert!(channel.sent.lock().is_empty());

        // a late redelivery does not bring it back
        listener.handle(request("c1", "alice")).await;
        assert!(listener.store.pending_invite().is_none());
    }

    #[tokio::test]
    async fn test_last_participant_leaving_ends_call() {
        let (listener, channel) = setup(BusyPolicy::AutoReject);
        listener.handle(request("c1", "alice")).await;
        listener.controller.accept(&CallId::from("c1")).await.unwrap();

        listener.handle(left("c1", "bob")).await;
        assert!(listener.store.active_session().is_some());

        listener.handle(left("c1", "alice")).await;
        assert!(listener.store.active_session().is_none());
        assert_eq!(
            channel.sent.lock().iter().filter(|t| t.starts_with("USER_LEFT:")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_started_listener_stops_cleanly() {
        let (listener, _) = setup(BusyPolicy::AutoReject);
        let hub = crate::signal::SignalHub::new();
        hub.add_conversation("k", &[UserId::from("alice"), UserId::from("bob")]);
        let bob = hub.connect("bob");
        let alice = hub.connect("alice");

        let handle = listener.start(bob.as_ref());
        assert!(handle.is_running());
        alice
            .send(&ConversationId::from("k"), request("c1", "alice").text)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while listener.store.pending_invite().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.stop();
    }
}
