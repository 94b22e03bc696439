//! Call session store
//!
//! Holds the one live [`CallSession`] and the one pending [`CallInvite`] of a
//! client and is the only place their state changes. Every mutation runs in a
//! short synchronous critical section, so the idempotency guards
//! (`accept_sent`, `leave_sent`, invite resolution) are check-and-set: of any
//! number of racing callers exactly one wins the claim.
//!
//! Transitions outside the state machine are logged and ignored. Sessions that
//! reach a terminal state are removed and their call id is remembered for a
//! while, which turns late or repeated operations on them into no-ops.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::call::{CallId, CallInvite, CallRole, CallSession, CallState, ConversationId, InviteState, UserId};
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, CallSnapshot, CallStatusInfo, InviteResolution, NotificationBridge};
use crate::media::SessionHandle;

/// Result of offering an inbound invite to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteInsert {
    Created,
    /// Same call id already known; redelivery
    Duplicate,
    /// Another call is live or pending
    Busy,
}

/// Result of claiming the right to send `CALL_ACCEPTED`
#[derive(Debug, Clone)]
pub enum AcceptClaim {
    /// This caller won; the session is now `Accepted`
    Claimed { invite: CallInvite, session: CallSession },
    /// Accept already fired or the call is over
    AlreadyHandled,
}

/// Result of claiming the right to tear a session down
#[derive(Debug, Clone)]
pub enum LeaveClaim {
    /// This caller won; `session` is the final state, media handle included
    Claimed { session: CallSession },
    AlreadyLeft,
    NotFound,
}

/// Bounded set of recently seen call ids, oldest evicted first
#[derive(Debug)]
pub(crate) struct RecentIds {
    order: VecDeque<CallId>,
    set: HashSet<CallId>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember `call_id`; returns `false` if it was already known
    pub(crate) fn insert(&mut self, call_id: CallId) -> bool {
        if !self.set.insert(call_id.clone()) {
            return false;
        }
        self.order.push_back(call_id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub(crate) fn contains(&self, call_id: &CallId) -> bool {
        self.set.contains(call_id)
    }
}

#[derive(Debug)]
struct StoreInner {
    invite: Option<CallInvite>,
    session: Option<CallSession>,
    finished: RecentIds,
}

impl StoreInner {
    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            invite: self.invite.clone(),
            session: self.session.clone(),
        }
    }
}

/// Holds at most one invite and one session and enforces the state machine
pub struct CallSessionStore {
    local_user: UserId,
    inner: Mutex<StoreInner>,
    bridge: Arc<NotificationBridge>,
}

impl CallSessionStore {
    pub fn new(local_user: UserId, bridge: Arc<NotificationBridge>, finished_capacity: usize) -> Self {
        Self {
            local_user,
            inner: Mutex::new(StoreInner {
                invite: None,
                session: None,
                finished: RecentIds::new(finished_capacity),
            }),
            bridge,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn bridge(&self) -> &Arc<NotificationBridge> {
        &self.bridge
    }

    /// A session is live or an invite is waiting for an answer
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.lock();
        inner.session.is_some() || inner.invite.as_ref().is_some_and(CallInvite::is_pending)
    }

    pub fn active_session(&self) -> Option<CallSession> {
        self.inner.lock().session.clone()
    }

    pub fn session(&self, call_id: &CallId) -> Option<CallSession> {
        self.inner
            .lock()
            .session
            .as_ref()
            .filter(|s| &s.call_id == call_id)
            .cloned()
    }

    pub fn pending_invite(&self) -> Option<CallInvite> {
        self.inner.lock().invite.clone()
    }

    pub fn invite(&self, call_id: &CallId) -> Option<CallInvite> {
        self.inner
            .lock()
            .invite
            .as_ref()
            .filter(|i| &i.call_id == call_id)
            .cloned()
    }

    /// Whether the call already ended (session or invite)
    pub fn is_finished(&self, call_id: &CallId) -> bool {
        self.inner.lock().finished.contains(call_id)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.lock().snapshot()
    }

    /// Store a freshly received invite
    pub fn insert_invite(&self, invite: CallInvite) -> InviteInsert {
        let mut inner = self.inner.lock();
        let call_id = invite.call_id.clone();

        let known = inner.finished.contains(&call_id)
            || inner.invite.as_ref().is_some_and(|i| i.call_id == call_id)
            || inner.session.as_ref().is_some_and(|s| s.call_id == call_id);
        if known {
            debug!(%call_id, "Invite already known");
            return InviteInsert::Duplicate;
        }

        if inner.session.is_some() || inner.invite.is_some() {
            return InviteInsert::Busy;
        }

        info!(%call_id, caller_id = %invite.caller_id, "Incoming call invite");
        inner.invite = Some(invite.clone());
        self.bridge.publish(CallEvent::incoming_invite(invite));
        self.bridge.update_snapshot(inner.snapshot());
        InviteInsert::Created
    }

    /// Move the pending invite out of `Pending` and drop it
    ///
    /// Returns the invite if this call resolved it, `None` if it was not
    /// pending (already answered, expired, or unknown).
    pub fn resolve_invite(&self, call_id: &CallId, resolution: InviteResolution) -> Option<CallInvite> {
        let mut inner = self.inner.lock();
        self.resolve_invite_locked(&mut inner, call_id, resolution)
    }

    fn resolve_invite_locked(
        &self,
        inner: &mut StoreInner,
        call_id: &CallId,
        resolution: InviteResolution,
    ) -> Option<CallInvite> {
        if !inner
            .invite
            .as_ref()
            .is_some_and(|i| &i.call_id == call_id && i.is_pending())
        {
            return None;
        }

        let mut invite = inner.invite.take()?;
        invite.state = match resolution {
            InviteResolution::Accepted => InviteState::Accepted,
            InviteResolution::Rejected => InviteState::Rejected,
            InviteResolution::Expired | InviteResolution::Withdrawn => InviteState::Expired,
            InviteResolution::Dismissed => InviteState::Dismissed,
        };

        debug!(%call_id, ?resolution, "Invite resolved");
        inner.finished.insert(call_id.clone());
        self.bridge
            .publish(CallEvent::invite_resolved(call_id.clone(), resolution));
        self.bridge.update_snapshot(inner.snapshot());
        Some(invite)
    }

    /// Create the caller-side session and start ringing
    pub fn begin_outgoing(&self, call_id: CallId, conversation_id: ConversationId) -> CallResult<CallSession> {
        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.session {
            return Err(CallError::CallAlreadyActive {
                call_id: existing.call_id.clone(),
            });
        }

        inner.session = Some(CallSession::new(
            call_id.clone(),
            conversation_id,
            self.local_user.clone(),
            CallRole::Caller,
        ));
        self.transition_locked(&mut inner, &call_id, CallState::RingingOut, Some("local initiate"))
            .ok_or_else(|| CallError::internal_error("new session refused RingingOut"))
    }

    /// Claim the accept for a pending invite
    ///
    /// The winner gets a session already moved `Idle → RingingIn → Accepted`
    /// with `accept_sent` set; everyone else gets [`AcceptClaim::AlreadyHandled`].
    pub fn claim_accept(&self, call_id: &CallId) -> CallResult<AcceptClaim> {
        let mut inner = self.inner.lock();

        if let Some(session) = &inner.session {
            if &session.call_id == call_id {
                debug!(%call_id, accept_sent = session.accept_sent, "Accept already claimed");
                return Ok(AcceptClaim::AlreadyHandled);
            }
        }
        if inner.finished.contains(call_id) {
            debug!(%call_id, "Accept for finished call ignored");
            return Ok(AcceptClaim::AlreadyHandled);
        }
        if !inner.invite.as_ref().is_some_and(|i| &i.call_id == call_id) {
            return Err(CallError::CallNotFound {
                call_id: call_id.clone(),
            });
        }
        if let Some(existing) = &inner.session {
            return Err(CallError::CallAlreadyActive {
                call_id: existing.call_id.clone(),
            });
        }

        let invite = self
            .resolve_invite_locked(&mut inner, call_id, InviteResolution::Accepted)
            .ok_or_else(|| CallError::CallNotFound {
                call_id: call_id.clone(),
            })?;

        let mut session = CallSession::new(
            call_id.clone(),
            invite.conversation_id.clone(),
            self.local_user.clone(),
            CallRole::Callee,
        );
        session.participant_ids.insert(invite.caller_id.clone());
        session.accept_sent = true;
        inner.session = Some(session);

        self.transition_locked(&mut inner, call_id, CallState::RingingIn, Some("inbound invite"));
        let session = self
            .transition_locked(&mut inner, call_id, CallState::Accepted, Some("local accept"))
            .ok_or_else(|| CallError::internal_error("accepted session refused transition"))?;

        Ok(AcceptClaim::Claimed { invite, session })
    }

    /// Claim the reject for a pending invite
    ///
    /// `Ok(Some(invite))` for the winner, `Ok(None)` when the invite was
    /// already answered or is over.
    pub fn claim_reject(&self, call_id: &CallId) -> CallResult<Option<CallInvite>> {
        let mut inner = self.inner.lock();
        if let Some(invite) = self.resolve_invite_locked(&mut inner, call_id, InviteResolution::Rejected) {
            return Ok(Some(invite));
        }

        let answered = inner.finished.contains(call_id)
            || inner.session.as_ref().is_some_and(|s| &s.call_id == call_id);
        if answered {
            debug!(%call_id, "Reject after answer ignored");
            Ok(None)
        } else {
            Err(CallError::CallNotFound {
                call_id: call_id.clone(),
            })
        }
    }

    /// Apply a state transition; illegal requests are logged and ignored
    pub fn transition(&self, call_id: &CallId, to: CallState, reason: Option<&str>) -> Option<CallSession> {
        let mut inner = self.inner.lock();
        self.transition_locked(&mut inner, call_id, to, reason)
    }

    fn transition_locked(
        &self,
        inner: &mut StoreInner,
        call_id: &CallId,
        to: CallState,
        reason: Option<&str>,
    ) -> Option<CallSession> {
        let Some(session) = inner.session.as_mut().filter(|s| &s.call_id == call_id) else {
            debug!(%call_id, ?to, "Transition for unknown session ignored");
            return None;
        };

        let from = session.state;
        if !from.can_transition_to(to) {
            let err = CallError::IllegalTransition {
                call_id: call_id.clone(),
                from,
                to,
            };
            warn!(%call_id, error = %err, "Ignoring illegal transition");
            return None;
        }

        session.state = to;
        if to == CallState::Connected {
            session.connected_at = Some(Utc::now());
        }
        let updated = session.clone();

        info!(%call_id, %from, %to, reason = reason.unwrap_or(""), "Call state changed");
        self.bridge.publish(CallEvent::state_changed(CallStatusInfo {
            call_id: call_id.clone(),
            previous_state: from,
            new_state: to,
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        }));

        if to.is_terminal() {
            inner.session = None;
            inner.finished.insert(call_id.clone());
        }
        self.bridge.update_snapshot(inner.snapshot());
        Some(updated)
    }

    /// Record the media handle of a session that is still connecting
    ///
    /// Gives the handle back when the session is gone or no longer waiting
    /// for media; the caller must release it.
    pub fn attach_media(&self, call_id: &CallId, handle: SessionHandle) -> Result<(), SessionHandle> {
        let mut inner = self.inner.lock();
        match inner.session.as_mut().filter(|s| &s.call_id == call_id) {
            Some(session) if session.state == CallState::Connecting && !session.leave_sent => {
                session.media_handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Claim the teardown of a session and end it
    pub fn claim_leave(&self, call_id: &CallId, reason: &str) -> LeaveClaim {
        let mut inner = self.inner.lock();

        let Some(session) = inner.session.as_mut().filter(|s| &s.call_id == call_id) else {
            return if inner.finished.contains(call_id) {
                LeaveClaim::AlreadyLeft
            } else {
                LeaveClaim::NotFound
            };
        };
        if session.leave_sent {
            return LeaveClaim::AlreadyLeft;
        }

        session.leave_sent = true;
        let mut claimed = session.clone();
        session.media_handle = None;

        match self.transition_locked(&mut inner, call_id, CallState::Ended, Some(reason)) {
            Some(ended) => {
                claimed.state = ended.state;
                LeaveClaim::Claimed { session: claimed }
            }
            None => LeaveClaim::AlreadyLeft,
        }
    }

    pub fn add_participant(&self, call_id: &CallId, user_id: UserId) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.as_mut().filter(|s| &s.call_id == call_id) {
            if session.participant_ids.insert(user_id) {
                let snapshot = inner.snapshot();
                self.bridge.update_snapshot(snapshot);
            }
        }
    }

    /// Remove a participant; returns how many remote participants remain, or
    /// `None` if `user_id` was not part of the call
    pub fn remove_participant(&self, call_id: &CallId, user_id: &UserId) -> Option<usize> {
        let mut inner = self.inner.lock();
        let session = inner.session.as_mut().filter(|s| &s.call_id == call_id)?;
        if !session.participant_ids.remove(user_id) {
            return None;
        }
        let remaining = session.remote_participants(&self.local_user).count();
        let snapshot = inner.snapshot();
        self.bridge.update_snapshot(snapshot);
        Some(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;
    use tracing_test::traced_test;

    fn store() -> CallSessionStore {
        CallSessionStore::new(UserId::from("bob"), Arc::new(NotificationBridge::new(64)), 16)
    }

    fn invite(id: &str) -> CallInvite {
        CallInvite::new(
            CallId::from(id),
            UserId::from("alice"),
            Some("Alice".to_string()),
            ConversationId::from("k"),
        )
    }

    fn drain_states(rx: &mut tokio::sync::broadcast::Receiver<CallEvent>) -> Vec<CallState> {
        let mut states = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(CallEvent::CallStateChanged { info, .. }) => states.push(info.new_state),
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
        states
    }

    #[test]
    fn test_invite_insert_dedup_and_busy() {
        let store = store();
        assert_eq!(store.insert_invite(invite("c1")), InviteInsert::Created);
        assert_eq!(store.insert_invite(invite("c1")), InviteInsert::Duplicate);
        assert_eq!(store.insert_invite(invite("c2")), InviteInsert::Busy);
        assert!(store.is_busy());

        let dismissed = store.resolve_invite(&CallId::from("c1"), InviteResolution::Dismissed).unwrap();
        assert_eq!(dismissed.state, InviteState::Dismissed);
        assert!(!dismissed.is_pending());
        assert!(!store.is_busy());
        // a redelivery after dismissal must not resurrect the invite
        assert_eq!(store.insert_invite(invite("c1")), InviteInsert::Duplicate);
    }

    #[test]
    fn test_claim_accept_walks_ringing_in() {
        let store = store();
        let mut rx = store.bridge().events();
        store.insert_invite(invite("c1"));

        let claim = store.claim_accept(&CallId::from("c1")).unwrap();
        let AcceptClaim::Claimed { invite, session } = claim else {
            panic!("first accept must win");
        };
        assert_eq!(invite.state, InviteState::Accepted);
        assert_eq!(session.state, CallState::Accepted);
        assert_eq!(session.local_role, CallRole::Callee);
        assert!(session.accept_sent);
        assert!(session.participant_ids.contains(&UserId::from("alice")));
        assert_eq!(drain_states(&mut rx), vec![CallState::RingingIn, CallState::Accepted]);

        assert!(matches!(
            store.claim_accept(&CallId::from("c1")).unwrap(),
            AcceptClaim::AlreadyHandled
        ));
        assert_eq!(store.claim_reject(&CallId::from("c1")).unwrap(), None);
        assert!(store.pending_invite().is_none());
    }

    #[test]
    fn test_unknown_calls_are_errors() {
        let store = store();
        assert!(matches!(
            store.claim_accept(&CallId::from("zz")),
            Err(CallError::CallNotFound { .. })
        ));
        assert!(store.claim_reject(&CallId::from("zz")).is_err());
        assert!(matches!(store.claim_leave(&CallId::from("zz"), "x"), LeaveClaim::NotFound));
    }

    #[test]
    fn test_begin_outgoing_enforces_single_session() {
        let store = store();
        let session = store
            .begin_outgoing(CallId::from("c1"), ConversationId::from("k"))
            .unwrap();
        assert_eq!(session.state, CallState::RingingOut);
        assert_eq!(session.local_role, CallRole::Caller);

        let err = store
            .begin_outgoing(CallId::from("c2"), ConversationId::from("k2"))
            .unwrap_err();
        assert!(matches!(err, CallError::CallAlreadyActive { call_id } if call_id == CallId::from("c1")));
    }

    #[test]
    #[traced_test]
    fn test_illegal_transition_is_logged_noop() {
        let store = store();
        let call_id = CallId::from("c1");
        store.begin_outgoing(call_id.clone(), ConversationId::from("k")).unwrap();

        assert!(store.transition(&call_id, CallState::Connected, None).is_none());
        assert_eq!(store.session(&call_id).unwrap().state, CallState::RingingOut);
        assert!(logs_contain("Ignoring illegal transition"));
    }

    #[test]
    fn test_terminal_state_removes_session() {
        let store = store();
        let call_id = CallId::from("c1");
        store.begin_outgoing(call_id.clone(), ConversationId::from("k")).unwrap();
        let rejected = store.transition(&call_id, CallState::Rejected, Some("remote rejected")).unwrap();
        assert_eq!(rejected.state, CallState::Rejected);

        assert!(store.active_session().is_none());
        assert!(store.is_finished(&call_id));
        assert!(store.transition(&call_id, CallState::Ended, None).is_none());
        assert!(matches!(store.claim_leave(&call_id, "again"), LeaveClaim::AlreadyLeft));
    }

    #[test]
    fn test_leave_claim_hands_out_media_handle_once() {
        let store = store();
        let call_id = CallId::from("c1");
        store.insert_invite(invite("c1"));
        store.claim_accept(&call_id).unwrap();
        store.transition(&call_id, CallState::Connecting, None).unwrap();

        let handle = SessionHandle {
            session_id: "call-c1".into(),
            token: "t1".into(),
        };
        store.attach_media(&call_id, handle.clone()).unwrap();
        store.transition(&call_id, CallState::Connected, None).unwrap();

        let LeaveClaim::Claimed { session } = store.claim_leave(&call_id, "local leave") else {
            panic!("first leave must win");
        };
        assert_eq!(session.media_handle, Some(handle));
        assert!(session.leave_sent);
        assert_eq!(session.state, CallState::Ended);
        assert!(matches!(store.claim_leave(&call_id, "again"), LeaveClaim::AlreadyLeft));
    }

    #[test]
    fn test_attach_media_after_leave_returns_handle() {
        let store = store();
        let call_id = CallId::from("c1");
        store.insert_invite(invite("c1"));
        store.claim_accept(&call_id).unwrap();
        store.transition(&call_id, CallState::Connecting, None).unwrap();
        store.claim_leave(&call_id, "navigated away");

        let handle = SessionHandle {
            session_id: "call-c1".into(),
            token: "late".into(),
        };
        assert_eq!(store.attach_media(&call_id, handle.clone()), Err(handle));
    }

    #[test]
    fn test_participants_and_snapshot() {
        let store = store();
        let call_id = CallId::from("c1");
        let snapshots = store.bridge().snapshot();
        store.begin_outgoing(call_id.clone(), ConversationId::from("k")).unwrap();
        store.add_participant(&call_id, UserId::from("alice"));
        assert_eq!(snapshots.borrow().session.as_ref().unwrap().participant_ids.len(), 2);

        assert_eq!(store.remove_participant(&call_id, &UserId::from("alice")), Some(0));
        assert_eq!(store.remove_participant(&call_id, &UserId::from("mallory")), None);
        assert_eq!(store.remove_participant(&CallId::from("other"), &UserId::from("alice")), None);
    }

    #[test]
    fn test_recent_ids_evict_oldest() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert(CallId::from("a")));
        assert!(!recent.insert(CallId::from("a")));
        recent.insert(CallId::from("b"));
        recent.insert(CallId::from("c"));
        assert!(!recent.contains(&CallId::from("a")));
        assert!(recent.contains(&CallId::from("b")));
    }

    #[test]
    fn test_finished_ids_are_bounded() {
        let store = CallSessionStore::new(UserId::from("bob"), Arc::new(NotificationBridge::new(8)), 2);
        for id in ["a", "b", "c"] {
            store.insert_invite(invite(id));
            store.resolve_invite(&CallId::from(id), InviteResolution::Expired);
        }
        assert!(!store.is_finished(&CallId::from("a")));
        assert!(store.is_finished(&CallId::from("c")));
    }
}
