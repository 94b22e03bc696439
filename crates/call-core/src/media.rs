//! Media session gateway seam
//!
//! Audio/video transport is owned by an independent real-time media service.
//! The call core only needs two operations from it: join (creating the room
//! if needed) and leave. [`LoopbackMediaGateway`] is an in-process
//! implementation used by the demo binary and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::call::{CallId, UserId};
use crate::error::{CallError, CallResult};

/// Opaque reference to a joined media session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Media room the handle belongs to
    pub session_id: String,
    /// Gateway-assigned token for this participant's membership
    pub token: String,
}

/// Who is joining the media session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParticipant {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

/// Real-time media service used once a call is accepted
#[async_trait]
pub trait MediaSessionGateway: Send + Sync {
    /// Create the session if it does not exist yet and join it
    async fn create_or_join(
        &self,
        session_id: &str,
        participant: &MediaParticipant,
    ) -> CallResult<SessionHandle>;

    /// Leave a joined session. Calling this twice for one handle is harmless.
    async fn leave(&self, handle: &SessionHandle);
}

/// Media session id used for a call; both ends derive the same room
pub fn media_session_id(call_id: &CallId) -> String {
    format!("call-{}", call_id)
}

/// In-process media gateway that tracks room membership
#[derive(Debug, Default)]
pub struct LoopbackMediaGateway {
    rooms: DashMap<String, Vec<(String, UserId)>>,
    fail_joins: AtomicBool,
    next_token: AtomicU64,
    leaves: AtomicU64,
}

impl LoopbackMediaGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following join fail, e.g. to exercise the `Failed` path
    pub fn set_fail_joins(&self, fail: bool) {
        self.fail_joins.store(fail, Ordering::SeqCst);
    }

    /// Members currently in a room
    pub fn members(&self, session_id: &str) -> Vec<UserId> {
        self.rooms
            .get(session_id)
            .map(|room| room.iter().map(|(_, user)| user.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of leave calls that actually removed a member
    pub fn leave_count(&self) -> u64 {
        self.leaves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSessionGateway for LoopbackMediaGateway {
    async fn create_or_join(
        &self,
        session_id: &str,
        participant: &MediaParticipant,
    ) -> CallResult<SessionHandle> {
        if self.fail_joins.load(Ordering::SeqCst) {
            return Err(CallError::media_join(
                CallId::from(session_id.trim_start_matches("call-")),
                "media service unavailable",
            ));
        }

        let token = format!("tok-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        self.rooms
            .entry(session_id.to_string())
            .or_default()
            .push((token.clone(), participant.user_id.clone()));

        info!(session_id, user_id = %participant.user_id, "Joined loopback media session");
        Ok(SessionHandle {
            session_id: session_id.to_string(),
            token,
        })
    }

    async fn leave(&self, handle: &SessionHandle) {
        let removed = match self.rooms.get_mut(&handle.session_id) {
            Some(mut room) => {
                let before = room.len();
                room.retain(|(token, _)| token != &handle.token);
                before != room.len()
            }
            None => false,
        };

        if removed {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            self.rooms.remove_if(&handle.session_id, |_, room| room.is_empty());
            info!(session_id = %handle.session_id, "Left loopback media session");
        } else {
            debug!(session_id = %handle.session_id, "Leave for unknown handle ignored");
        }
    }
}
