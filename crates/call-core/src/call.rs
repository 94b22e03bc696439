//! Call identifiers, invites, sessions and the session state machine
//!
//! A client holds at most one [`CallInvite`] (an inbound request nobody has
//! answered yet) and one [`CallSession`] (a call this client initiated or
//! accepted). Sessions move through [`CallState`] strictly forward:
//!
//! ```text
//!            initiate            accept/reject/timeout
//!   Idle ──────────────► RingingOut ──┬──► Accepted ──► Connecting ──┬──► Connected
//!     │                               ├──► Rejected                  └──► Failed
//!     └──► RingingIn ─────────────────┼──► Expired
//!         (inbound)                   │
//!   any non-terminal state ───────────┴──────────────────────────────────► Ended
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media::SessionHandle;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque identifier shared by both ends of one call
    CallId
);
string_id!(
    /// Identifier of a platform user, handed in by the auth layer
    UserId
);
string_id!(
    /// Identifier of the conversation a call rides on
    ConversationId
);

impl CallId {
    /// Generate a fresh call identifier
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Lifecycle state of a [`CallSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    /// Local client rang the peer and waits for an answer
    RingingOut,
    /// Inbound request is being answered locally
    RingingIn,
    Accepted,
    /// Media join is in flight
    Connecting,
    Connected,
    Rejected,
    /// Nobody answered before the ring timer fired
    Expired,
    /// Media join failed after the call was accepted
    Failed,
    Ended,
}

impl CallState {
    /// Terminal states end the session; nothing leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Rejected | CallState::Expired | CallState::Failed
        )
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, CallState::RingingOut | CallState::RingingIn)
    }

    /// Whether the transition table allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (Idle, RingingOut) | (Idle, RingingIn) => true,
            (RingingOut | RingingIn, Accepted | Rejected | Expired) => true,
            (Accepted, Connecting) => true,
            (Connecting, Connected | Failed) => true,
            (_, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of an inbound invite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InviteState {
    Pending,
    Accepted,
    Rejected,
    Expired,
    /// Dropped locally without answering the caller
    Dismissed,
}

/// Record of a not-yet-answered inbound call request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInvite {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub caller_display_name: Option<String>,
    /// Conversation the request arrived on; answers go back there
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub state: InviteState,
}

impl CallInvite {
    pub fn new(
        call_id: CallId,
        caller_id: UserId,
        caller_display_name: Option<String>,
        conversation_id: ConversationId,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            caller_display_name,
            conversation_id,
            created_at: Utc::now(),
            state: InviteState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == InviteState::Pending
    }
}

/// Which side of the call the local client is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallRole {
    Caller,
    Callee,
}

/// A call this client initiated or accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub participant_ids: BTreeSet<UserId>,
    pub local_role: CallRole,
    pub state: CallState,
    /// Set only once the media gateway accepted the join
    pub media_handle: Option<SessionHandle>,
    pub accept_sent: bool,
    pub leave_sent: bool,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a session in `Idle` with the local user as the only participant
    pub fn new(
        call_id: CallId,
        conversation_id: ConversationId,
        local_user: UserId,
        local_role: CallRole,
    ) -> Self {
        let mut participant_ids = BTreeSet::new();
        participant_ids.insert(local_user);

        Self {
            call_id,
            conversation_id,
            participant_ids,
            local_role,
            state: CallState::Idle,
            media_handle: None,
            accept_sent: false,
            leave_sent: false,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Participants other than `local_user`
    pub fn remote_participants<'a>(&'a self, local_user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participant_ids.iter().filter(move |id| *id != local_user)
    }

    /// Time spent connected, if the call ever connected
    pub fn connected_duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|at| Utc::now() - at)
    }
}
