//! Call-control signaling carried over a generic conversation channel
//!
//! - [`SignalMessage`] - the typed call-control protocol
//! - [`codec`] - the `"<TYPE>:<json>"` wire format
//! - [`channel`] - the transport seam and subscription disposer
//! - [`hub`] - in-memory transport for the demo and tests

pub mod channel;
pub mod codec;
pub mod hub;

use serde::{Deserialize, Serialize};

use crate::call::{CallId, UserId};

pub use channel::{InboundSignal, SignalChannel, SignalHandler, Subscription};
pub use codec::{decode, encode};
pub use hub::{HubChannel, SignalHub};

/// Unix timestamp in milliseconds, the unit used on the wire
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Payload of a `CALL_REQUEST`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub call_id: CallId,
    pub caller_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    pub timestamp: i64,
}

/// Payload shared by `CALL_ACCEPTED`, `CALL_REJECTED` and `USER_LEFT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub call_id: CallId,
    pub user_id: UserId,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CallResponse {
    pub fn new(call_id: CallId, user_id: UserId) -> Self {
        Self {
            call_id,
            user_id,
            timestamp: now_millis(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A decoded call-control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    CallRequest(CallRequest),
    CallAccepted(CallResponse),
    CallRejected(CallResponse),
    UserLeft(CallResponse),
}

/// Wire tag of a [`SignalMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallRequest,
    CallAccepted,
    CallRejected,
    UserLeft,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::CallRequest,
        SignalKind::CallAccepted,
        SignalKind::CallRejected,
        SignalKind::UserLeft,
    ];

    /// Prefix used on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            SignalKind::CallRequest => "CALL_REQUEST",
            SignalKind::CallAccepted => "CALL_ACCEPTED",
            SignalKind::CallRejected => "CALL_REJECTED",
            SignalKind::UserLeft => "USER_LEFT",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::CallRequest(_) => SignalKind::CallRequest,
            SignalMessage::CallAccepted(_) => SignalKind::CallAccepted,
            SignalMessage::CallRejected(_) => SignalKind::CallRejected,
            SignalMessage::UserLeft(_) => SignalKind::UserLeft,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            SignalMessage::CallRequest(req) => &req.call_id,
            SignalMessage::CallAccepted(resp)
            | SignalMessage::CallRejected(resp)
            | SignalMessage::UserLeft(resp) => &resp.call_id,
        }
    }

    /// The user who authored the message
    pub fn sender(&self) -> &UserId {
        match self {
            SignalMessage::CallRequest(req) => &req.caller_id,
            SignalMessage::CallAccepted(resp)
            | SignalMessage::CallRejected(resp)
            | SignalMessage::UserLeft(resp) => &resp.user_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SignalMessage::CallRequest(req) => req.timestamp,
            SignalMessage::CallAccepted(resp)
            | SignalMessage::CallRejected(resp)
            | SignalMessage::UserLeft(resp) => resp.timestamp,
        }
    }
}
