//! Tagged-string wire format
//!
//! Every call-control message travels as `"<TYPE>:<json>"`, for example
//! `CALL_ACCEPTED:{"callId":"c1","userId":"bob","timestamp":1700000000000}`.
//! The channel also carries ordinary chat text, so anything that does not
//! parse is simply not a signal: [`decode`] returns `None` instead of failing.
//!
//! ```rust
//! use studylink_call_core::signal::{codec, CallResponse, SignalMessage};
//!
//! let msg = SignalMessage::UserLeft(CallResponse::new("c1".into(), "bob".into()));
//! let wire = codec::encode(&msg).unwrap();
//! assert!(wire.starts_with("USER_LEFT:{"));
//! assert_eq!(codec::decode(&wire), Some(msg));
//! assert_eq!(codec::decode("see you at the library: 5pm"), None);
//! ```

use tracing::trace;

use super::{CallRequest, CallResponse, SignalKind, SignalMessage};
use crate::error::CallResult;

/// Encode a message for the wire
pub fn encode(message: &SignalMessage) -> CallResult<String> {
    let json = match message {
        SignalMessage::CallRequest(req) => serde_json::to_string(req)?,
        SignalMessage::CallAccepted(resp)
        | SignalMessage::CallRejected(resp)
        | SignalMessage::UserLeft(resp) => serde_json::to_string(resp)?,
    };
    Ok(format!("{}:{}", message.kind().tag(), json))
}

/// Decode a wire string, returning `None` for anything that is not a signal
pub fn decode(text: &str) -> Option<SignalMessage> {
    let (tag, payload) = text.trim().split_once(':')?;
    let Some(kind) = SignalKind::from_tag(tag) else {
        trace!(tag, "Not a call signal");
        return None;
    };

    let decoded = match kind {
        SignalKind::CallRequest => {
            serde_json::from_str::<CallRequest>(payload).map(SignalMessage::CallRequest)
        }
        SignalKind::CallAccepted => {
            serde_json::from_str::<CallResponse>(payload).map(SignalMessage::CallAccepted)
        }
        SignalKind::CallRejected => {
            serde_json::from_str::<CallResponse>(payload).map(SignalMessage::CallRejected)
        }
        SignalKind::UserLeft => serde_json::from_str::<CallResponse>(payload).map(SignalMessage::UserLeft),
    };

    match decoded {
        Ok(message) => Some(message),
        Err(e) => {
            trace!(%kind, error = %e, "Malformed call signal payload");
            None
        }
    }
}
