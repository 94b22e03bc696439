//! Error types for the call core
//!
//! Errors are grouped by how the lifecycle reacts to them:
//!
//! - **Signaling errors** - an outbound message could not be delivered. These
//!   are retried once and then reported as a dismissible notice; they never
//!   stop a call from progressing.
//! - **Media errors** - the media session could not be created or joined.
//!   Fatal to the call (it ends `Failed`) but not to the application.
//! - **State errors** - the operation does not fit the current call state.
//!   Illegal state-machine transitions are logged and ignored internally and
//!   are never returned from public operations.
//! - **Configuration errors** - invalid settings, fix before retrying.
//!
//! ```rust
//! use studylink_call_core::CallError;
//!
//! let err = CallError::signal_delivery("conv-1", "socket closed");
//! assert!(err.is_recoverable());
//! assert_eq!(err.category(), "signaling");
//! ```

use thiserror::Error;

use crate::call::{CallId, CallState, ConversationId};

/// Result type alias for call-core operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors produced by the call signaling core
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// An outbound signal could not be handed to the channel
    #[error("Signal delivery to {conversation_id} failed: {reason}")]
    SignalDelivery {
        conversation_id: ConversationId,
        reason: String,
    },

    /// The signal channel is closed and accepts no more traffic
    #[error("Signal channel closed")]
    ChannelClosed,

    /// A signal could not be encoded for the wire
    #[error("Signal encoding failed: {reason}")]
    Encoding { reason: String },

    /// The media gateway refused or failed the join
    #[error("Media join failed for call {call_id}: {reason}")]
    MediaJoin { call_id: CallId, reason: String },

    /// No invite or session is known for the call
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    /// A live session already exists, so a new one cannot start
    #[error("Call already active: {call_id}")]
    CallAlreadyActive { call_id: CallId },

    /// A requested state change is not in the transition table
    #[error("Illegal transition for call {call_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        call_id: CallId,
        from: CallState,
        to: CallState,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Operation timeout after {duration_ms}ms")]
    OperationTimeout { duration_ms: u64 },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl CallError {
    /// Create a signal delivery error
    pub fn signal_delivery(conversation_id: impl Into<ConversationId>, reason: impl Into<String>) -> Self {
        Self::SignalDelivery {
            conversation_id: conversation_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a media join error
    pub fn media_join(call_id: CallId, reason: impl Into<String>) -> Self {
        Self::MediaJoin {
            call_id,
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Check if retrying the failed operation can help
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::SignalDelivery { .. } | CallError::OperationTimeout { .. } => true,

            CallError::ChannelClosed
            | CallError::Encoding { .. }
            | CallError::InvalidConfiguration { .. }
            | CallError::IllegalTransition { .. } => false,

            _ => false,
        }
    }

    /// Check if the error is tied to a particular call's state
    pub fn is_call_error(&self) -> bool {
        matches!(
            self,
            CallError::CallNotFound { .. }
                | CallError::CallAlreadyActive { .. }
                | CallError::IllegalTransition { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            CallError::SignalDelivery { .. } | CallError::ChannelClosed | CallError::Encoding { .. } => {
                "signaling"
            }

            CallError::MediaJoin { .. } => "media",

            CallError::CallNotFound { .. }
            | CallError::CallAlreadyActive { .. }
            | CallError::IllegalTransition { .. } => "call",

            CallError::InvalidConfiguration { .. } => "configuration",

            CallError::OperationTimeout { .. } | CallError::InternalError { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Encoding {
            reason: err.to_string(),
        }
    }
}
