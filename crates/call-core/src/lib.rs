//! # StudyLink Call Core
//!
//! Call invitation signaling and session lifecycle control for one-to-one
//! calls between members of a conversation.
//!
//! Call control rides on an existing pub/sub conversation channel: the four
//! call-control messages (`CALL_REQUEST`, `CALL_ACCEPTED`, `CALL_REJECTED`,
//! `USER_LEFT`) are sent as tagged strings alongside ordinary conversation
//! traffic. Once a call is accepted both ends join a media session through a
//! [`MediaSessionGateway`].
//!
//! This crate provides:
//! - The wire codec for call-control messages ([`signal::codec`])
//! - A single-session store with an explicit call state machine ([`store`])
//! - The lifecycle controller: initiate, accept, reject, dismiss, leave ([`controller`])
//! - Inbound signal handling with dedup and loopback filtering ([`listener`])
//! - Event fan-out and current-state snapshots for UI layers ([`events`])
//! - A builder that wires it all per user ([`client`])
//!
//! ## Architecture
//!
//! The signal channel and the media service are collaborators behind traits
//! ([`SignalChannel`], [`MediaSessionGateway`]). In-process implementations
//! ([`SignalHub`], [`LoopbackMediaGateway`]) back the tests and the demo CLI.

pub mod call;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod listener;
pub mod media;
pub mod recovery;
pub mod signal;
pub mod store;

pub use call::{CallId, CallInvite, CallRole, CallSession, CallState, ConversationId, InviteState, UserId};
pub use client::{CallClient, CallClientBuilder};
pub use config::{BusyPolicy, CallConfig, LocalUser};
pub use controller::CallLifecycleController;
pub use error::{CallError, CallResult};
pub use events::{
    CallEvent, CallEventHandler, CallSnapshot, CallStatusInfo, EventFilter, EventPriority, EventSubscription,
    InviteResolution, NotificationBridge,
};
pub use listener::{InviteListener, ListenerHandle};
pub use media::{LoopbackMediaGateway, MediaParticipant, MediaSessionGateway, SessionHandle};
pub use signal::{
    CallRequest, CallResponse, HubChannel, InboundSignal, SignalChannel, SignalHub, SignalKind, SignalMessage,
    Subscription,
};
pub use store::CallSessionStore;
