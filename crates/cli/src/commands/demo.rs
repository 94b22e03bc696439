//! Demo command - two in-process clients walk through a call

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::ValueEnum;
use studylink_call_core::{
    BusyPolicy, CallClient, CallClientBuilder, CallConfig, CallEvent, CallEventHandler, CallId, CallState, ConversationId,
    EventFilter, LocalUser, LoopbackMediaGateway, SignalHub, UserId,
};
use tracing::{info, warn};

/// Which call flow to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Bob accepts, both join media, Alice hangs up
    Accept,
    /// Bob declines
    Reject,
    /// Bob never answers and the ring timer runs out
    Ignore,
    /// Bob accepts but cannot join the media session
    MediaFailure,
    /// The channel delivers every message three times
    Redelivery,
    /// Carol calls Bob while he is on a call
    Busy,
}

const CONVERSATION: &str = "study-group";
const WAIT: Duration = Duration::from_secs(10);

/// Logs every event a client sees
struct EventLogger {
    user: UserId,
}

#[async_trait]
impl CallEventHandler for EventLogger {
    async fn on_call_event(&self, event: CallEvent) {
        match &event {
            CallEvent::IncomingInvite { invite, .. } => {
                info!(user = %self.user, call_id = %invite.call_id, caller = %invite.caller_id, "📞 Incoming call")
            }
            CallEvent::InviteResolved { call_id, resolution, .. } => {
                info!(user = %self.user, %call_id, ?resolution, "Invite resolved")
            }
            CallEvent::CallStateChanged { info, .. } => {
                info!(user = %self.user, call_id = %info.call_id, from = %info.previous_state, to = %info.new_state, "Call state")
            }
            other => warn!(user = %self.user, event = ?other, "Notice"),
        }
    }
}

async fn client(hub: &Arc<SignalHub>, base: &CallConfig, user: &str, media: Arc<LoopbackMediaGateway>) -> Result<Arc<CallClient>> {
    let mut config = base.clone();
    config.local_user = LocalUser::new(user).with_display_name(capitalize(user));

    let client = CallClientBuilder::new()
        .config(config)
        .signal_channel(hub.connect(user))
        .media_gateway(media)
        .build()
        .await
        .with_context(|| format!("building client for {}", user))?;
    client.start()?;
    Ok(client)
}

fn capitalize(user: &str) -> String {
    let mut chars = user.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

async fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) -> Result<()> {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {}", what))
}

fn state_of(client: &CallClient) -> Option<CallState> {
    client.active_session().map(|s| s.state)
}

/// Alice calls the group and waits for Bob's phone to ring
async fn ring(alice: &CallClient, bob: &CallClient) -> Result<CallId> {
    let call_id = alice.initiate(ConversationId::from(CONVERSATION)).await?;
    wait_for("bob's invite", WAIT, || bob.pending_invite().is_some()).await?;
    Ok(call_id)
}

/// Keep a connected call up for `hold`, or until Ctrl+C
async fn hold_call(hold: Duration) {
    info!("🔄 Call active for {}s (Ctrl+C to hang up early)", hold.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = tokio::signal::ctrl_c() => info!("Hanging up on Ctrl+C"),
    }
}

/// Execute demo command
pub async fn execute(scenario: Scenario, config: CallConfig, hold: Duration) -> Result<()> {
    info!(?scenario, ring_timeout_secs = config.ring_timeout_secs, "Starting demo");

    let hub = SignalHub::new();
    let members: Vec<UserId> = ["alice", "bob", "carol"].into_iter().map(UserId::from).collect();
    hub.add_conversation(CONVERSATION, &members[..2]);
    hub.add_conversation("bob-carol", &members[1..]);
    if scenario == Scenario::Redelivery {
        hub.set_redelivery(2);
    }

    let alice_media = LoopbackMediaGateway::new();
    let bob_media = LoopbackMediaGateway::new();
    let alice = client(&hub, &config, "alice", alice_media.clone()).await?;
    let bob = client(&hub, &config, "bob", bob_media.clone()).await?;
    let _alice_events = alice.subscribe(Arc::new(EventLogger { user: members[0].clone() }), EventFilter::default());
    let _bob_events = bob.subscribe(Arc::new(EventLogger { user: members[1].clone() }), EventFilter::default());

    let call_id = ring(&alice, &bob).await?;

    match scenario {
        Scenario::Accept | Scenario::Redelivery => {
            bob.accept(&call_id).await?;
            wait_for("alice connected", WAIT, || state_of(&alice) == Some(CallState::Connected)).await?;
            info!("✅ Call connected");
            hold_call(hold).await;
            alice.leave(&call_id).await?;
            wait_for("bob hung up", WAIT, || bob.active_session().is_none()).await?;
        }
        Scenario::Reject => {
            bob.reject(&call_id).await?;
            wait_for("alice rejected", WAIT, || alice.active_session().is_none()).await?;
        }
        Scenario::Ignore => {
            let timeout = config.ring_timeout() + Duration::from_secs(1);
            info!("⏳ Bob ignores the call, ringing out in {}s", config.ring_timeout_secs);
            wait_for("ring timeout", timeout, || {
                alice.active_session().is_none() && bob.pending_invite().is_none()
            })
            .await?;
        }
        Scenario::MediaFailure => {
            bob_media.set_fail_joins(true);
            match bob.accept(&call_id).await {
                Ok(()) => bail!("media join was expected to fail"),
                Err(e) => warn!(error = %e, "Bob could not join the media session"),
            }
            wait_for("alice ended", WAIT, || alice.active_session().is_none()).await?;
        }
        Scenario::Busy => {
            bob.accept(&call_id).await?;
            wait_for("alice connected", WAIT, || state_of(&alice) == Some(CallState::Connected)).await?;

            let carol = client(&hub, &config, "carol", LoopbackMediaGateway::new()).await?;
            let _carol_events =
                carol.subscribe(Arc::new(EventLogger { user: members[2].clone() }), EventFilter::default());
            let carol_call = carol.initiate(ConversationId::from("bob-carol")).await?;
            match config.busy_policy {
                BusyPolicy::AutoReject => {
                    wait_for("carol turned away", WAIT, || carol.active_session().is_none()).await?;
                }
                BusyPolicy::Ignore => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    info!("Bob stays silent, Carol gives up");
                    carol.leave(&carol_call).await?;
                }
            }
            carol.shutdown().await;

            alice.leave(&call_id).await?;
            wait_for("bob hung up", WAIT, || bob.active_session().is_none()).await?;
        }
    }

    alice.shutdown().await;
    bob.shutdown().await;
    // let the dispatchers flush the last events
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("Wire log:");
    for (sender, conversation, text) in hub.sent_messages() {
        println!("  {:<6} {:<12} {}", sender.as_str(), conversation.as_str(), text);
    }
    Ok(())
}
