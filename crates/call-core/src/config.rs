//! Client configuration
//!
//! [`CallConfig`] carries the local identity handed in by the auth layer plus
//! the timing and policy knobs of the call lifecycle. It can be built in code
//! with the `with_*` methods or deserialized from a config file:
//!
//! ```toml
//! ring_timeout_secs = 40
//! busy_policy = "auto_reject"
//!
//! [local_user]
//! id = "alice"
//! display_name = "Alice"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::call::UserId;
use crate::error::{CallError, CallResult};
use crate::recovery::RetryConfig;

/// Default time an unanswered call rings before it expires
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 40;

/// Longest ring timeout accepted by [`CallConfig::validate`]
pub const MAX_RING_TIMEOUT_SECS: u64 = 300;

/// Identity of the user running this client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl LocalUser {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// What to do with an inbound call request while a call is already live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Answer with `CALL_REJECTED` carrying reason `"busy"`
    #[default]
    AutoReject,
    /// Drop the request without answering; the caller's ring timer expires
    Ignore,
}

/// Configuration of one call client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub local_user: LocalUser,
    /// Seconds an outbound or inbound ring lasts before it expires
    pub ring_timeout_secs: u64,
    /// Seconds a media join may take before the call fails
    pub media_join_timeout_secs: u64,
    pub busy_policy: BusyPolicy,
    /// Attempts per outbound signal, the first one included
    pub signal_send_attempts: u32,
    /// Number of recent call ids remembered to drop redelivered requests
    pub dedup_window: usize,
    /// Buffer size of the event broadcast stream
    pub event_channel_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_user: LocalUser::new("anonymous"),
            ring_timeout_secs: DEFAULT_RING_TIMEOUT_SECS,
            media_join_timeout_secs: 15,
            busy_policy: BusyPolicy::AutoReject,
            signal_send_attempts: 2,
            dedup_window: 256,
            event_channel_capacity: 64,
        }
    }
}

impl CallConfig {
    /// Configuration with defaults for the given local user
    pub fn new(local_user: LocalUser) -> Self {
        Self {
            local_user,
            ..Self::default()
        }
    }

    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_media_join_timeout(mut self, timeout: Duration) -> Self {
        self.media_join_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_signal_send_attempts(mut self, attempts: u32) -> Self {
        self.signal_send_attempts = attempts;
        self
    }

    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn media_join_timeout(&self) -> Duration {
        Duration::from_secs(self.media_join_timeout_secs)
    }

    /// Retry policy for outbound signals
    pub fn signal_retry(&self) -> RetryConfig {
        RetryConfig::signal(self.signal_send_attempts)
    }

    /// Check the configuration before wiring a client with it
    pub fn validate(&self) -> CallResult<()> {
        if self.local_user.id.as_str().trim().is_empty() {
            return Err(CallError::invalid_configuration("local_user.id", "must not be empty"));
        }
        if self.ring_timeout_secs == 0 || self.ring_timeout_secs > MAX_RING_TIMEOUT_SECS {
            return Err(CallError::invalid_configuration(
                "ring_timeout_secs",
                format!("must be between 1 and {}", MAX_RING_TIMEOUT_SECS),
            ));
        }
        if self.media_join_timeout_secs == 0 {
            return Err(CallError::invalid_configuration("media_join_timeout_secs", "must be positive"));
        }
        // a failed signal is retried at most once
        if !(1..=2).contains(&self.signal_send_attempts) {
            return Err(CallError::invalid_configuration(
                "signal_send_attempts",
                "must be 1 or 2",
            ));
        }
        if self.dedup_window == 0 {
            return Err(CallError::invalid_configuration("dedup_window", "must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(CallError::invalid_configuration("event_channel_capacity", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CallConfig::new(LocalUser::new("alice").with_display_name("Alice"));
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_timeout(), Duration::from_secs(40));
        assert_eq!(config.signal_retry().max_attempts, 2);
        assert_eq!(config.busy_policy, BusyPolicy::AutoReject);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let base = CallConfig::new(LocalUser::new("alice"));
        assert!(base.clone().with_ring_timeout(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_ring_timeout(Duration::from_secs(600)).validate().is_err());
        assert!(base.clone().with_signal_send_attempts(0).validate().is_err());
        assert!(base.clone().with_signal_send_attempts(3).validate().is_err());
        assert!(base.clone().with_signal_send_attempts(1).validate().is_ok());
        assert!(base.clone().with_dedup_window(0).validate().is_err());
        assert!(CallConfig::new(LocalUser::new(" ")).validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: CallConfig = serde_json::from_str(
            r#"{"local_user":{"id":"bob"},"ring_timeout_secs":30,"busy_policy":"ignore"}"#,
        )
        .unwrap();
        assert_eq!(config.local_user.id, UserId::from("bob"));
        assert_eq!(config.ring_timeout_secs, 30);
        assert_eq!(config.busy_policy, BusyPolicy::Ignore);
        assert_eq!(config.media_join_timeout_secs, 15);
        assert!(config.validate().is_ok());
    }
}
