//! Runtime configuration for the negotiation core.
//!
//! [`NegotiationConfig`] is a plain struct: construct it directly, start from
//! [`Default`], chain the `with_*` builders, or overlay `RENTNEGO_*`
//! environment variables with [`NegotiationConfig::from_env`]. No config-file
//! format is imposed on embedding applications.
//!
//! # Example
//!
//! ```rust
//! use rentnego::NegotiationConfig;
//! use std::time::Duration;
//!
//! let config = NegotiationConfig::default()
//!     .with_max_turns(12)
//!     .with_responder_timeout(Duration::from_secs(20));
//!
//! assert_eq!(config.max_turns, 12);
//! assert_eq!(config.subscriber_buffer, 256);
//! ```

use crate::negotiation::model::Role;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default turn budget before a session ends with `max_turns`.
pub const DEFAULT_MAX_TURNS: u32 = 30;

/// Default number of responder attempts per turn.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default per-subscriber frame buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Default number of trailing messages captured in each snapshot.
pub const DEFAULT_CHECKPOINT_WINDOW: usize = 10;

/// Tunables shared by the service, the turn controllers, and the transport hub.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Turn budget; reaching it ends the session with `max_turns`.
    pub max_turns: u32,

    /// Responder attempts per turn before the session is cancelled with
    /// `agent_failure`.
    pub max_attempts: u32,

    /// Delay before the second attempt; doubled for every further attempt.
    pub retry_backoff: Duration,

    /// Upper bound for a single responder attempt, streaming included.
    pub responder_timeout: Duration,

    /// Frames a subscriber may fall behind before it is disconnected.
    pub subscriber_buffer: usize,

    /// Capacity of the bounded chunk channel between a streaming responder
    /// and the controller.
    pub chunk_channel_capacity: usize,

    /// Trailing messages stored in each snapshot (K).
    pub checkpoint_window: usize,

    /// Attempts for each durable checkpoint write.
    pub checkpoint_retries: u32,

    /// Role that opens the negotiation.
    pub first_speaker: Role,

    /// When `true`, [`NegotiationService::resume`](crate::NegotiationService::resume)
    /// restarts the turn loop automatically.
    pub auto_advance: bool,

    /// Directory for [`JsonlCheckpointStore`](crate::JsonlCheckpointStore), if used.
    pub checkpoint_dir: PathBuf,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(500),
            responder_timeout: Duration::from_secs(60),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            chunk_channel_capacity: 64,
            checkpoint_window: DEFAULT_CHECKPOINT_WINDOW,
            checkpoint_retries: 3,
            first_speaker: Role::Landlord,
            auto_advance: true,
            checkpoint_dir: PathBuf::from("negotiation_checkpoints"),
        }
    }
}

impl NegotiationConfig {
    /// Defaults overlaid with `RENTNEGO_*` environment variables.
    ///
    /// Recognised variables: `RENTNEGO_MAX_TURNS`, `RENTNEGO_MAX_ATTEMPTS`,
    /// `RENTNEGO_RETRY_BACKOFF_MS`, `RENTNEGO_RESPONDER_TIMEOUT_MS`,
    /// `RENTNEGO_SUBSCRIBER_BUFFER`, `RENTNEGO_CHECKPOINT_WINDOW`,
    /// `RENTNEGO_FIRST_SPEAKER` (`tenant` | `landlord`),
    /// `RENTNEGO_CHECKPOINT_DIR`. Unparseable values are logged and skipped.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<u32>("RENTNEGO_MAX_TURNS") {
            config.max_turns = v;
        }
        if let Some(v) = env_parse::<u32>("RENTNEGO_MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("RENTNEGO_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("RENTNEGO_RESPONDER_TIMEOUT_MS") {
            config.responder_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("RENTNEGO_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = v;
        }
        if let Some(v) = env_parse::<usize>("RENTNEGO_CHECKPOINT_WINDOW") {
            config.checkpoint_window = v;
        }
        if let Ok(v) = std::env::var("RENTNEGO_FIRST_SPEAKER") {
            match v.trim().to_ascii_lowercase().as_str() {
                "tenant" => config.first_speaker = Role::Tenant,
                "landlord" => config.first_speaker = Role::Landlord,
                other => log::warn!("Ignoring RENTNEGO_FIRST_SPEAKER={}", other),
            }
        }
        if let Ok(v) = std::env::var("RENTNEGO_CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(v);
        }
        config.sanitized()
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self.sanitized()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self.sanitized()
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_responder_timeout(mut self, timeout: Duration) -> Self {
        self.responder_timeout = timeout;
        self
    }

    pub fn with_subscriber_buffer(mut self, frames: usize) -> Self {
        self.subscriber_buffer = frames;
        self.sanitized()
    }

    pub fn with_checkpoint_window(mut self, messages: usize) -> Self {
        self.checkpoint_window = messages;
        self
    }

    pub fn with_first_speaker(mut self, role: Role) -> Self {
        self.first_speaker = role;
        self
    }

    pub fn with_auto_advance(mut self, auto_advance: bool) -> Self {
        self.auto_advance = auto_advance;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Backoff before attempt `attempt` (1-based; attempt 1 never waits).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.retry_backoff.saturating_mul(factor)
    }

    // Zero-sized buffers and budgets would deadlock or end sessions before
    // the first turn.
    fn sanitized(mut self) -> Self {
        self.max_turns = self.max_turns.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.subscriber_buffer = self.subscriber_buffer.max(1);
        self.chunk_channel_capacity = self.chunk_channel_capacity.max(1);
        self.checkpoint_retries = self.checkpoint_retries.max(1);
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparseable {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let config = NegotiationConfig::default().with_retry_backoff(Duration::from_millis(10));
        assert_eq!(config.backoff_for(1), Duration::ZERO);
        assert_eq!(config.backoff_for(2), Duration::from_millis(10));
        assert_eq!(config.backoff_for(3), Duration::from_millis(20));
        assert_eq!(config.backoff_for(4), Duration::from_millis(40));
    }

    #[test]
    fn test_zero_budgets_are_clamped() {
        let config = NegotiationConfig::default()
            .with_max_turns(0)
            .with_subscriber_buffer(0);
        assert_eq!(config.max_turns, 1);
        assert_eq!(config.subscriber_buffer, 1);
    }
}
