//! Channel timing and policy knobs, loaded from the environment.
//!
//! Every value has a default matching the browser host it models: a 90 s
//! listener lifetime, a 1 s drain bound, and a 5 s connect bound.

use std::time::Duration;

const DEFAULT_LIFETIME_SECS: u64 = 90;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REFRESH_DELAY_MS: u64 = 100;

// =============================================================================
// HOST
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// How long one listener generation lives before the router rotates it.
    pub lifetime: Duration,
    /// Upper bound on waiting for in-flight handlers during rotation.
    pub drain_timeout: Duration,
    /// Answer a REQUEST for an unregistered type with an error RESPONSE
    /// instead of dropping it.
    pub reject_unknown_types: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(DEFAULT_LIFETIME_SECS),
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            reject_unknown_types: false,
        }
    }
}

impl HostConfig {
    /// - `COMMS_HOST_LIFETIME_SECS`
    /// - `COMMS_DRAIN_TIMEOUT_MS`
    /// - `COMMS_REJECT_UNKNOWN_TYPES`
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            lifetime: Duration::from_secs(env_parse("COMMS_HOST_LIFETIME_SECS", DEFAULT_LIFETIME_SECS)),
            drain_timeout: Duration::from_millis(env_parse("COMMS_DRAIN_TIMEOUT_MS", DEFAULT_DRAIN_TIMEOUT_MS)),
            reject_unknown_types: env_parse("COMMS_REJECT_UNKNOWN_TYPES", false),
        }
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    #[must_use]
    pub fn with_reject_unknown_types(mut self, reject: bool) -> Self {
        self.reject_unknown_types = reject;
        self
    }
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Bound on waiting for the host's handshake `ack`.
    pub connect_timeout: Duration,
    /// Pause between a `refresh` and the transparent reconnect.
    pub refresh_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            refresh_delay: Duration::from_millis(DEFAULT_REFRESH_DELAY_MS),
        }
    }
}

impl ClientConfig {
    /// - `COMMS_CONNECT_TIMEOUT_MS`
    /// - `COMMS_REFRESH_DELAY_MS`
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_millis(env_parse("COMMS_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)),
            refresh_delay: Duration::from_millis(env_parse("COMMS_REFRESH_DELAY_MS", DEFAULT_REFRESH_DELAY_MS)),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub fn with_refresh_delay(mut self, refresh_delay: Duration) -> Self {
        self.refresh_delay = refresh_delay;
        self
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
