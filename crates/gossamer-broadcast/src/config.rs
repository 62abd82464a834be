//! Broadcast node configuration.
//!
//! Read from the environment at startup:
//!
//! | Variable | Default |
//! |---|---|
//! | `GOSSAMER_GOSSIP_INTERVAL_MS` | 100 |
//! | `GOSSAMER_FANOUT` | 5 |
//! | `GOSSAMER_EAGER` | true |
//! | `GOSSAMER_RETRY_BACKOFF_MS` | 50 |
//! | `GOSSAMER_MAX_RETRY_BACKOFF_MS` | 2000 |

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default period between gossip rounds.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of peers sampled per round.
pub const DEFAULT_FANOUT: usize = 5;

/// Tuning for the gossiper and the broadcast handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Period between anti-entropy rounds.
    pub gossip_interval: Duration,
    /// Peers sampled (with replacement) per round.
    pub fanout: usize,
    /// Forward newly learned values to neighbors immediately.
    pub eager_fanout: bool,
    /// First delay before retrying a failed gossip send.
    pub retry_backoff: Duration,
    /// Ceiling for the exponential retry delay.
    pub max_retry_backoff: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            fanout: DEFAULT_FANOUT,
            eager_fanout: true,
            retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_millis(2000),
        }
    }
}

impl BroadcastConfig {
    /// Create config from environment variables, falling back to defaults for
    /// unset variables. Set-but-invalid values are errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            gossip_interval: env_millis("GOSSAMER_GOSSIP_INTERVAL_MS")?
                .unwrap_or(defaults.gossip_interval),
            fanout: env_parse("GOSSAMER_FANOUT")?.unwrap_or(defaults.fanout),
            eager_fanout: env_parse("GOSSAMER_EAGER")?.unwrap_or(defaults.eager_fanout),
            retry_backoff: env_millis("GOSSAMER_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.retry_backoff),
            max_retry_backoff: env_millis("GOSSAMER_MAX_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.max_retry_backoff),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the gossip interval.
    #[must_use]
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the per-round fanout.
    #[must_use]
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Enable or disable eager forwarding of new values.
    #[must_use]
    pub fn with_eager_fanout(mut self, eager: bool) -> Self {
        self.eager_fanout = eager;
        self
    }

    /// Set the retry backoff range.
    #[must_use]
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max;
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.gossip_interval.is_zero() {
            return Err(Error::Config("gossip interval must be positive".to_string()));
        }
        if self.retry_backoff.is_zero() {
            return Err(Error::Config("retry backoff must be positive".to_string()));
        }
        if self.max_retry_backoff < self.retry_backoff {
            return Err(Error::Config(format!(
                "max retry backoff {:?} is below initial backoff {:?}",
                self.max_retry_backoff, self.retry_backoff
            )));
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
