//! Lock-layer configuration.

use std::str::FromStr;
use std::time::Duration;

use fsqlite_error::FrankenError;
use tracing::warn;

/// Environment variable selecting the shared-lock strategy.
pub const LOCK_STRATEGY_ENV: &str = "FSQLITE_LOCK_STRATEGY";

/// How the SHARED level is represented on the shared lock range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockStrategyKind {
    /// A shared lock over the whole `SHARED_FIRST..SHARED_SIZE` span.
    #[default]
    FullRange,
    /// An exclusive lock on one randomly chosen byte of the span, for
    /// environments that deny shared range locks.
    SingleByte,
}

impl LockStrategyKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullRange => "full-range",
            Self::SingleByte => "single-byte",
        }
    }
}

impl FromStr for LockStrategyKind {
    type Err = FrankenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full-range" | "full" => Ok(Self::FullRange),
            "single-byte" | "byte" => Ok(Self::SingleByte),
            other => Err(FrankenError::OutOfRange {
                what: "lock strategy".to_owned(),
                value: other.to_owned(),
            }),
        }
    }
}

/// Bounded retry schedule: `attempts` tries separated by `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Schedule for the PENDING byte: another connection may hold it
    /// momentarily while it acquires SHARED.
    pub const PENDING: Self = Self::new(3, Duration::from_millis(1));

    #[must_use]
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// `attempts` tries with no delay in between.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::PENDING
    }
}

/// Configuration for a [`FileLockState`](crate::FileLockState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockConfig {
    pub strategy: LockStrategyKind,
    pub pending_retry: RetryPolicy,
}

impl LockConfig {
    #[must_use]
    pub const fn new(strategy: LockStrategyKind, pending_retry: RetryPolicy) -> Self {
        Self {
            strategy,
            pending_retry,
        }
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: LockStrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_pending_retry(mut self, pending_retry: RetryPolicy) -> Self {
        self.pending_retry = pending_retry;
        self
    }

    /// Defaults, with the strategy overridden by `FSQLITE_LOCK_STRATEGY`.
    ///
    /// An unparseable value keeps the default strategy.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(LOCK_STRATEGY_ENV) {
            match raw.parse::<LockStrategyKind>() {
                Ok(strategy) => config.strategy = strategy,
                Err(err) => warn!(
                    target: "fsqlite_vfs::config",
                    value = %raw,
                    error = %err,
                    "ignoring invalid lock strategy"
                ),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.strategy, LockStrategyKind::FullRange);
        assert_eq!(config.pending_retry.attempts, 3);
        assert_eq!(config.pending_retry.delay, Duration::from_millis(1));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "full-range".parse::<LockStrategyKind>().unwrap(),
            LockStrategyKind::FullRange
        );
        assert_eq!(
            " Single-Byte ".parse::<LockStrategyKind>().unwrap(),
            LockStrategyKind::SingleByte
        );
        assert_eq!(
            "byte".parse::<LockStrategyKind>().unwrap(),
            LockStrategyKind::SingleByte
        );
        assert!("mandatory".parse::<LockStrategyKind>().is_err());
    }

    #[test]
    fn test_builder() {
        let config = LockConfig::default()
            .with_strategy(LockStrategyKind::SingleByte)
            .with_pending_retry(RetryPolicy::immediate(5));
        assert_eq!(config.strategy, LockStrategyKind::SingleByte);
        assert_eq!(config.pending_retry, RetryPolicy::new(5, Duration::ZERO));
    }
}
