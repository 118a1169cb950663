//! Admission policies.
//!
//! The two strategies are explicit variants of one tagged union, decided at
//! configuration time. Nothing downstream ever infers the strategy from which
//! fields happen to be present.

use std::time::Duration;

use crate::error::ConfigError;

/// Default window matching the common "per minute" deployment shape.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default hit budget per window.
pub const DEFAULT_MAX: u64 = 5;

/// An immutable admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Policy {
    /// Count hits per key and reset the counter on a wall-clock cadence.
    FixedWindow {
        /// Window duration.
        window: Duration,
        /// Hits admitted per window. Zero means unlimited.
        max: u64,
        /// Units consumed per request.
        cost: u64,
    },
    /// GCRA token-bucket smoothing: `rate` tokens regenerate per `period`,
    /// with up to `burst` tokens available instantaneously.
    Gcra {
        /// Maximum tokens available at once.
        burst: u64,
        /// Tokens regenerated per `period`.
        rate: u64,
        /// Regeneration period.
        period: Duration,
        /// Tokens consumed per request.
        cost: u64,
    },
}

impl Policy {
    /// Fixed-window policy with a cost of 1.
    pub fn fixed_window(window: Duration, max: u64) -> Self {
        Self::FixedWindow { window, max, cost: 1 }
    }

    /// GCRA policy with a cost of 1.
    pub fn gcra(burst: u64, rate: u64, period: Duration) -> Self {
        Self::Gcra { burst, rate, period, cost: 1 }
    }

    /// Override the units consumed per request.
    pub fn with_cost(mut self, new_cost: u64) -> Self {
        match &mut self {
            Self::FixedWindow { cost, .. } | Self::Gcra { cost, .. } => *cost = new_cost,
        }
        self
    }

    /// Validate the policy parameters.
    ///
    /// Called by [`Limiter`](crate::Limiter) construction; a limiter never
    /// carries an invalid policy into request time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::FixedWindow { window, cost, .. } => {
                if window.as_millis() == 0 {
                    return Err(ConfigError::ZeroWindow);
                }
                if *cost == 0 {
                    return Err(ConfigError::ZeroCost);
                }
                Ok(())
            }
            Self::Gcra { burst, rate, period, cost } => {
                if *burst == 0 {
                    return Err(ConfigError::ZeroBurst);
                }
                if *rate == 0 {
                    return Err(ConfigError::ZeroRate);
                }
                if period.as_millis() == 0 {
                    return Err(ConfigError::ZeroPeriod);
                }
                if *cost == 0 {
                    return Err(ConfigError::ZeroCost);
                }
                Ok(())
            }
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::fixed_window(DEFAULT_WINDOW, DEFAULT_MAX)
    }
}

/// Per-call overrides merged onto a limiter's policy at check time.
///
/// This is how a request-dependent quota (for example, a higher `max` for
/// authenticated sessions) reaches the algorithm without rebuilding the
/// limiter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Overrides {
    /// Replaces `max` for this check (fixed-window only).
    pub max: Option<u64>,
    /// Replaces `cost` for this check.
    pub cost: Option<u64>,
}

impl Overrides {
    /// Override only the hit budget.
    pub fn max(max: u64) -> Self {
        Self { max: Some(max), cost: None }
    }

    /// Override only the per-request cost.
    pub fn cost(cost: u64) -> Self {
        Self { max: None, cost: Some(cost) }
    }
}
