//! Error types for admission control.
//!
//! Two families, deliberately kept apart:
//!
//! - [`ConfigError`] is raised once, when a [`Limiter`](crate::Limiter) is
//!   constructed. A limiter that was built successfully never produces a
//!   configuration error at request time.
//! - [`LimitError`] is the per-check failure. A *rejected* request is not an
//!   error; it comes back as a normal [`Decision`](crate::Decision) with
//!   `limited == true`. `LimitError` covers the cases where no decision could
//!   be computed at all.

use std::fmt;

/// Boxed error type carried by store implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Construction-time configuration failures.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The fixed-window duration resolves to zero milliseconds.
    #[error("window duration must be at least one millisecond")]
    ZeroWindow,
    /// The GCRA regeneration rate is zero.
    #[error("gcra rate must be non-zero")]
    ZeroRate,
    /// The GCRA regeneration period resolves to zero milliseconds.
    #[error("gcra period must be at least one millisecond")]
    ZeroPeriod,
    /// The GCRA burst capacity is zero.
    #[error("gcra burst must be non-zero")]
    ZeroBurst,
    /// The per-request cost is zero.
    #[error("cost must be non-zero")]
    ZeroCost,
    /// The policy variant does not match the store capability the limiter was
    /// constructed with.
    #[error("policy does not match the supplied store: expected a {expected} policy")]
    PolicyMismatch {
        /// The policy variant the constructor requires.
        expected: &'static str,
    },
}

/// Per-check failures.
#[derive(Debug)]
pub enum LimitError {
    /// The store errored or did not answer within the configured deadline.
    StoreUnavailable {
        /// The underlying store or timeout error.
        source: BoxError,
    },
    /// The store's compare-and-set kept losing races past the retry budget.
    StoreContention {
        /// How many attempts were made before giving up.
        attempts: u32,
    },
    /// The caller-supplied key extractor failed for this request.
    KeyDerivation(String),
}

impl LimitError {
    /// Wrap a store error.
    pub fn store_unavailable(source: BoxError) -> Self {
        Self::StoreUnavailable { source }
    }

    /// Check if this error is due to the store being unreachable or slow.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Check if this error is due to compare-and-set contention.
    pub fn is_store_contention(&self) -> bool {
        matches!(self, Self::StoreContention { .. })
    }

    /// Check if this error is due to key derivation failing.
    pub fn is_key_derivation(&self) -> bool {
        matches!(self, Self::KeyDerivation(_))
    }

    /// Whether the failure policy (fail-open / fail-closed) applies to this
    /// error. Key-derivation failures are per-request caller bugs and are
    /// never converted into a synthetic decision.
    pub fn is_store_fault(&self) -> bool {
        !self.is_key_derivation()
    }
}

impl fmt::Display for LimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnavailable { source } => {
                write!(f, "store unavailable: {}", source)
            }
            Self::StoreContention { attempts } => {
                write!(f, "store compare-and-set contended after {} attempts", attempts)
            }
            Self::KeyDerivation(reason) => {
                write!(f, "key derivation failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for LimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::StoreUnavailable { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}
