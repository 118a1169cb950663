//! The result of an admission check.

use std::time::Duration;

/// The outcome of one admission check.
///
/// Produced fresh per check and never persisted. The middleware attaches it
/// to the request's extensions so downstream handlers can read it, and renders
/// it into the `X-RateLimit-*` / `RateLimit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Decision {
    /// Whether the request was rejected.
    pub limited: bool,
    /// The budget this check was measured against (window `max`, or GCRA
    /// `burst`).
    pub limit: u64,
    /// Units left in the current window or bucket, never negative.
    pub remaining: u64,
    /// Time until the window resets or the bucket fully refills.
    pub reset_after: Duration,
    /// How long the caller should wait before retrying. Present only when
    /// `limited` is true.
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// Helper to check if the request was rejected.
    pub fn is_limited(&self) -> bool {
        self.limited
    }

    /// `retry_after` rounded up to whole seconds, as emitted in the
    /// `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }

    /// `reset_after` rounded up to whole seconds, as emitted in the
    /// `RateLimit-Reset` header.
    pub fn reset_after_secs(&self) -> u64 {
        ceil_secs(self.reset_after)
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted() -> Decision {
        Decision {
            limited: false,
            limit: 60,
            remaining: 59,
            reset_after: Duration::from_millis(29_500),
            retry_after: None,
        }
    }

    #[test]
    fn admitted_has_no_retry_after() {
        let d = admitted();
        assert!(!d.is_limited());
        assert_eq!(d.retry_after_secs(), None);
        assert_eq!(d.reset_after_secs(), 30);
    }

    #[test]
    fn header_seconds_round_up() {
        let d = Decision {
            limited: true,
            limit: 60,
            remaining: 0,
            reset_after: Duration::from_millis(1),
            retry_after: Some(Duration::from_millis(30_000)),
        };
        assert_eq!(d.retry_after_secs(), Some(30));
        assert_eq!(d.reset_after_secs(), 1);
    }

    #[test]
    fn exact_seconds_do_not_round_up() {
        let d = Decision {
            limited: true,
            limit: 1,
            remaining: 0,
            reset_after: Duration::from_secs(2),
            retry_after: Some(Duration::from_millis(500)),
        };
        assert_eq!(d.reset_after_secs(), 2);
        assert_eq!(d.retry_after_secs(), Some(1));
    }
}
