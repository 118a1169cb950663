//! GCRA token-bucket admission.
//!
//! State per key is a single cursor: the theoretical arrival time (TAT) of
//! the request that would find the bucket exactly empty. Tokens regenerate at
//! `rate` per `period`, so one token corresponds to one emission interval of
//! cursor advance. A bucket with an absent cursor is fully drained
//! (TAT = now, every burst token available).
//!
//! Acceptance persists the advanced cursor with a compare-and-set; a lost
//! race re-reads and re-evaluates, so two concurrent requests for one key can
//! never both consume the same token. Rejection never advances the cursor.

use std::time::Duration;

use tracing::trace;

use crate::clock::Clock;
use crate::decision::Decision;
use crate::error::LimitError;
use crate::store::GcraStore;

/// Compare-and-set attempts before the check is declared contended.
pub(crate) const MAX_CAS_ATTEMPTS: u32 = 4;

/// Emission interval in milliseconds, rounded up so the enforced rate is
/// never faster than configured.
pub(crate) fn emission_interval_ms(period: Duration, rate: u64) -> u64 {
    let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
    period_ms.div_ceil(rate)
}

pub(crate) async fn check(
    store: &dyn GcraStore,
    clock: &dyn Clock,
    key: &str,
    burst: u64,
    rate: u64,
    period: Duration,
    cost: u64,
) -> Result<Decision, LimitError> {
    let emission = emission_interval_ms(period, rate);
    let burst_offset = burst.saturating_mul(emission);
    let increment = emission.saturating_mul(cost);

    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let now = clock.now_millis();
        let stored = store.tat(key).await.map_err(LimitError::store_unavailable)?;
        let tat = stored.unwrap_or(now);
        let new_tat = tat.max(now).saturating_add(increment);
        let allow_at = new_tat.saturating_sub(burst_offset);

        if allow_at > now {
            // Reject without advancing the cursor. A tie (allow_at == now)
            // falls through to the accept path: the boundary favors the
            // caller.
            let retry_in = allow_at - now;
            trace!(key, attempt, retry_in, "gcra over limit");
            return Ok(Decision {
                limited: true,
                limit: burst,
                remaining: available_tokens(now, tat, burst_offset, emission, burst),
                reset_after: Duration::from_millis(tat.saturating_sub(now)),
                retry_after: Some(Duration::from_millis(retry_in)),
            });
        }

        if store.set_tat(key, stored, new_tat).await.map_err(LimitError::store_unavailable)? {
            return Ok(Decision {
                limited: false,
                limit: burst,
                remaining: available_tokens(now, new_tat, burst_offset, emission, burst),
                reset_after: Duration::from_millis(new_tat.saturating_sub(now)),
                retry_after: None,
            });
        }

        trace!(key, attempt, "gcra compare-and-set lost, re-reading");
    }

    Err(LimitError::StoreContention { attempts: MAX_CAS_ATTEMPTS })
}

/// Return the bucket to fully drained. Idempotent.
pub(crate) async fn reset(store: &dyn GcraStore, key: &str) -> Result<(), LimitError> {
    store.clear_tat(key).await.map_err(LimitError::store_unavailable)
}

/// Whole tokens available at `now` given the cursor `tat`, clamped to
/// `[0, burst]`.
fn available_tokens(now: u64, tat: u64, burst_offset: u64, emission: u64, burst: u64) -> u64 {
    (now.saturating_add(burst_offset).saturating_sub(tat) / emission).min(burst)
}
