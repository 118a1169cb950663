//! Fixed-window admission.
//!
//! One atomic store round trip per check: the increment both charges the
//! request and returns the state the decision is computed from. The charge is
//! applied even when the request ends up rejected; compensation, where
//! configured, is the middleware's job.

use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::decision::Decision;
use crate::error::LimitError;
use crate::store::CounterStore;

/// A decision plus the one-shot breach signal for notification hooks.
pub(crate) struct WindowOutcome {
    pub decision: Decision,
    /// True exactly once per window: this hit is the first to push the
    /// counter past the limit.
    pub first_breach: bool,
}

pub(crate) async fn check(
    store: &dyn CounterStore,
    clock: &dyn Clock,
    key: &str,
    window: Duration,
    max: u64,
    cost: u64,
) -> Result<WindowOutcome, LimitError> {
    let state = store.increment(key, cost).await.map_err(LimitError::store_unavailable)?;
    let now = clock.now_millis();

    let remaining = max.saturating_sub(state.total_hits);
    let limited = max > 0 && state.total_hits > max;
    let first_breach = limited && state.total_hits.saturating_sub(cost) <= max;

    if limited {
        debug!(key, total_hits = state.total_hits, max, "fixed window over limit");
    }

    Ok(WindowOutcome {
        decision: Decision {
            limited,
            limit: max,
            remaining,
            reset_after: Duration::from_millis(state.reset_at.saturating_sub(now)),
            retry_after: limited.then_some(window),
        },
        first_breach,
    })
}
