//! The limiter façade.
//!
//! A [`Limiter`] owns one policy, one store handle, and the knobs that apply
//! to every check: key namespacing, the store deadline, and the
//! fail-open/fail-closed stance. Callers construct one limiter per policy and
//! pass it wherever checks happen; there is no process-wide registry.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::decision::Decision;
use crate::error::{ConfigError, LimitError};
use crate::gcra;
use crate::policy::{Overrides, Policy};
use crate::store::{CounterStore, GcraStore};
use crate::window;

/// What to do when the store cannot answer.
///
/// Fail-closed rejects every request while the store is down, the safer
/// default for abuse protection. Fail-open admits every request instead,
/// trading protection for availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Admit when the store is unavailable.
    FailOpen,
    /// Reject when the store is unavailable.
    #[default]
    FailClosed,
}

/// Default namespace prefix, matching the usual development deployment.
pub const DEFAULT_NAMESPACE: &str = "development";
/// Default per-check store deadline.
pub const DEFAULT_STORE_DEADLINE: Duration = Duration::from_secs(1);

enum Backend {
    Window { store: Arc<dyn CounterStore>, window: Duration, max: u64, cost: u64 },
    Gcra { store: Arc<dyn GcraStore>, burst: u64, rate: u64, period: Duration, cost: u64 },
}

/// Unified admission front for both strategies.
pub struct Limiter {
    backend: Backend,
    namespace: String,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    store_deadline: Duration,
    on_first_breach: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("namespace", &self.namespace)
            .field("failure_policy", &self.failure_policy)
            .field("store_deadline", &self.store_deadline)
            .finish_non_exhaustive()
    }
}

impl Limiter {
    /// Build a fixed-window limiter.
    ///
    /// The store capability required by the policy is checked here, once; a
    /// GCRA policy handed to this constructor is a [`ConfigError`], never a
    /// request-time failure.
    pub fn fixed_window(store: Arc<dyn CounterStore>, policy: Policy) -> Result<Self, ConfigError> {
        policy.validate()?;
        match policy {
            Policy::FixedWindow { window, max, cost } => {
                Ok(Self::with_backend(Backend::Window { store, window, max, cost }))
            }
            Policy::Gcra { .. } => Err(ConfigError::PolicyMismatch { expected: "fixed-window" }),
        }
    }

    /// Build a GCRA limiter.
    pub fn gcra(store: Arc<dyn GcraStore>, policy: Policy) -> Result<Self, ConfigError> {
        policy.validate()?;
        match policy {
            Policy::Gcra { burst, rate, period, cost } => {
                Ok(Self::with_backend(Backend::Gcra { store, burst, rate, period, cost }))
            }
            Policy::FixedWindow { .. } => Err(ConfigError::PolicyMismatch { expected: "gcra" }),
        }
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            namespace: DEFAULT_NAMESPACE.to_string(),
            clock: Arc::new(SystemClock),
            failure_policy: FailurePolicy::default(),
            store_deadline: DEFAULT_STORE_DEADLINE,
            on_first_breach: None,
        }
    }

    /// Set the environment/deployment prefix prepended to every key before it
    /// reaches the store, so two deployments sharing one store cannot collide.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Inject a clock, for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Choose the fail-open/fail-closed stance for store outages.
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Bound how long a check may wait on the store before the failure policy
    /// takes over.
    pub fn with_store_deadline(mut self, deadline: Duration) -> Self {
        self.store_deadline = deadline;
        self
    }

    /// Hook invoked with the (un-namespaced) key on the first hit of a window
    /// that pushes the counter past the limit. Fixed-window only.
    pub fn on_first_breach(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_first_breach = Some(Box::new(hook));
        self
    }

    /// The configured stance for store outages.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run the store's startup hook. The in-memory counter store uses this to
    /// schedule its background sweep; [`AdmissionLayer`](crate::AdmissionLayer)
    /// calls it once at construction. No-op for GCRA backends.
    pub async fn init(&self) -> Result<(), LimitError> {
        match &self.backend {
            Backend::Window { store, .. } => {
                store.init().await.map_err(LimitError::store_unavailable)
            }
            Backend::Gcra { .. } => Ok(()),
        }
    }

    /// The budget decisions are measured against (window `max`, or GCRA
    /// `burst`).
    pub fn limit(&self) -> u64 {
        match &self.backend {
            Backend::Window { max, .. } => *max,
            Backend::Gcra { burst, .. } => *burst,
        }
    }

    /// Whether charges made by this limiter can be rolled back. Only
    /// fixed-window counters support a compensating decrement.
    pub fn supports_uncharge(&self) -> bool {
        matches!(self.backend, Backend::Window { .. })
    }

    /// Run one admission check for `key` under the limiter's policy.
    pub async fn check(&self, key: &str) -> Result<Decision, LimitError> {
        self.check_with(key, Overrides::default()).await
    }

    /// Run one admission check with per-call overrides merged onto the
    /// policy. `max` overrides apply to fixed-window limiters only.
    pub async fn check_with(&self, key: &str, overrides: Overrides) -> Result<Decision, LimitError> {
        let ns_key = self.namespaced(key);
        match &self.backend {
            Backend::Window { store, window, max, cost } => {
                let max = overrides.max.unwrap_or(*max);
                let cost = overrides.cost.unwrap_or(*cost);
                let outcome = self
                    .with_deadline(window::check(
                        store.as_ref(),
                        self.clock.as_ref(),
                        &ns_key,
                        *window,
                        max,
                        cost,
                    ))
                    .await?;
                if outcome.first_breach {
                    warn!(key, max, "rate limit first breached in this window");
                    if let Some(hook) = &self.on_first_breach {
                        hook(key);
                    }
                }
                Ok(outcome.decision)
            }
            Backend::Gcra { store, burst, rate, period, cost } => {
                let cost = overrides.cost.unwrap_or(*cost);
                self.with_deadline(gcra::check(
                    store.as_ref(),
                    self.clock.as_ref(),
                    &ns_key,
                    *burst,
                    *rate,
                    *period,
                    cost,
                ))
                .await
            }
        }
    }

    /// Forget a key's state: the window counter is dropped, or the bucket is
    /// returned to fully drained. Idempotent.
    pub async fn reset(&self, key: &str) -> Result<(), LimitError> {
        let ns_key = self.namespaced(key);
        match &self.backend {
            Backend::Window { store, .. } => {
                store.reset_key(&ns_key).await.map_err(LimitError::store_unavailable)
            }
            Backend::Gcra { store, .. } => gcra::reset(store.as_ref(), &ns_key).await,
        }
    }

    /// Forget every key. Fixed-window only; a GCRA limiter has no bulk reset
    /// and treats this as a no-op.
    pub async fn reset_all(&self) -> Result<(), LimitError> {
        match &self.backend {
            Backend::Window { store, .. } => {
                store.reset_all().await.map_err(LimitError::store_unavailable)
            }
            Backend::Gcra { .. } => Ok(()),
        }
    }

    /// Roll back one charge for `key`, e.g. because the response outcome
    /// says the request should not count. No-op for GCRA backends.
    pub async fn uncharge(&self, key: &str, cost_override: Option<u64>) -> Result<(), LimitError> {
        match &self.backend {
            Backend::Window { store, cost, .. } => {
                let by = cost_override.unwrap_or(*cost);
                store
                    .decrement(&self.namespaced(key), by)
                    .await
                    .map_err(LimitError::store_unavailable)
            }
            Backend::Gcra { .. } => {
                debug!(key, "uncharge ignored: gcra backend has no compensating decrement");
                Ok(())
            }
        }
    }

    /// The synthetic decision the failure policy substitutes when the store
    /// cannot answer.
    pub fn failure_decision(&self) -> Decision {
        let limit = self.limit();
        match self.failure_policy {
            FailurePolicy::FailOpen => Decision {
                limited: false,
                limit,
                remaining: limit,
                reset_after: Duration::ZERO,
                retry_after: None,
            },
            FailurePolicy::FailClosed => {
                let cadence = self.cadence();
                Decision {
                    limited: true,
                    limit,
                    remaining: 0,
                    reset_after: cadence,
                    retry_after: Some(cadence),
                }
            }
        }
    }

    fn cadence(&self) -> Duration {
        match &self.backend {
            Backend::Window { window, .. } => *window,
            Backend::Gcra { period, .. } => *period,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, LimitError>>,
    ) -> Result<T, LimitError> {
        match tokio::time::timeout(self.store_deadline, fut).await {
            Ok(result) => result,
            Err(elapsed) => {
                warn!(deadline_ms = self.store_deadline.as_millis() as u64, "store deadline hit");
                Err(LimitError::store_unavailable(Box::new(elapsed)))
            }
        }
    }
}
