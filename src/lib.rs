#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Distributed request admission control for tower services: per-key
//! admit/reject decisions backed by shared counter state, so the answer is
//! consistent across any number of concurrent server processes.
//!
//! ## Strategies
//!
//! - **Fixed window**: a hit counter per key, reset on a wall-clock cadence.
//! - **GCRA**: token-bucket smoothing tracked as a single "theoretical
//!   arrival time" cursor per key, with a bounded burst allowance.
//!
//! Both sit behind one [`Limiter`] façade. State lives in a pluggable
//! [`CounterStore`] / [`GcraStore`] backend; the in-memory implementations
//! here are single-process reference stores, and multi-instance deployments
//! plug in a networked store with the same atomic primitives.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use turnstile::{Limiter, MemoryCounterStore, Policy};
//!
//! #[tokio::main]
//! async fn main() {
//!     // 60 requests per 30 seconds, per client.
//!     let store = Arc::new(MemoryCounterStore::new(Duration::from_secs(30)));
//!     let limiter = Limiter::fixed_window(
//!         store,
//!         Policy::fixed_window(Duration::from_secs(30), 60),
//!     )
//!     .expect("valid policy");
//!
//!     let decision = limiter.check("203.0.113.7").await.expect("store reachable");
//!     assert!(!decision.limited);
//!     assert_eq!(decision.remaining, 59);
//! }
//! ```
//!
//! At the HTTP boundary, wrap a service with
//! [`AdmissionLayer`](middleware::AdmissionLayer): it derives the key from
//! the request, emits the `X-RateLimit-*` / `RateLimit-*` headers, and
//! short-circuits rejected requests with a 429.

pub mod clock;
pub mod decision;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod store;

mod gcra;
mod window;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use error::{BoxError, ConfigError, LimitError};
pub use limiter::{FailurePolicy, Limiter};
pub use middleware::{
    AdmissionLayer, AdmissionService, ClientIp, ClientIpKey, ExtractKey, SessionId, SessionKey,
};
pub use policy::{Overrides, Policy};
pub use store::{CounterStore, GcraStore, MemoryCounterStore, MemoryGcraStore, WindowState};
