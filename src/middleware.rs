//! Tower middleware that enforces admission at the HTTP boundary.
//!
//! [`AdmissionLayer`] wraps a service. Per request it derives an identity key,
//! asks the [`Limiter`] for a decision, attaches that decision to the
//! request's extensions, emits the rate-limit response headers, and either
//! forwards the request or short-circuits with the configured rejection
//! status. When a compensation flag is set, an admitted request's charge is
//! rolled back after the response outcome is known, at most once, even if
//! the request future is dropped mid-flight.

use std::net::IpAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, DATE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

use crate::clock::Clock;
use crate::decision::Decision;
use crate::error::{BoxError, LimitError};
use crate::limiter::Limiter;
use crate::policy::Overrides;

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Client address extension, set by whatever accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Authenticated session extension, set by the auth layer upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Derives the rate-limit key for a request.
///
/// Failures here fail the request with a server error; a request whose
/// identity cannot be established is never silently admitted.
pub trait ExtractKey<B>: Send + Sync {
    /// Produce the key this request is counted under.
    fn extract(&self, request: &Request<B>) -> Result<String, BoxError>;
}

/// Default extractor: the [`ClientIp`] extension, falling back to the first
/// `x-forwarded-for` entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKey;

impl<B> ExtractKey<B> for ClientIpKey {
    fn extract(&self, request: &Request<B>) -> Result<String, BoxError> {
        if let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>() {
            return Ok(ip.to_string());
        }
        if let Some(forwarded) = request.headers().get("x-forwarded-for") {
            if let Ok(value) = forwarded.to_str() {
                if let Some(first) = value.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return Ok(first.to_string());
                    }
                }
            }
        }
        Err("no client ip: set a ClientIp extension or an x-forwarded-for header".into())
    }
}

/// Extractor keyed on the [`SessionId`] extension, for per-user limits behind
/// authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionKey;

impl<B> ExtractKey<B> for SessionKey {
    fn extract(&self, request: &Request<B>) -> Result<String, BoxError> {
        match request.extensions().get::<SessionId>() {
            Some(session) => Ok(session.0.clone()),
            None => Err("no session id on the request".into()),
        }
    }
}

struct FnExtractor<F>(F);

impl<B, F> ExtractKey<B> for FnExtractor<F>
where
    F: Fn(&Request<B>) -> Result<String, BoxError> + Send + Sync,
{
    fn extract(&self, request: &Request<B>) -> Result<String, BoxError> {
        (self.0)(request)
    }
}

struct Config<B> {
    limiter: Arc<Limiter>,
    key: Arc<dyn ExtractKey<B>>,
    skip: Option<Arc<dyn Fn(&Request<B>) -> bool + Send + Sync>>,
    max: Option<Arc<dyn Fn(&Request<B>) -> u64 + Send + Sync>>,
    legacy_headers: bool,
    standard_headers: bool,
    status: StatusCode,
    message: String,
    skip_failed: bool,
    skip_successful: bool,
    success: Arc<dyn Fn(StatusCode) -> bool + Send + Sync>,
}

impl<B> Clone for Config<B> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            skip: self.skip.clone(),
            max: self.max.clone(),
            legacy_headers: self.legacy_headers,
            standard_headers: self.standard_headers,
            status: self.status,
            message: self.message.clone(),
            skip_failed: self.skip_failed,
            skip_successful: self.skip_successful,
            success: self.success.clone(),
        }
    }
}

/// A layer that enforces admission decisions from a [`Limiter`].
pub struct AdmissionLayer<B> {
    config: Config<B>,
}

impl<B> Clone for AdmissionLayer<B> {
    fn clone(&self) -> Self {
        Self { config: self.config.clone() }
    }
}

impl<B> AdmissionLayer<B> {
    /// Layer with the default surface: keys from [`ClientIpKey`], legacy
    /// headers on, 429 rejections, no compensation.
    ///
    /// Runs the store's startup hook (e.g. the in-memory sweep scheduling) on
    /// the current runtime, when one is present.
    pub fn new(limiter: Arc<Limiter>) -> Self {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let limiter = limiter.clone();
            handle.spawn(async move {
                if let Err(err) = limiter.init().await {
                    warn!(error = %err, "store init failed");
                }
            });
        }
        Self {
            config: Config {
                limiter,
                key: Arc::new(ClientIpKey),
                skip: None,
                max: None,
                legacy_headers: true,
                standard_headers: false,
                status: StatusCode::TOO_MANY_REQUESTS,
                message: DEFAULT_MESSAGE.to_string(),
                skip_failed: false,
                skip_successful: false,
                success: Arc::new(|status: StatusCode| status.as_u16() < 400),
            },
        }
    }

    /// Replace the key extractor.
    pub fn key_extractor<E>(mut self, extractor: E) -> Self
    where
        E: ExtractKey<B> + 'static,
    {
        self.config.key = Arc::new(extractor);
        self
    }

    /// Derive keys with a closure.
    pub fn key_fn<F>(self, f: F) -> Self
    where
        F: Fn(&Request<B>) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.key_extractor(FnExtractor(f))
    }

    /// Bypass the check entirely for matching requests: no store mutation, no
    /// headers.
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request<B>) -> bool + Send + Sync + 'static,
    {
        self.config.skip = Some(Arc::new(predicate));
        self
    }

    /// Compute the hit budget per request (fixed-window limiters only). Must
    /// be a pure function of the request.
    pub fn per_request_max<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request<B>) -> u64 + Send + Sync + 'static,
    {
        self.config.max = Some(Arc::new(f));
        self
    }

    /// Toggle the `X-RateLimit-*` header family (on by default).
    pub fn legacy_headers(mut self, enabled: bool) -> Self {
        self.config.legacy_headers = enabled;
        self
    }

    /// Toggle the standardized `RateLimit-*` header family (off by default).
    pub fn standard_headers(mut self, enabled: bool) -> Self {
        self.config.standard_headers = enabled;
        self
    }

    /// Status code and body for rejected requests.
    pub fn rejection(mut self, status: StatusCode, message: impl Into<String>) -> Self {
        self.config.status = status;
        self.config.message = message.into();
        self
    }

    /// Roll back the charge when the response was *not* successful.
    pub fn skip_failed_requests(mut self, enabled: bool) -> Self {
        self.config.skip_failed = enabled;
        self
    }

    /// Roll back the charge when the response *was* successful.
    pub fn skip_successful_requests(mut self, enabled: bool) -> Self {
        self.config.skip_successful = enabled;
        self
    }

    /// Replace the success predicate (default: status < 400).
    pub fn success_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.config.success = Arc::new(predicate);
        self
    }
}

impl<S, B> Layer<S> for AdmissionLayer<B> {
    type Service = AdmissionService<S, B>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, config: Arc::new(self.config.clone()) }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, B> {
    inner: S,
    config: Arc<Config<B>>,
}

impl<S: Clone, B> Clone for AdmissionService<S, B> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), config: self.config.clone() }
    }
}

impl<S, B, ResBody> Service<Request<B>> for AdmissionService<S, B>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut req = req;

            if let Some(skip) = &config.skip {
                if skip(&req) {
                    return inner.call(req).await;
                }
            }

            let key = match derive_key(config.key.as_ref(), &req) {
                Ok(key) => key,
                Err(err) => {
                    warn!(error = %err, "key derivation failed; rejecting with server error");
                    return Ok(plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "key derivation failed".to_string(),
                    ));
                }
            };

            let overrides =
                Overrides { max: config.max.as_ref().map(|f| f(&req)), cost: None };
            let (decision, charged) = match config.limiter.check_with(&key, overrides).await {
                Ok(decision) => {
                    let charged = !decision.limited && config.limiter.supports_uncharge();
                    (decision, charged)
                }
                Err(err) => {
                    warn!(error = %err, key = %key, "admission check failed; applying failure policy");
                    // Nothing was charged; the decision is synthetic.
                    (config.limiter.failure_decision(), false)
                }
            };

            if decision.limited {
                let mut response = plain_response(config.status, config.message.clone());
                apply_headers(
                    response.headers_mut(),
                    &decision,
                    config.legacy_headers,
                    config.standard_headers,
                    config.limiter.clock(),
                );
                if config.legacy_headers || config.standard_headers {
                    if let Some(secs) = decision.retry_after_secs() {
                        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
                    }
                }
                response.extensions_mut().insert(decision);
                return Ok(response);
            }

            req.extensions_mut().insert(decision.clone());

            let compensation = (charged && (config.skip_failed || config.skip_successful))
                .then(|| Compensation::new(config.limiter.clone(), key, config.skip_failed));

            match inner.call(req).await {
                Ok(mut response) => {
                    if let Some(guard) = compensation {
                        let successful = (config.success)(response.status());
                        if (config.skip_failed && !successful)
                            || (config.skip_successful && successful)
                        {
                            guard.fire();
                        } else {
                            guard.disarm();
                        }
                    }
                    apply_headers(
                        response.headers_mut(),
                        &decision,
                        config.legacy_headers,
                        config.standard_headers,
                        config.limiter.clock(),
                    );
                    response.extensions_mut().insert(decision);
                    Ok(response)
                }
                Err(err) => {
                    if let Some(guard) = compensation {
                        if config.skip_failed {
                            guard.fire();
                        } else {
                            guard.disarm();
                        }
                    }
                    Err(err)
                }
            }
        })
    }
}

/// At-most-once rollback of an admitted request's charge.
///
/// `fire` and `disarm` consume the guard, so the drop path can only run for a
/// request future that was dropped mid-flight; it compensates then only when
/// `skip_failed_requests` is on, since a request that never finished is not a
/// successful one.
struct Compensation {
    limiter: Arc<Limiter>,
    key: String,
    fire_on_drop: bool,
    armed: bool,
}

impl Compensation {
    fn new(limiter: Arc<Limiter>, key: String, fire_on_drop: bool) -> Self {
        Self { limiter, key, fire_on_drop, armed: true }
    }

    fn fire(mut self) {
        self.armed = false;
        spawn_uncharge(self.limiter.clone(), self.key.clone());
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Compensation {
    fn drop(&mut self) {
        if self.armed && self.fire_on_drop {
            spawn_uncharge(self.limiter.clone(), self.key.clone());
        }
    }
}

/// The decrement runs detached so that caller cancellation cannot strand a
/// half-applied charge.
fn spawn_uncharge(limiter: Arc<Limiter>, key: String) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(err) = limiter.uncharge(&key, None).await {
                warn!(error = %err, key = %key, "compensating decrement failed");
            }
        });
    }
}

/// Extractor failures surface as the typed per-check error.
fn derive_key<B>(
    extractor: &dyn ExtractKey<B>,
    request: &Request<B>,
) -> Result<String, LimitError> {
    extractor.extract(request).map_err(|err| LimitError::KeyDerivation(err.to_string()))
}

fn plain_response<ResBody: From<String>>(status: StatusCode, message: String) -> Response<ResBody> {
    let mut response = Response::new(ResBody::from(message));
    *response.status_mut() = status;
    response
}

fn apply_headers(
    headers: &mut HeaderMap,
    decision: &Decision,
    legacy: bool,
    standard: bool,
    clock: &dyn Clock,
) {
    let reset_ms = u64::try_from(decision.reset_after.as_millis()).unwrap_or(u64::MAX);
    if legacy {
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(decision.limit),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(decision.remaining),
        );
        // Absolute reset instant plus the current date, so clients with bad
        // clocks can still compute the delta.
        let reset_at_ms = clock.now_millis().saturating_add(reset_ms);
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(reset_at_ms.div_ceil(1_000)),
        );
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&date) {
            headers.insert(DATE, value);
        }
    }
    if standard {
        headers.insert(
            HeaderName::from_static("ratelimit-limit"),
            HeaderValue::from(decision.limit),
        );
        headers.insert(
            HeaderName::from_static("ratelimit-remaining"),
            HeaderValue::from(decision.remaining),
        );
        headers.insert(
            HeaderName::from_static("ratelimit-reset"),
            HeaderValue::from(decision.reset_after_secs()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn client_ip_key_prefers_the_extension() {
        let mut req = Request::new(());
        req.extensions_mut().insert(ClientIp(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))));
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(ClientIpKey.extract(&req).unwrap(), "203.0.113.7");
    }

    #[test]
    fn client_ip_key_falls_back_to_forwarded_for() {
        let mut req = Request::new(());
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(ClientIpKey.extract(&req).unwrap(), "10.0.0.1");
    }

    #[test]
    fn client_ip_key_errors_without_identity() {
        let req = Request::new(());
        assert!(ClientIpKey.extract(&req).is_err());
    }

    #[test]
    fn session_key_reads_the_extension() {
        let mut req = Request::new(());
        req.extensions_mut().insert(SessionId("session-42".to_string()));
        assert_eq!(SessionKey.extract(&req).unwrap(), "session-42");

        let bare = Request::new(());
        assert!(SessionKey.extract(&bare).is_err());
    }

    #[test]
    fn headers_render_both_families() {
        let decision = Decision {
            limited: false,
            limit: 60,
            remaining: 59,
            reset_after: Duration::from_secs(30),
            retry_after: None,
        };
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &decision, true, true, &SystemClock);

        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "60");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "59");
        assert!(headers.contains_key("x-ratelimit-reset"));
        assert!(headers.contains_key(DATE));
        assert_eq!(headers.get("ratelimit-limit").unwrap(), "60");
        assert_eq!(headers.get("ratelimit-remaining").unwrap(), "59");
        assert_eq!(headers.get("ratelimit-reset").unwrap(), "30");
    }

    #[test]
    fn headers_respect_the_toggles() {
        let decision = Decision {
            limited: false,
            limit: 60,
            remaining: 59,
            reset_after: Duration::from_secs(30),
            retry_after: None,
        };
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &decision, false, false, &SystemClock);
        assert!(headers.is_empty());
    }

    #[test]
    fn absolute_reset_follows_the_injected_clock() {
        let clock = ManualClock::new(100_000);
        let decision = Decision {
            limited: false,
            limit: 60,
            remaining: 59,
            reset_after: Duration::from_secs(30),
            retry_after: None,
        };
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &decision, true, false, &clock);

        // 100s of clock plus 30s of window, in whole unix seconds.
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "130");
    }

    #[test]
    fn extractor_failures_become_the_typed_error() {
        let err = derive_key(&ClientIpKey, &Request::new(())).unwrap_err();
        assert!(err.is_key_derivation());
        assert!(!err.is_store_fault());
    }
}
