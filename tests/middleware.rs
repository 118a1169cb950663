//! End-to-end tests for the tower admission layer.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{header::HeaderValue, Request, Response, StatusCode};
use tower::{Layer, ServiceExt};

use turnstile::{
    AdmissionLayer, BoxError, CounterStore, Decision, FailurePolicy, Limiter,
    MemoryCounterStore, MemoryGcraStore, Policy, WindowState,
};

const WINDOW: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn window_limiter(max: u64) -> Arc<Limiter> {
    init_tracing();
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    Arc::new(Limiter::fixed_window(store, Policy::fixed_window(WINDOW, max)).expect("valid policy"))
}

fn request(ip: &str) -> Request<()> {
    let mut req = Request::new(());
    req.headers_mut()
        .insert("x-forwarded-for", HeaderValue::from_str(ip).expect("ascii ip"));
    req
}

fn ok_service() -> impl tower::Service<
    Request<()>,
    Response = Response<String>,
    Error = Infallible,
    Future: Send,
> + Clone {
    tower::service_fn(|_req: Request<()>| async { Ok(Response::new("hello".to_string())) })
}

fn status_service(
    status: StatusCode,
) -> impl tower::Service<
    Request<()>,
    Response = Response<String>,
    Error = Infallible,
    Future: Send,
> + Clone {
    tower::service_fn(move |_req: Request<()>| async move {
        let mut resp = Response::new(String::new());
        *resp.status_mut() = status;
        Ok(resp)
    })
}

#[tokio::test]
async fn admitted_requests_carry_both_header_families() {
    let layer = AdmissionLayer::new(window_limiter(60)).standard_headers(true);
    let svc = layer.layer(ok_service());

    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "60");
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "59");
    assert!(resp.headers().contains_key("x-ratelimit-reset"));
    assert!(resp.headers().contains_key("date"));
    assert_eq!(resp.headers().get("ratelimit-limit").unwrap(), "60");
    assert_eq!(resp.headers().get("ratelimit-reset").unwrap(), "30");
    assert!(resp.extensions().get::<Decision>().is_some());
}

#[tokio::test]
async fn rejection_short_circuits_with_configured_status_and_body() {
    let layer = AdmissionLayer::new(window_limiter(1));
    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    let inner = tower::service_fn(move |_req: Request<()>| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(Response::new(String::new()))
        }
    });
    let svc = layer.layer(inner);

    let resp = svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.body(), "Too many requests, please try again later.");
    assert_eq!(resp.headers().get("retry-after").unwrap(), "30");
    let decision = resp.extensions().get::<Decision>().expect("decision attached");
    assert!(decision.limited);

    // Downstream never saw the rejected request.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejection_status_and_message_are_configurable() {
    let layer = AdmissionLayer::new(window_limiter(1))
        .rejection(StatusCode::SERVICE_UNAVAILABLE, "slow down");
    let svc = layer.layer(ok_service());

    svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.body(), "slow down");
}

#[tokio::test]
async fn downstream_handlers_see_the_decision_extension() {
    let layer = AdmissionLayer::new(window_limiter(60));
    let inner = tower::service_fn(|req: Request<()>| async move {
        let decision = req.extensions().get::<Decision>().expect("decision on request");
        assert!(!decision.limited);
        assert_eq!(decision.limit, 60);
        Ok::<_, Infallible>(Response::new(String::new()))
    });
    let svc = layer.layer(inner);
    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn keys_separate_clients() {
    let layer = AdmissionLayer::new(window_limiter(1));
    let svc = layer.layer(ok_service());

    assert_eq!(
        svc.clone().oneshot(request("1.1.1.1")).await.expect("service ok").status(),
        StatusCode::OK
    );
    assert_eq!(
        svc.clone().oneshot(request("2.2.2.2")).await.expect("service ok").status(),
        StatusCode::OK
    );
    assert_eq!(
        svc.oneshot(request("1.1.1.1")).await.expect("service ok").status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn skipped_requests_mutate_nothing_and_get_no_headers() {
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(WINDOW, 60))
            .expect("valid policy"),
    );
    let layer =
        AdmissionLayer::new(limiter).skip_when(|req: &Request<()>| req.uri().path() == "/health");
    let svc = layer.layer(ok_service());

    for _ in 0..5 {
        let mut req = request("1.2.3.4");
        *req.uri_mut() = "/health".parse().expect("valid uri");
        let resp = svc.clone().oneshot(req).await.expect("service ok");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key("x-ratelimit-limit"));
    }
    assert_eq!(store.hits("development:1.2.3.4"), None);

    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "59");
}

#[tokio::test]
async fn key_derivation_failure_is_a_server_error_not_an_admit() {
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(WINDOW, 60))
            .expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter);
    let svc = layer.layer(ok_service());

    // No ClientIp extension, no x-forwarded-for.
    let resp = svc.oneshot(Request::new(())).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(store.hits("development:"), None);
}

#[tokio::test]
async fn per_request_max_overrides_the_policy_budget() {
    let layer = AdmissionLayer::new(window_limiter(1)).per_request_max(|req: &Request<()>| {
        if req.headers().contains_key("authorization") {
            100
        } else {
            1
        }
    });
    let svc = layer.layer(ok_service());

    svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    let resp = svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let mut privileged = request("1.2.3.4");
    privileged.headers_mut().insert("authorization", HeaderValue::from_static("Bearer t"));
    let resp = svc.oneshot(privileged).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "100");
}

#[tokio::test]
async fn skip_failed_requests_rolls_back_the_charge() {
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(WINDOW, 5))
            .expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter).skip_failed_requests(true);
    let svc = layer.layer(status_service(StatusCode::INTERNAL_SERVER_ERROR));

    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // The decrement runs on a detached task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.hits("development:1.2.3.4"), Some(0));
}

#[tokio::test]
async fn skip_successful_requests_rolls_back_the_charge() {
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(WINDOW, 5))
            .expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter).skip_successful_requests(true);
    let svc = layer.layer(ok_service());

    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.hits("development:1.2.3.4"), Some(0));
}

#[tokio::test]
async fn failed_requests_still_count_without_compensation_flags() {
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(WINDOW, 5))
            .expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter);
    let svc = layer.layer(status_service(StatusCode::INTERNAL_SERVER_ERROR));

    svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.hits("development:1.2.3.4"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn layer_construction_schedules_the_store_sweep() {
    let store = Arc::new(MemoryCounterStore::new(Duration::from_millis(50)));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(Duration::from_millis(50), 5))
            .expect("valid policy"),
    );
    let _layer = AdmissionLayer::<()>::new(limiter);

    store.increment("k", 1).await.expect("store reachable");
    assert_eq!(store.hits("k"), Some(1));

    // The sweep spawned at construction clears the map each window.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(store.hits("k"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_in_flight_request_compensates_once() {
    let store = Arc::new(MemoryCounterStore::new(WINDOW));
    let limiter = Arc::new(
        Limiter::fixed_window(store.clone(), Policy::fixed_window(WINDOW, 5))
            .expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter).skip_failed_requests(true);
    let svc = layer.layer(tower::service_fn(|_req: Request<()>| async {
        std::future::pending::<()>().await;
        Ok::<_, Infallible>(Response::new(String::new()))
    }));

    let task = tokio::spawn(svc.oneshot(request("1.2.3.4")));

    // Wait for the charge to land before cancelling.
    for _ in 0..100 {
        if store.hits("development:1.2.3.4") == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.hits("development:1.2.3.4"), Some(1));

    task.abort();
    let _ = task.await;

    for _ in 0..100 {
        if store.hits("development:1.2.3.4") == Some(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.hits("development:1.2.3.4"), Some(0));
}

struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn increment(&self, _key: &str, _by: u64) -> Result<WindowState, BoxError> {
        Err("store offline".into())
    }
    async fn decrement(&self, _key: &str, _by: u64) -> Result<(), BoxError> {
        Err("store offline".into())
    }
    async fn reset_key(&self, _key: &str) -> Result<(), BoxError> {
        Err("store offline".into())
    }
    async fn reset_all(&self) -> Result<(), BoxError> {
        Err("store offline".into())
    }
}

#[tokio::test]
async fn fail_closed_rejects_while_the_store_is_down() {
    let limiter = Arc::new(
        Limiter::fixed_window(Arc::new(DownStore), Policy::fixed_window(WINDOW, 60))
            .expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter);
    let svc = layer.layer(ok_service());

    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "30");
}

#[tokio::test]
async fn fail_open_admits_while_the_store_is_down() {
    let limiter = Arc::new(
        Limiter::fixed_window(Arc::new(DownStore), Policy::fixed_window(WINDOW, 60))
            .expect("valid policy")
            .with_failure_policy(FailurePolicy::FailOpen),
    );
    let layer = AdmissionLayer::new(limiter);
    let svc = layer.layer(ok_service());

    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn gcra_limiter_drives_the_same_adapter() {
    let store = Arc::new(MemoryGcraStore::new());
    let limiter = Arc::new(
        Limiter::gcra(store, Policy::gcra(2, 1, Duration::from_secs(1))).expect("valid policy"),
    );
    let layer = AdmissionLayer::new(limiter).standard_headers(true);
    let svc = layer.layer(ok_service());

    let resp = svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "2");

    svc.clone().oneshot(request("1.2.3.4")).await.expect("service ok");
    let resp = svc.oneshot(request("1.2.3.4")).await.expect("service ok");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_through_the_adapter_admit_one() {
    let layer = AdmissionLayer::new(window_limiter(1));
    let svc = layer.layer(ok_service());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            svc.oneshot(request("contended")).await.expect("service ok").status()
        }));
    }

    let mut ok = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.expect("task completes") {
            StatusCode::OK => ok += 1,
            StatusCode::TOO_MANY_REQUESTS => limited += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(limited, 9);
}
