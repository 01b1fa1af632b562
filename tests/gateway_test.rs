use async_trait::async_trait;
use axum::{body::Body, extract::ConnectInfo, routing::any, Router};
use http::{Request, StatusCode};
use limitgate::error::{GatewayError, Result as GatewayResult};
use limitgate::events::EventBroker;
use limitgate::proxy::{proxy_handler, ProxyConfig, ProxyState};
use limitgate::rate_limit::{Decision, Limiter, MemoryStore, SlidingWindowStore};
use limitgate::rules::{IdentifyBy, Matcher, Rule};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A store that always fails, standing in for an unreachable Redis.
struct FailingStore;

#[async_trait]
impl SlidingWindowStore for FailingStore {
    async fn check_sliding_window(
        &self,
        _key: &str,
        _limit: i64,
        _window: Duration,
    ) -> GatewayResult<Decision> {
        Err(GatewayError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }

    async fn increment(&self, _key: &str, _window: Duration) -> GatewayResult<i64> {
        Err(GatewayError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }

    async fn get_count(&self, _key: &str, _window: Duration) -> GatewayResult<i64> {
        Err(GatewayError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }

    async fn reset(&self, _key: &str) -> GatewayResult<()> {
        Err(GatewayError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }

    async fn ping(&self) -> GatewayResult<()> {
        Err(GatewayError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }
}

fn rule(name: &str, pattern: &str, priority: i32, limit: i64, methods: &[&str]) -> Rule {
    Rule {
        name: name.to_string(),
        pattern: pattern.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        priority,
        limit,
        window_secs: 60,
        identify_by: IdentifyBy::Ip,
        header_name: String::new(),
    }
}

fn build_state(
    upstream: &str,
    rules: Vec<Rule>,
    store: Arc<dyn SlidingWindowStore>,
    global_limit: i64,
) -> ProxyState {
    let matcher = Matcher::new(rules).unwrap();
    let limiter = Limiter::new(Arc::clone(&store), global_limit, Duration::from_secs(60)).unwrap();

    ProxyState::new(
        ProxyConfig {
            upstream_url: upstream.to_string(),
            trust_forwarded_for: false,
            store_timeout: Duration::from_secs(3),
            upstream_timeout: Duration::from_secs(10),
            upstream_connect_timeout: Duration::from_secs(2),
        },
        matcher,
        limiter,
        store,
    )
    .unwrap()
}

fn build_app(state: ProxyState) -> Router {
    Router::new()
        .route("/proxy/*path", any(proxy_handler))
        .with_state(state)
}

fn proxy_request(method: &str, uri: &str, ip: [u8; 4], headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .extension(ConnectInfo(SocketAddr::from((ip, 9999))))
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn mock_upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_rule_limit_enforced_per_client() {
    let server = mock_upstream().await;
    let state = build_state(
        &server.uri(),
        vec![rule("R", "/api/users/:id", 1, 2, &["GET"])],
        Arc::new(MemoryStore::new()),
        100,
    );
    let app = build_app(state);

    // First two requests are admitted with decreasing remaining counts.
    for expected_remaining in ["1", "0"] {
        let response = app
            .clone()
            .oneshot(proxy_request("GET", "/proxy/api/users/42", [1, 2, 3, 4], &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "2");
        assert_eq!(
            response.headers().get("X-RateLimit-Remaining").unwrap(),
            expected_remaining
        );
        assert_eq!(response.headers().get("X-RateLimit-Rule").unwrap(), "R");
        assert!(response.headers().get("X-RateLimit-Reset").is_some());
    }

    // The third request is rejected with the structured body.
    let response = app
        .clone()
        .oneshot(proxy_request("GET", "/proxy/api/users/42", [1, 2, 3, 4], &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("X-RateLimit-Rule").unwrap(), "R");

    let body = body_text(response).await;
    assert!(body.contains(r#""rule":"R""#));
    assert!(body.contains(r#""limit":2"#));
    assert!(body.contains(r#""remaining":0"#));
    assert!(body.contains(r#""reset_at""#));

    // A different client IP keeps its own counter.
    let response = app
        .oneshot(proxy_request("GET", "/proxy/api/users/42", [5, 6, 7, 8], &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_header_identity_separates_clients() {
    let server = mock_upstream().await;

    let mut keyed = rule("keyed", "/api/users/:id", 1, 2, &["GET"]);
    keyed.identify_by = IdentifyBy::Header;
    keyed.header_name = "X-API-Key".to_string();

    let state = build_state(&server.uri(), vec![keyed], Arc::new(MemoryStore::new()), 100);
    let app = build_app(state);

    // Same IP, distinct keys: counters do not mix.
    for key in ["alpha", "beta"] {
        let response = app
            .clone()
            .oneshot(proxy_request(
                "GET",
                "/proxy/api/users/42",
                [1, 2, 3, 4],
                &[("X-API-Key", key)],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "1");
    }

    // Three requests with the same key exhaust its limit.
    for expected in [StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
        let response = app
            .clone()
            .oneshot(proxy_request(
                "GET",
                "/proxy/api/users/42",
                [9, 9, 9, 9],
                &[("X-API-Key", "alpha")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), expected);
    }
}

#[tokio::test]
async fn test_higher_priority_rule_wins() {
    let server = mock_upstream().await;
    let state = build_state(
        &server.uri(),
        vec![
            rule("B", "/api/*", 1, 100, &[]),
            rule("A", "/api/health", 10, 100, &[]),
        ],
        Arc::new(MemoryStore::new()),
        100,
    );
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(proxy_request("GET", "/proxy/api/health", [1, 2, 3, 4], &[]))
        .await
        .unwrap();
    assert_eq!(response.headers().get("X-RateLimit-Rule").unwrap(), "A");

    let response = app
        .oneshot(proxy_request("GET", "/proxy/api/other", [1, 2, 3, 4], &[]))
        .await
        .unwrap();
    assert_eq!(response.headers().get("X-RateLimit-Rule").unwrap(), "B");
}

#[tokio::test]
async fn test_store_unavailable_fails_open() {
    let server = mock_upstream().await;
    let broker = EventBroker::new(8);
    let mut subscription = broker.subscribe();

    let state = build_state(
        &server.uri(),
        vec![rule("R", "/api/users/:id", 1, 2, &["GET"])],
        Arc::new(FailingStore),
        100,
    )
    .with_event_broker(broker);
    let app = build_app(state);

    let response = app
        .oneshot(proxy_request("GET", "/proxy/api/users/42", [1, 2, 3, 4], &[]))
        .await
        .unwrap();

    // Admitted and forwarded, with no rate limit metadata.
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("X-RateLimit-Limit").is_none());

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("broker closed");
    assert!(event.allowed);
    assert_eq!(event.limit, 0);
    assert_eq!(event.remaining, 0);
    assert_eq!(event.status, 200);
}

#[tokio::test]
async fn test_global_fallback_when_no_rule_matches() {
    let server = mock_upstream().await;
    let state = build_state(&server.uri(), vec![], Arc::new(MemoryStore::new()), 2);
    let app = build_app(state);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(proxy_request("GET", "/proxy/api/anything", [1, 2, 3, 4], &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "2");
        assert!(response.headers().get("X-RateLimit-Rule").is_none());
    }

    let response = app
        .oneshot(proxy_request("GET", "/proxy/api/anything", [1, 2, 3, 4], &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = body_text(response).await;
    assert!(body.contains(r#""error":"rate limit exceeded""#));
    assert!(!body.contains(r#""rule""#));
}

#[tokio::test]
async fn test_method_mismatch_falls_through_to_global() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let state = build_state(
        &server.uri(),
        vec![rule("reads", "/api/items", 1, 2, &["GET"])],
        Arc::new(MemoryStore::new()),
        100,
    );
    let app = build_app(state);

    let response = app
        .oneshot(proxy_request("POST", "/proxy/api/items", [1, 2, 3, 4], &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "100");
    assert!(response.headers().get("X-RateLimit-Rule").is_none());
}

#[tokio::test]
async fn test_upstream_transport_failure_maps_to_bad_gateway() {
    // Nothing listens on this port.
    let state = build_state(
        "http://127.0.0.1:1",
        vec![],
        Arc::new(MemoryStore::new()),
        100,
    );
    let app = build_app(state);

    let response = app
        .oneshot(proxy_request("GET", "/proxy/api/users/42", [1, 2, 3, 4], &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_text(response).await;
    assert!(body.contains(r#""error":"bad gateway""#));
}

#[tokio::test]
async fn test_query_and_body_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/search"))
        .and(query_param("q", "widgets"))
        .respond_with(ResponseTemplate::new(200).set_body_string("found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/items"))
        .and(body_string("hello upstream"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let state = build_state(&server.uri(), vec![], Arc::new(MemoryStore::new()), 100);
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(proxy_request(
            "GET",
            "/proxy/api/search?q=widgets",
            [1, 2, 3, 4],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "found");

    let request = Request::builder()
        .method("POST")
        .uri("/proxy/api/items")
        .extension(ConnectInfo(SocketAddr::from(([1, 2, 3, 4], 9999))))
        .body(Body::from("hello upstream"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_rule_set_swap_leaves_in_flight_requests_on_old_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let state = build_state(
        &server.uri(),
        vec![rule("old-rule", "/api/*", 1, 100, &[])],
        Arc::new(MemoryStore::new()),
        100,
    );
    let app = build_app(state.clone());

    // Start a request against the old set, swap mid-flight, then finish.
    let in_flight = tokio::spawn(
        app.clone()
            .oneshot(proxy_request("GET", "/proxy/api/slow", [1, 2, 3, 4], &[])),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    state.set_matcher(
        Matcher::new(vec![rule("new-rule", "/api/*", 1, 100, &[])]).unwrap(),
    );

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(
        response.headers().get("X-RateLimit-Rule").unwrap(),
        "old-rule"
    );

    // A request started after the swap sees the new set.
    let response = app
        .oneshot(proxy_request("GET", "/proxy/api/next", [1, 2, 3, 4], &[]))
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("X-RateLimit-Rule").unwrap(),
        "new-rule"
    );
}

#[tokio::test]
async fn test_denied_requests_emit_events() {
    let server = mock_upstream().await;
    let broker = EventBroker::new(8);
    let mut subscription = broker.subscribe();

    let state = build_state(
        &server.uri(),
        vec![rule("R", "/api/users/:id", 1, 1, &["GET"])],
        Arc::new(MemoryStore::new()),
        100,
    )
    .with_event_broker(broker);
    let app = build_app(state);

    for _ in 0..2 {
        let _ = app
            .clone()
            .oneshot(proxy_request("GET", "/proxy/api/users/42", [1, 2, 3, 4], &[]))
            .await
            .unwrap();
    }

    let first = subscription.recv().await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.rule_name, "R");
    assert_eq!(first.status, 200);

    let second = subscription.recv().await.unwrap();
    assert!(!second.allowed);
    assert_eq!(second.status, 429);
    assert_eq!(second.response_ms, 0);
    assert_eq!(second.path, "/api/users/42");
}
