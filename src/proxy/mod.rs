//! The request admission pipeline.
//!
//! Each inbound request is resolved to at most one rule, checked against the
//! sliding-window store, and either streamed to the upstream or rejected
//! with a structured 429. Every outcome is published to the event broker.
//!
//! When the store cannot decide (connectivity loss, timeout) the gateway
//! fails open: the request is admitted and the event carries empty limit
//! fields. Clients never see a 500 caused by a degraded limiter.

use crate::error::{GatewayError, Result};
use crate::events::{Event, EventBroker};
use crate::rate_limit::{Decision, Limiter, SlidingWindowStore};
use crate::rules::{IdentifyBy, Matcher, Rule};
use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for the proxy pipeline
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream base URL the incoming path suffix is appended to
    pub upstream_url: String,
    /// Trust X-Forwarded-For for client identification
    pub trust_forwarded_for: bool,
    /// Deadline for a single store call
    pub store_timeout: Duration,
    /// Total deadline for an upstream exchange
    pub upstream_timeout: Duration,
    /// Deadline for establishing the upstream connection
    pub upstream_connect_timeout: Duration,
}

/// Shared state for the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    matcher: Arc<ArcSwap<Matcher>>,
    limiter: Arc<Limiter>,
    store: Arc<dyn SlidingWindowStore>,
    client: reqwest::Client,
    upstream_url: String,
    trust_forwarded_for: bool,
    store_timeout: Duration,
    broker: Option<EventBroker>,
}

impl ProxyState {
    /// Create proxy state targeting the configured upstream.
    pub fn new(
        config: ProxyConfig,
        matcher: Matcher,
        limiter: Limiter,
        store: Arc<dyn SlidingWindowStore>,
    ) -> Result<Self> {
        if !config.upstream_url.starts_with("http://")
            && !config.upstream_url.starts_with("https://")
        {
            return Err(GatewayError::Config(format!(
                "upstream URL must start with http:// or https://, got: {}",
                config.upstream_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            matcher: Arc::new(ArcSwap::from_pointee(matcher)),
            limiter: Arc::new(limiter),
            store,
            client,
            upstream_url: config.upstream_url.trim_end_matches('/').to_string(),
            trust_forwarded_for: config.trust_forwarded_for,
            store_timeout: config.store_timeout,
            broker: None,
        })
    }

    /// Attach an event broker that receives one event per request outcome.
    pub fn with_event_broker(mut self, broker: EventBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Atomically replace the active rule set.
    ///
    /// In-flight requests keep the snapshot they loaded at entry; requests
    /// that start after the swap see the new set. Called by the rule
    /// management collaborator after every successful mutation.
    pub fn set_matcher(&self, matcher: Matcher) {
        let count = matcher.len();
        self.matcher.store(Arc::new(matcher));
        info!(rules = count, "rules: reloaded active rule set");
    }

    fn publish(&self, event: Event) {
        if let Some(broker) = &self.broker {
            broker.publish(event);
        }
    }
}

/// Proxy handler: derive identity, match a rule, consult the limiter,
/// forward or reject, and emit the outcome event.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(suffix): Path<String>,
    req: Request,
) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().as_str().to_uppercase();
    let path = format!("/{}", suffix);
    let query = req.uri().query().map(str::to_string);

    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let client_id = client_identity(req.headers(), remote_addr, state.trust_forwarded_for);

    debug!(method = %method, path = %path, client_id = %client_id, "incoming request");

    // One snapshot per request; a concurrent set_matcher does not affect us.
    let matcher = state.matcher.load_full();
    let matched = matcher.match_request(&method, &path);

    let (rule, check) = match matched {
        Some(m) => {
            let identity = rule_identity(&m.rule, req.headers(), &client_id);
            let key = format!("rule:{}:{}", m.rule.name, identity);
            let check = tokio::time::timeout(
                state.store_timeout,
                state
                    .store
                    .check_sliding_window(&key, m.rule.limit, m.rule.window()),
            )
            .await;
            (Some(m.rule), check)
        }
        None => {
            let check =
                tokio::time::timeout(state.store_timeout, state.limiter.allow(&client_id)).await;
            (None, check)
        }
    };

    let decision = match check {
        Ok(Ok(decision)) => Some(decision),
        Ok(Err(err)) => {
            warn!(error = %err, "rate limit store unavailable, failing open");
            None
        }
        Err(_) => {
            warn!("rate limit store call timed out, failing open");
            None
        }
    };

    let rule_name = rule.as_ref().map(|r| r.name.clone()).unwrap_or_default();

    match decision {
        // Store could not decide: admit the request, report empty limits.
        None => match forward(&state, req, &path, query.as_deref()).await {
            Ok(response) => {
                state.publish(Event {
                    timestamp: Utc::now(),
                    client_id,
                    method,
                    path,
                    allowed: true,
                    rule_name,
                    limit: 0,
                    remaining: 0,
                    status: response.status().as_u16(),
                    response_ms: started.elapsed().as_millis() as i64,
                });
                response
            }
            Err(err) => bad_gateway(err, None, &rule_name),
        },
        Some(decision) if !decision.allowed => {
            state.publish(Event {
                timestamp: Utc::now(),
                client_id: client_id.clone(),
                method,
                path,
                allowed: false,
                rule_name: rule_name.clone(),
                limit: decision.limit,
                remaining: decision.remaining,
                status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                response_ms: 0,
            });
            warn!(client_id = %client_id, rule = %rule_name, "rate limit exceeded");
            rate_limited_response(&decision, &rule_name)
        }
        Some(decision) => match forward(&state, req, &path, query.as_deref()).await {
            Ok(mut response) => {
                apply_rate_limit_headers(response.headers_mut(), &decision, &rule_name);
                state.publish(Event {
                    timestamp: Utc::now(),
                    client_id,
                    method,
                    path,
                    allowed: true,
                    rule_name,
                    limit: decision.limit,
                    remaining: decision.remaining,
                    status: response.status().as_u16(),
                    response_ms: started.elapsed().as_millis() as i64,
                });
                response
            }
            // The forward failure is a transport concern; the admission
            // decision does not produce a second event here.
            Err(err) => bad_gateway(err, Some(&decision), &rule_name),
        },
    }
}

/// Stream the request to the upstream and the response back, without
/// buffering either body.
async fn forward(
    state: &ProxyState,
    req: Request,
    path: &str,
    query: Option<&str>,
) -> Result<Response<Body>> {
    let mut url = format!("{}{}", state.upstream_url, path);
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }

    let (parts, body) = req.into_parts();

    let mut upstream_req = state
        .client
        .request(parts.method, url.as_str())
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    for (name, value) in parts.headers.iter() {
        if !skip_forwarding(name.as_str()) {
            upstream_req = upstream_req.header(name, value);
        }
    }

    let upstream_res = upstream_req.send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout(format!("upstream request timed out: {}", e))
        } else {
            GatewayError::Upstream(format!("upstream request failed: {}", e))
        }
    })?;

    let mut builder = Response::builder().status(upstream_res.status());
    for (name, value) in upstream_res.headers().iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from_stream(upstream_res.bytes_stream()))
        .map_err(|e| GatewayError::Internal(format!("failed to build response: {}", e)))
}

/// Derive the client identity for rate limiting.
///
/// X-Forwarded-For is only honoured under explicit configuration, and only
/// its leftmost non-empty token is used; operators behind chained proxies
/// are expected to normalise upstream.
fn client_identity(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        if let Some(xff) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = xff.split(',').map(str::trim).find(|t| !t.is_empty()) {
                return first.to_string();
            }
        }
    }

    if let Some(addr) = remote_addr {
        return addr.ip().to_string();
    }

    "unknown".to_string()
}

/// Resolve the rate limit identity for a matched rule, falling back to the
/// derived client identity when the configured header is absent or empty.
fn rule_identity(rule: &Rule, headers: &HeaderMap, client_id: &str) -> String {
    if rule.identify_by == IdentifyBy::Header {
        if let Some(value) = headers
            .get(rule.header_name.as_str())
            .and_then(|v| v.to_str().ok())
        {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    client_id.to_string()
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision, rule_name: &str) {
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_at.timestamp().to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
    if !rule_name.is_empty() {
        if let Ok(v) = HeaderValue::from_str(rule_name) {
            headers.insert("X-RateLimit-Rule", v);
        }
    }
}

fn rate_limited_response(decision: &Decision, rule_name: &str) -> Response<Body> {
    let mut body = json!({
        "error": "rate limit exceeded",
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset_at": decision.reset_at,
    });
    if !rule_name.is_empty() {
        body["rule"] = json!(rule_name);
    }

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision, rule_name);
    response
}

fn bad_gateway(err: GatewayError, decision: Option<&Decision>, rule_name: &str) -> Response<Body> {
    warn!(error = %err, "upstream exchange failed");

    let mut response =
        (StatusCode::BAD_GATEWAY, Json(json!({ "error": "bad gateway" }))).into_response();
    if let Some(decision) = decision {
        apply_rate_limit_headers(response.headers_mut(), decision, rule_name);
    }
    response
}

/// Hop-by-hop headers are connection-scoped and must not cross the proxy.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers stripped from the upstream request: hop-by-hop headers plus the
/// ones the client rewrites for the new connection (host, content-length for
/// the streamed body).
fn skip_forwarding(name: &str) -> bool {
    if is_hop_by_hop_header(name) {
        return true;
    }
    matches!(name.to_lowercase().as_str(), "host" | "content-length")
}
