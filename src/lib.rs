pub mod analytics;
pub mod config;
pub mod error;
pub mod events;
pub mod proxy;
pub mod rate_limit;
pub mod rules;
pub mod stream;

use crate::analytics::{AnalyticsSink, SinkConfig};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::events::EventBroker;
use crate::proxy::{proxy_handler, ProxyConfig, ProxyState};
use crate::rate_limit::{Limiter, RedisStore, SlidingWindowStore};
use crate::rules::Matcher;
use axum::{
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Initialize and run the gateway until a shutdown signal arrives.
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    info!("Starting limitgate");
    info!(
        "Server listening on {}:{}, proxying {} -> {}",
        config.server.host, config.server.port, config.server.proxy_prefix, config.upstream.url
    );

    let store: Arc<dyn SlidingWindowStore> = Arc::new(RedisStore::connect(&config.redis.url).await?);

    let limiter = Limiter::new(
        Arc::clone(&store),
        config.rate_limit.requests,
        config.rate_limit.window(),
    )?;

    let broker = EventBroker::new(config.events.buffer_size);

    // The analytics sink subscribes to the broker like any other consumer;
    // a full sink never slows the request path.
    let sink = match &config.analytics {
        Some(analytics_cfg) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&analytics_cfg.database_url)
                .await?;

            let sink = Arc::new(AnalyticsSink::new(
                pool,
                SinkConfig {
                    buffer_size: analytics_cfg.buffer_size,
                    batch_size: analytics_cfg.batch_size,
                    flush_interval: analytics_cfg.flush_interval(),
                },
            ));

            let mut subscription = broker.subscribe();
            let sink_task = Arc::clone(&sink);
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    sink_task.log(event);
                }
            });

            info!("analytics persistence enabled");
            Some(sink)
        }
        None => {
            info!("analytics persistence disabled (no database configured)");
            None
        }
    };

    // Boot with an empty rule set; the rule management collaborator pushes
    // the active set through ProxyState::set_matcher.
    let matcher = Matcher::new(Vec::new())?;

    let proxy_state = ProxyState::new(
        ProxyConfig {
            upstream_url: config.upstream.url.clone(),
            trust_forwarded_for: config.trust_forwarded_for,
            store_timeout: Duration::from_secs(config.redis.store_timeout_secs),
            upstream_timeout: Duration::from_secs(config.upstream.timeout_secs),
            upstream_connect_timeout: Duration::from_secs(config.upstream.connect_timeout_secs),
        },
        matcher,
        limiter,
        store,
    )?
    .with_event_broker(broker.clone());

    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(
            Router::new()
                .route("/events/stream", get(stream::events_stream))
                .with_state(broker),
        )
        .merge(
            Router::new()
                .route(
                    &format!("{}/*path", config.server.proxy_prefix),
                    any(proxy_handler),
                )
                .with_state(proxy_state),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!("Gateway ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    if let Some(sink) = sink {
        info!("draining analytics sink");
        if let Err(e) = sink.close(config.server.shutdown_timeout()).await {
            error!("failed to drain analytics sink: {}", e);
        }
    }

    info!("Gateway stopped");

    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "limitgate" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining");
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "limitgate=debug,tower_http=debug".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
