use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quotient::cache::ResponseCache;
use quotient::db::{cleanup_expired, init_db};
use quotient::hardening::{
    CircuitBreakerConfig, CircuitRegistry, RateLimiter, RateLimiterConfig, RetryConfig,
};
use quotient::ingress::build_router;
use quotient::search::{HttpCompletionProvider, HttpPassageSearch};
use quotient::{AppState, Args};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "quotient=debug".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "quotient.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    quotient::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let db = match init_db(&args.database, args.session_ttl_secs).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_key = match std::env::var("UPSTREAM_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: UPSTREAM_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let completion = Arc::new(HttpCompletionProvider::new(
        client.clone(),
        args.upstream_base_url.clone(),
        api_key,
        args.model.clone(),
    ));
    let search = Arc::new(HttpPassageSearch::new(
        client.clone(),
        args.search_url.clone(),
    ));

    let circuits = Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
        failure_threshold: args.circuit_breaker_threshold,
        reset_after: Duration::from_secs(args.circuit_reset_secs),
    }));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        max_requests: args.rate_limit_per_minute,
        window: Duration::from_secs(60),
    }));

    let state = Arc::new(AppState {
        db: db.clone(),
        cache: ResponseCache::new(db.clone()),
        completion,
        search,
        circuits,
        rate_limiter,
        retry: RetryConfig {
            max_retries: args.max_retries,
            ..Default::default()
        },
        session_ttl_secs: args.session_ttl_secs,
    });

    // Expired sessions are also swept periodically, not only at startup.
    let cleanup_pool = db.clone();
    let ttl = args.session_ttl_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match cleanup_expired(&cleanup_pool, ttl).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!("Swept {} expired stream sessions", removed);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Session sweep failed: {}", e),
            }
        }
    });

    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Quotient listening on {}", addr);
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        tracing::error!("Server error: {}", e);
    }
}
