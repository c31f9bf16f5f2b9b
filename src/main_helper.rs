use clap::Parser;
use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::db::DbPool;
use crate::hardening::{CircuitRegistry, RateLimiter, RetryConfig};
use crate::search::{CompletionProvider, PassageSearch};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "quotient.db")]
    pub database: String,
    #[arg(long, default_value = "https://openrouter.ai/api/v1")]
    pub upstream_base_url: String,
    #[arg(long, default_value = "anthropic/claude-sonnet-4.5")]
    pub model: String,
    #[arg(long, default_value = "http://127.0.0.1:9200/search")]
    pub search_url: String,
    #[arg(long, default_value_t = crate::constants::SESSION_TTL_SECS)]
    pub session_ttl_secs: i64,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 30)]
    pub circuit_reset_secs: u64,
    #[arg(long, default_value_t = 20)]
    pub rate_limit_per_minute: u32,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub cache: ResponseCache,
    pub completion: Arc<dyn CompletionProvider>,
    pub search: Arc<dyn PassageSearch>,
    pub circuits: Arc<CircuitRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub retry: RetryConfig,
    pub session_ttl_secs: i64,
}
