#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use quotient::cache::ResponseCache;
use quotient::hardening::{
    CircuitBreakerConfig, CircuitRegistry, RateLimiter, RateLimiterConfig, RetryConfig,
};
use quotient::ingress::build_router;
use quotient::search::{CompletionProvider, PassageSearch, PromptMessage};
use quotient::types::{QuotientError, Quote, Result};
use quotient::AppState;

pub fn ra_quote() -> Quote {
    Quote {
        text: "Ra: I am Ra.".to_string(),
        reference: "1.1".to_string(),
        url: "u".to_string(),
    }
}

/// Completion collaborator driven entirely by a script.
pub struct ScriptedCompletion {
    pub opening: String,
    pub suggestions: String,
    pub deltas: Vec<String>,
    /// Send a transient failure into the stream after this many deltas.
    pub fail_stream_after: Option<usize>,
    /// Stop sending after this many deltas without closing the stream.
    pub hang_stream_after: Option<usize>,
    pub fail_complete: bool,
    pub delta_gap: Duration,
}

impl ScriptedCompletion {
    pub fn new(deltas: Vec<&str>) -> Self {
        Self {
            opening: "The sources frame this succinctly.".to_string(),
            suggestions: "What is density?\nWhy does polarity matter?".to_string(),
            deltas: deltas.into_iter().map(String::from).collect(),
            fail_stream_after: None,
            hang_stream_after: None,
            fail_complete: false,
            delta_gap: Duration::from_millis(5),
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(&self, messages: &[PromptMessage], _max_tokens: u32) -> Result<String> {
        if self.fail_complete {
            return Err(QuotientError::Upstream(
                axum::http::StatusCode::BAD_REQUEST,
                "model rejected the prompt".to_string(),
            )
            .into());
        }
        let is_suggestion_call = messages
            .last()
            .map(|m| m.content.contains("follow-up"))
            .unwrap_or(false);
        if is_suggestion_call {
            Ok(self.suggestions.clone())
        } else {
            Ok(self.opening.clone())
        }
    }

    async fn stream(&self, _messages: &[PromptMessage]) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(16);
        let deltas = self.deltas.clone();
        let fail_after = self.fail_stream_after;
        let hang_after = self.hang_stream_after;
        let gap = self.delta_gap;

        tokio::spawn(async move {
            for (i, delta) in deltas.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(QuotientError::Upstream(
                            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                            "connection reset by peer".to_string(),
                        )
                        .into()))
                        .await;
                    return;
                }
                if hang_after == Some(i) {
                    // Keep the channel open forever without sending.
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(gap).await;
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Search collaborator returning a fixed passage list and recording queries.
pub struct FixedSearch {
    pub quotes: Vec<Quote>,
    pub queries: Mutex<Vec<String>>,
    pub fail_times: Mutex<u32>,
}

impl FixedSearch {
    pub fn new(quotes: Vec<Quote>) -> Self {
        Self {
            quotes,
            queries: Mutex::new(Vec::new()),
            fail_times: Mutex::new(0),
        }
    }
}

#[async_trait]
impl PassageSearch for FixedSearch {
    async fn search(
        &self,
        query: &str,
        _limit: usize,
        _include_secondary: bool,
    ) -> Result<Vec<Quote>> {
        {
            let mut remaining = self.fail_times.lock().expect("fail_times lock");
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QuotientError::Upstream(
                    axum::http::StatusCode::SERVICE_UNAVAILABLE,
                    "search overloaded".to_string(),
                )
                .into());
            }
        }
        self.queries
            .lock()
            .expect("queries lock")
            .push(query.to_string());
        Ok(self.quotes.clone())
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub base_url: String,
    _db_file: tempfile::NamedTempFile,
}

pub async fn spawn_app(
    completion: Arc<dyn CompletionProvider>,
    search: Arc<dyn PassageSearch>,
    max_retries: u32,
    rate_limit_per_minute: u32,
) -> TestApp {
    let db_file = tempfile::NamedTempFile::new().expect("temp db");
    let db = quotient::db::init_db(db_file.path(), quotient::constants::SESSION_TTL_SECS)
        .await
        .expect("init db");

    let state = Arc::new(AppState {
        db: db.clone(),
        cache: ResponseCache::new(db),
        completion,
        search,
        circuits: Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
        rate_limiter: Arc::new(RateLimiter::new(RateLimiterConfig {
            max_requests: rate_limit_per_minute,
            window: Duration::from_secs(60),
        })),
        retry: RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            ..Default::default()
        },
        session_ttl_secs: quotient::constants::SESSION_TTL_SECS,
    });

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });

    TestApp {
        state,
        base_url: format!("http://{}", addr),
        _db_file: db_file,
    }
}
