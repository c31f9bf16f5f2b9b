use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::StoredEvent;
use crate::constants::{
    INCOMPLETE_NOTICE, SUGGESTION_POLL_INTERVAL_MS, SUGGESTION_POLL_MAX_ATTEMPTS,
    TOTAL_FAILURE_MESSAGE,
};
use crate::protocol::{ChunkPayload, FrameDecoder, StreamEvent};
use crate::types::{AnimationChunk, ChatRequest, ObservedError, QuotientError, Quote, Result};
use crate::visibility::VisibilityMonitor;

/// Cancellation handle for one in-flight answer stream. The user-cancel flag
/// separates a deliberate cancellation (silent) from a stale-connection
/// cancellation (which triggers recovery); the progress epoch lets the
/// visibility monitor tell a stalled stream from a live one.
#[derive(Clone)]
pub struct StreamHandle {
    pub token: CancellationToken,
    user_cancelled: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            user_cancelled: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliberate teardown by the user (new conversation, navigation away).
    pub fn cancel_by_user(&self) {
        self.user_cancelled.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_user_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }

    pub fn progress_epoch(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    fn bump_progress(&self) {
        self.progress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        Arc::ptr_eq(&self.progress, &other.progress)
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Streaming,
    Recovering,
    Done,
    Errored,
}

/// Everything accumulated from one answer stream. Meta and suggestions are
/// assignments, not appends, so replaying a cached event list is idempotent.
#[derive(Debug, Default)]
pub struct Transcript {
    pub response_id: Option<String>,
    pub quotes: Vec<Quote>,
    pub suggestions: Vec<String>,
    pub text_chars: usize,
    pub quote_count: usize,
    pub chunk_count: usize,
    pub done: bool,
}

impl Transcript {
    /// Replay rebuilds the display from the cache, so accumulated content
    /// state is dropped first; the response id survives.
    pub fn reset_content(&mut self) {
        self.quotes.clear();
        self.suggestions.clear();
        self.text_chars = 0;
        self.quote_count = 0;
        self.chunk_count = 0;
        self.done = false;
    }
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub state: ConsumerState,
    pub response_id: Option<String>,
    pub quotes: Vec<Quote>,
    pub suggestions: Vec<String>,
    pub text_chars: usize,
    pub chunk_count: usize,
    pub recovered: bool,
    pub error: Option<String>,
}

/// The one event-handling path shared by live streaming and cache replay.
pub fn apply_event(
    transcript: &mut Transcript,
    event: StreamEvent,
    on_chunk: &mut (dyn FnMut(AnimationChunk) + Send),
) {
    match event {
        StreamEvent::Session { response_id } => {
            transcript.response_id = Some(response_id);
        }
        StreamEvent::Meta { quotes } => {
            transcript.quotes = quotes;
        }
        StreamEvent::Chunk(ChunkPayload::Text { content }) => {
            transcript.chunk_count += 1;
            transcript.text_chars += content.chars().count();
            on_chunk(AnimationChunk::Text { content });
        }
        StreamEvent::Chunk(ChunkPayload::Quote {
            text,
            reference,
            url,
        }) => {
            transcript.chunk_count += 1;
            transcript.quote_count += 1;
            on_chunk(AnimationChunk::Quote {
                quote: Quote {
                    text,
                    reference,
                    url,
                },
            });
        }
        StreamEvent::Suggestions { items } => {
            transcript.suggestions = items;
        }
        StreamEvent::Done => {
            transcript.done = true;
        }
        // Historical error events carry no display state; the live path
        // surfaces them as failures before reaching here.
        StreamEvent::Error { .. } => {}
    }
}

/// Replays a cached event list through `apply_event`, skipping terminal
/// error records.
pub fn replay_events(
    events: &[StoredEvent],
    transcript: &mut Transcript,
    on_chunk: &mut (dyn FnMut(AnimationChunk) + Send),
) {
    for stored in events {
        let event = match stored.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Skipping undecodable cached event: {}", e);
                continue;
            }
        };
        if matches!(event, StreamEvent::Error { .. }) {
            continue;
        }
        apply_event(transcript, event, on_chunk);
    }
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub base_url: String,
    pub suggestion_poll_interval: Duration,
    pub suggestion_poll_max_attempts: u32,
}

impl ChatClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            suggestion_poll_interval: Duration::from_millis(SUGGESTION_POLL_INTERVAL_MS),
            suggestion_poll_max_attempts: SUGGESTION_POLL_MAX_ATTEMPTS,
        }
    }
}

#[derive(serde::Deserialize)]
struct RecoverResponse {
    events: Vec<StoredEvent>,
    #[allow(dead_code)]
    complete: bool,
}

/// Consumes the chat SSE stream and owns the recovery protocol. At most one
/// in-flight request is tracked; a new send cancels the previous handle,
/// which also tears down any suggestion polling chained to it.
pub struct ChatClient {
    http: reqwest::Client,
    config: ChatClientConfig,
    slot: Mutex<Option<StreamHandle>>,
    monitor: Option<Arc<VisibilityMonitor>>,
    suggestion_sink: Mutex<Option<mpsc::UnboundedSender<Vec<String>>>>,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, config: ChatClientConfig) -> Self {
        Self {
            http,
            config,
            slot: Mutex::new(None),
            monitor: None,
            suggestion_sink: Mutex::new(None),
        }
    }

    /// Attach the page-lifetime visibility monitor. The client registers its
    /// stream handle there so prolonged backgrounding can force recovery.
    pub fn with_monitor(mut self, monitor: Arc<VisibilityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Late suggestions (found by polling after a recovery) are delivered
    /// here, since `send` has already returned by then.
    pub fn set_suggestion_sink(&self, tx: mpsc::UnboundedSender<Vec<String>>) {
        *self.suggestion_sink.lock().expect("suggestion sink lock") = Some(tx);
    }

    /// Deliberately cancel the in-flight request, silently.
    pub fn cancel_current(&self) {
        let slot = self.slot.lock().expect("slot lock");
        if let Some(handle) = slot.as_ref() {
            handle.cancel_by_user();
        }
    }

    pub async fn send(
        &self,
        request: &ChatRequest,
        on_chunk: &mut (dyn FnMut(AnimationChunk) + Send),
    ) -> ChatOutcome {
        let handle = StreamHandle::new();
        self.install(handle.clone());
        if let Some(monitor) = &self.monitor {
            monitor.register(Some(handle.clone()));
        }

        let mut transcript = Transcript::default();
        let result = self
            .run_stream(request, &handle, &mut transcript, on_chunk)
            .await;

        let outcome = match result {
            Ok(()) => {
                if transcript.suggestions.is_empty() {
                    if let Some(rid) = transcript.response_id.clone() {
                        self.spawn_suggestion_poll(rid, &handle);
                    }
                }
                outcome_from(ConsumerState::Done, &transcript, false, None)
            }
            Err(e) => self.handle_failure(e, &handle, &mut transcript, on_chunk).await,
        };

        if let Some(monitor) = &self.monitor {
            monitor.clear_if(&handle);
        }
        outcome
    }

    /// The previous handle stays cancellable until replaced; cancelling it
    /// here is what tears down a prior stream and its suggestion polling.
    fn install(&self, handle: StreamHandle) {
        let mut slot = self.slot.lock().expect("slot lock");
        if let Some(prev) = slot.take() {
            prev.cancel_by_user();
        }
        *slot = Some(handle);
    }

    async fn run_stream(
        &self,
        request: &ChatRequest,
        handle: &StreamHandle,
        transcript: &mut Transcript,
        on_chunk: &mut (dyn FnMut(AnimationChunk) + Send),
    ) -> Result<()> {
        let send_future = self
            .http
            .post(format!("{}/api/chat", self.config.base_url))
            .json(request)
            .send();

        let response = tokio::select! {
            _ = handle.token.cancelled() => return Err(QuotientError::Cancelled.into()),
            result = send_future => result.map_err(QuotientError::Network)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status, response).await);
        }

        let mut decoder = FrameDecoder::new();
        let mut body = response.bytes_stream();
        let mut byte_buffer: Vec<u8> = Vec::new();

        loop {
            let item = tokio::select! {
                _ = handle.token.cancelled() => return Err(QuotientError::Cancelled.into()),
                item = body.next() => item,
            };

            let bytes = match item {
                None => break,
                Some(Err(e)) => return Err(QuotientError::Network(e).into()),
                Some(Ok(bytes)) => bytes,
            };

            // A read can end mid-codepoint; only the valid UTF-8 prefix moves
            // into the frame decoder, the tail waits for the next read.
            byte_buffer.extend_from_slice(&bytes);
            let valid_len = match std::str::from_utf8(&byte_buffer) {
                Ok(_) => byte_buffer.len(),
                Err(e) => e.valid_up_to(),
            };
            if valid_len == 0 {
                continue;
            }
            let text = String::from_utf8_lossy(&byte_buffer[..valid_len]).into_owned();
            byte_buffer.drain(..valid_len);

            for frame in decoder.push(&text) {
                let event = frame.decode()?;
                handle.bump_progress();

                if let StreamEvent::Error { code, message, .. } = event {
                    return Err(QuotientError::Upstream(
                        axum::http::StatusCode::BAD_GATEWAY,
                        format!("{}: {}", code, message),
                    )
                    .into());
                }

                apply_event(transcript, event, on_chunk);
                if transcript.done {
                    return Ok(());
                }
            }
        }

        if transcript.done {
            Ok(())
        } else {
            Err(QuotientError::Protocol("stream ended without a done event".into()).into())
        }
    }

    async fn handle_failure(
        &self,
        error: ObservedError,
        handle: &StreamHandle,
        transcript: &mut Transcript,
        on_chunk: &mut (dyn FnMut(AnimationChunk) + Send),
    ) -> ChatOutcome {
        // A cancellation the user asked for is always silent.
        if matches!(error.inner, QuotientError::Cancelled) && handle.is_user_cancelled() {
            tracing::debug!("Stream cancelled by user; no recovery");
            return outcome_from(ConsumerState::Idle, transcript, false, None);
        }

        tracing::warn!("Stream failed ({}); attempting cache recovery", error);

        if let Some(response_id) = transcript.response_id.clone() {
            match self.recover(&response_id, transcript, on_chunk).await {
                Ok(true) => {
                    if transcript.suggestions.is_empty() {
                        self.spawn_suggestion_poll(response_id, handle);
                    }
                    return outcome_from(ConsumerState::Done, transcript, true, None);
                }
                Ok(false) => {
                    tracing::warn!("Recovery found no usable cache for {}", response_id);
                }
                Err(e) => {
                    tracing::warn!("Recovery fetch failed for {}: {}", response_id, e);
                }
            }
        }

        if transcript.chunk_count > 0 {
            // Content was already shown; degrade softly instead of erroring.
            on_chunk(AnimationChunk::Text {
                content: INCOMPLETE_NOTICE.to_string(),
            });
            transcript.done = true;
            return outcome_from(ConsumerState::Done, transcript, false, None);
        }

        let message = match &error.inner {
            QuotientError::Validation(m) => m.clone(),
            QuotientError::RateLimited { retry_after_secs } => {
                format!("Too many requests; try again in {}s", retry_after_secs)
            }
            _ => TOTAL_FAILURE_MESSAGE.to_string(),
        };
        outcome_from(ConsumerState::Errored, transcript, false, Some(message))
    }

    /// Single-shot recovery fetch. Succeeds only when the cached record holds
    /// at least one content chunk; session/meta alone would leave the UI
    /// stuck with nothing to show.
    async fn recover(
        &self,
        response_id: &str,
        transcript: &mut Transcript,
        on_chunk: &mut (dyn FnMut(AnimationChunk) + Send),
    ) -> Result<bool> {
        let session = match self.fetch_cached(response_id).await? {
            Some(session) => session,
            None => return Ok(false),
        };

        if !session.events.iter().any(|e| e.event == "chunk") {
            return Ok(false);
        }

        transcript.reset_content();
        replay_events(&session.events, transcript, on_chunk);
        transcript.done = true;
        Ok(true)
    }

    async fn fetch_cached(&self, response_id: &str) -> Result<Option<RecoverResponse>> {
        let response = self
            .http
            .get(format!(
                "{}/api/chat/recover?id={}",
                self.config.base_url, response_id
            ))
            .send()
            .await
            .map_err(QuotientError::Network)?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let body: RecoverResponse = response.json().await.map_err(QuotientError::Network)?;
        Ok(Some(body))
    }

    /// Bounded, fixed-interval re-fetches of the cache until suggestions
    /// appear. The poll runs under a child of the stream's token, so starting
    /// a new conversation cancels it.
    fn spawn_suggestion_poll(&self, response_id: String, handle: &StreamHandle) {
        let cancel = handle.token.child_token();
        let http = self.http.clone();
        let base_url = self.config.base_url.clone();
        let interval = self.config.suggestion_poll_interval;
        let max_attempts = self.config.suggestion_poll_max_attempts;
        let sink = self
            .suggestion_sink
            .lock()
            .expect("suggestion sink lock")
            .clone();

        tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let url = format!("{}/api/chat/recover?id={}", base_url, response_id);
                let response = match http.get(&url).send().await {
                    Ok(r) if r.status().is_success() => r,
                    _ => continue,
                };
                let body: RecoverResponse = match response.json().await {
                    Ok(b) => b,
                    Err(_) => continue,
                };

                let items = body
                    .events
                    .iter()
                    .find(|e| e.event == "suggestions")
                    .and_then(|e| e.data.get("items"))
                    .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok());

                if let Some(items) = items {
                    tracing::debug!(
                        "Suggestions appeared in cache for {} on poll attempt {}",
                        response_id,
                        attempt
                    );
                    if let Some(tx) = &sink {
                        let _ = tx.send(items);
                    }
                    return;
                }
            }
            tracing::debug!("Suggestion polling exhausted for {}", response_id);
        });
    }
}

async fn classify_http_status(
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> ObservedError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        return QuotientError::RateLimited { retry_after_secs }.into();
    }

    let body_error = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from));

    if status == reqwest::StatusCode::BAD_REQUEST {
        QuotientError::Validation(body_error.unwrap_or_else(|| "Invalid request".to_string()))
            .into()
    } else {
        QuotientError::Upstream(
            status,
            body_error.unwrap_or_else(|| "Upstream failure".to_string()),
        )
        .into()
    }
}

fn outcome_from(
    state: ConsumerState,
    transcript: &Transcript,
    recovered: bool,
    error: Option<String>,
) -> ChatOutcome {
    ChatOutcome {
        state,
        response_id: transcript.response_id.clone(),
        quotes: transcript.quotes.clone(),
        suggestions: transcript.suggestions.clone(),
        text_chars: transcript.text_chars,
        chunk_count: transcript.chunk_count,
        recovered,
        error,
    }
}
