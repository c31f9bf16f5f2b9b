use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cache::ResponseCache;
use crate::constants::{CANDIDATE_QUOTE_LIMIT, SUGGESTION_WAIT_MS};
use crate::extractor::{MarkerExtractor, Segment};
use crate::hardening::{is_retryable_error, with_retry};
use crate::logging::StreamMetric;
use crate::main_helper::AppState;
use crate::protocol::{ChunkPayload, StreamEvent};
use crate::search::{PromptMessage, PromptRole};
use crate::types::{ChatRequest, ChatRole, ObservedError, Quote, Result};

const CITATION_SYSTEM_PROMPT: &str = "You answer questions about the source material. \
Candidate passages are numbered below. When a passage directly supports a sentence, \
cite it inline with {{QUOTE:n}} where n is the passage number, or \
{{QUOTE:n:sA:sB}} to cite sentences A through B of that passage. Never invent \
passage numbers and never quote text that is not in a passage.";

const OPENING_SYSTEM_PROMPT: &str = "You answer questions about the source material. \
Write only a short opening paragraph (two or three sentences) that frames the answer. \
Do not cite passages yet; supporting passages will be added afterwards.";

const CONTINUATION_PROMPT: &str = "Continue the answer you started above. \
Weave in the numbered passages where they genuinely support a point, citing them \
inline with {{QUOTE:n}} or {{QUOTE:n:sA:sB}}. Do not repeat the opening paragraph.";

const SUGGESTION_PROMPT: &str = "Given the conversation above, propose three short \
follow-up questions the reader might ask next. Return one question per line with \
no numbering.";

type EventSender = mpsc::Sender<std::result::Result<axum::response::sse::Event, ObservedError>>;

/// Writes every event to the cache, then best-effort delivers it to the live
/// connection. A dead client stops delivery but never stops generation, which
/// is what makes recovery from the cache possible.
struct Emitter {
    cache: ResponseCache,
    response_id: String,
    tx: EventSender,
    client_gone: bool,
}

impl Emitter {
    async fn emit(&mut self, event: StreamEvent) {
        if let Err(e) = self.cache.append(&self.response_id, &event).await {
            tracing::error!(
                "Failed to cache {} event for {}: {}",
                event.event_name(),
                self.response_id,
                e
            );
        }
        if !self.client_gone && self.tx.send(Ok(event.to_sse())).await.is_err() {
            tracing::debug!(
                "Client disconnected mid-stream for {}; continuing for the cache",
                self.response_id
            );
            self.client_gone = true;
        }
    }
}

pub struct StreamGenerator;

impl StreamGenerator {
    /// Entry point for one answer stream. Runs on its own task, detached from
    /// the HTTP response, and always terminates the stream with `done` or
    /// `error`.
    pub async fn run(
        state: Arc<AppState>,
        request: ChatRequest,
        response_id: String,
        tx: EventSender,
    ) {
        if let Err(e) = state.cache.create(&response_id).await {
            tracing::error!("Failed to create cache session {}: {}", response_id, e);
        }

        let mut emitter = Emitter {
            cache: state.cache.clone(),
            response_id: response_id.clone(),
            tx,
            client_gone: false,
        };

        emitter
            .emit(StreamEvent::Session {
                response_id: response_id.clone(),
            })
            .await;

        match Self::generate(&state, &request, &mut emitter).await {
            Ok(()) => {
                Self::finish_with_suggestions(&state, &request, &mut emitter).await;
            }
            Err(e) => {
                tracing::error!("Generation failed for {}: {}", response_id, e);
                emitter
                    .emit(StreamEvent::Error {
                        code: e.inner.code().to_string(),
                        message: e.inner.to_string(),
                        retryable: is_retryable_error(&e),
                    })
                    .await;
            }
        }
    }

    async fn generate(
        state: &Arc<AppState>,
        request: &ChatRequest,
        emitter: &mut Emitter,
    ) -> Result<()> {
        match quote_search_query(&request.message) {
            Some(query) => Self::generate_quote_search(state, request, &query, emitter).await,
            None => Self::generate_standard(state, request, emitter).await,
        }
    }

    /// Quote-search mode: the user asked for a passage directly, so the
    /// search runs on their own words and a single citation-tuned model call
    /// streams the answer.
    async fn generate_quote_search(
        state: &Arc<AppState>,
        request: &ChatRequest,
        query: &str,
        emitter: &mut Emitter,
    ) -> Result<()> {
        let quotes = Self::fetch_quotes(state, query, request.include_confederation).await?;
        emitter
            .emit(StreamEvent::Meta {
                quotes: quotes.clone(),
            })
            .await;

        let mut messages = vec![PromptMessage::system(system_prompt(
            CITATION_SYSTEM_PROMPT,
            request,
        ))];
        push_history(&mut messages, request);
        messages.push(PromptMessage::user(format!(
            "{}\n\n{}",
            request.message,
            passages_block(&quotes)
        )));

        Self::stream_answer(state, messages, quotes, emitter).await
    }

    /// Standard mode, three phases: a fast non-streamed opening paragraph so
    /// the client has something to animate, then a search seeded with that
    /// paragraph, then a streamed continuation over the found passages.
    async fn generate_standard(
        state: &Arc<AppState>,
        request: &ChatRequest,
        emitter: &mut Emitter,
    ) -> Result<()> {
        let mut opening_messages = vec![PromptMessage::system(system_prompt(
            OPENING_SYSTEM_PROMPT,
            request,
        ))];
        push_history(&mut opening_messages, request);
        opening_messages.push(PromptMessage::user(request.message.clone()));

        let completion = state.completion.clone();
        let retry = state.retry.clone();
        let opening = state
            .circuits
            .guard("completion", || {
                let completion = completion.clone();
                let messages = opening_messages.clone();
                async move {
                    with_retry(&retry, move || {
                        let completion = completion.clone();
                        let messages = messages.clone();
                        async move { completion.complete(&messages, 300).await }
                    })
                    .await
                }
            })
            .await?;

        emitter
            .emit(StreamEvent::Chunk(ChunkPayload::Text {
                content: opening.clone(),
            }))
            .await;

        let quotes = Self::fetch_quotes(state, &opening, request.include_confederation).await?;
        emitter
            .emit(StreamEvent::Meta {
                quotes: quotes.clone(),
            })
            .await;

        let mut messages = vec![PromptMessage::system(system_prompt(
            CITATION_SYSTEM_PROMPT,
            request,
        ))];
        push_history(&mut messages, request);
        messages.push(PromptMessage::user(request.message.clone()));
        messages.push(PromptMessage::assistant(opening));
        messages.push(PromptMessage::user(format!(
            "{}\n\n{}",
            CONTINUATION_PROMPT,
            passages_block(&quotes)
        )));

        Self::stream_answer(state, messages, quotes, emitter).await
    }

    /// Drives the model token stream through the marker extractor. No retries
    /// here: once emission has begun, a failure ends the stream and the
    /// client's recovery path takes over.
    async fn stream_answer(
        state: &Arc<AppState>,
        messages: Vec<PromptMessage>,
        quotes: Vec<Quote>,
        emitter: &mut Emitter,
    ) -> Result<()> {
        let mut extractor = MarkerExtractor::new(quotes);
        let mut metric = StreamMetric::new();
        let mut rx = state.completion.stream(&messages).await?;

        while let Some(delta) = rx.recv().await {
            let delta = delta?;
            for segment in extractor.push(&delta) {
                metric.record_segment(&segment);
                emitter.emit(segment_event(segment)).await;
            }
        }

        if let Some(segment) = extractor.finish() {
            metric.record_segment(&segment);
            emitter.emit(segment_event(segment)).await;
        }

        metric.log_summary();
        Ok(())
    }

    async fn fetch_quotes(
        state: &Arc<AppState>,
        query: &str,
        include_secondary: bool,
    ) -> Result<Vec<Quote>> {
        let search = state.search.clone();
        let retry = state.retry.clone();
        let query = query.to_string();
        state
            .circuits
            .guard("passage-search", || {
                let search = search.clone();
                async move {
                    with_retry(&retry, move || {
                        let search = search.clone();
                        let query = query.clone();
                        async move {
                            search
                                .search(&query, CANDIDATE_QUOTE_LIMIT, include_secondary)
                                .await
                        }
                    })
                    .await
                }
            })
            .await
    }

    /// Suggestions are best-effort: if they arrive within a short grace
    /// window they ride the live stream before `done`; otherwise `done` goes
    /// out and the finished suggestions are appended to the cache only, where
    /// the client's polling finds them.
    async fn finish_with_suggestions(
        state: &Arc<AppState>,
        request: &ChatRequest,
        emitter: &mut Emitter,
    ) {
        let completion = state.completion.clone();
        let mut suggestion_messages = Vec::new();
        push_history(&mut suggestion_messages, request);
        suggestion_messages.push(PromptMessage::user(request.message.clone()));
        suggestion_messages.push(PromptMessage::user(SUGGESTION_PROMPT.to_string()));

        let mut handle = tokio::spawn(async move {
            completion.complete(&suggestion_messages, 150).await
        });

        match tokio::time::timeout(Duration::from_millis(SUGGESTION_WAIT_MS), &mut handle).await
        {
            Ok(joined) => {
                if let Ok(Ok(raw)) = joined {
                    let items = parse_suggestions(&raw);
                    if !items.is_empty() {
                        emitter.emit(StreamEvent::Suggestions { items }).await;
                    }
                }
                emitter.emit(StreamEvent::Done).await;
            }
            Err(_) => {
                emitter.emit(StreamEvent::Done).await;
                let cache = emitter.cache.clone();
                let response_id = emitter.response_id.clone();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(raw)) => {
                            let items = parse_suggestions(&raw);
                            if items.is_empty() {
                                return;
                            }
                            if let Err(e) = cache
                                .append(&response_id, &StreamEvent::Suggestions { items })
                                .await
                            {
                                tracing::warn!(
                                    "Failed to cache late suggestions for {}: {}",
                                    response_id,
                                    e
                                );
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::debug!("Suggestion generation failed: {}", e);
                        }
                        Err(e) => {
                            tracing::debug!("Suggestion task join error: {}", e);
                        }
                    }
                });
            }
        }
    }
}

fn segment_event(segment: Segment) -> StreamEvent {
    match segment {
        Segment::Text(content) => StreamEvent::Chunk(ChunkPayload::Text { content }),
        Segment::Citation(quote) => StreamEvent::Chunk(ChunkPayload::from_quote(quote)),
    }
}

fn system_prompt(base: &str, request: &ChatRequest) -> String {
    let mut prompt = base.to_string();
    if request.thinking_mode {
        prompt.push_str(" Reason carefully and cover nuance rather than brevity.");
    }
    if let Some(lang) = &request.target_language {
        prompt.push_str(&format!(" Answer in {}.", lang));
    }
    prompt
}

fn push_history(messages: &mut Vec<PromptMessage>, request: &ChatRequest) {
    for entry in &request.history {
        messages.push(PromptMessage {
            role: match entry.role {
                ChatRole::User => PromptRole::User,
                ChatRole::Assistant => PromptRole::Assistant,
            },
            content: entry.content.clone(),
        });
    }
}

fn passages_block(quotes: &[Quote]) -> String {
    if quotes.is_empty() {
        return "No candidate passages were found.".to_string();
    }
    let mut block = String::from("Candidate passages:\n");
    for (i, quote) in quotes.iter().enumerate() {
        block.push_str(&format!("{}. [{}] {}\n", i + 1, quote.reference, quote.text));
    }
    block
}

fn parse_suggestions(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).trim())
        .filter(|l| !l.is_empty())
        .take(3)
        .map(|l| l.to_string())
        .collect()
}

/// Quote-search mode triggers on an explicitly quoted span, or on the word
/// "quote" anywhere in the message.
pub fn quote_search_query(message: &str) -> Option<String> {
    if let Some(start) = message.find('"') {
        if let Some(len) = message[start + 1..].find('"') {
            let inner = message[start + 1..start + 1 + len].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }

    let lower = message.to_lowercase();
    let mentions_quote = lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == "quote" || w == "quotes");
    if mentions_quote {
        return Some(message.to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_span_selects_quote_search_mode() {
        let query = quote_search_query("Find the passage \"I am Ra\" please");
        assert_eq!(query.as_deref(), Some("I am Ra"));
    }

    #[test]
    fn test_quote_keyword_selects_quote_search_mode() {
        let query = quote_search_query("Can you give me a quote about service?");
        assert!(query.is_some());
    }

    #[test]
    fn test_plain_question_selects_standard_mode() {
        assert!(quote_search_query("What is the law of one?").is_none());
    }

    #[test]
    fn test_empty_quoted_span_ignored() {
        assert!(quote_search_query("an empty \"\" span").is_none());
    }

    #[test]
    fn test_parse_suggestions_strips_bullets() {
        let items = parse_suggestions("- What is density?\n* Why polarity?\n\nThird one\nFourth");
        assert_eq!(
            items,
            vec!["What is density?", "Why polarity?", "Third one"]
        );
    }

    #[test]
    fn test_passages_block_numbering_is_one_based() {
        let block = passages_block(&[Quote {
            text: "Ra: I am Ra.".into(),
            reference: "1.1".into(),
            url: "u".into(),
        }]);
        assert!(block.contains("1. [1.1] Ra: I am Ra."));
    }
}
