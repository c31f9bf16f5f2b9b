mod support;

use std::sync::Arc;
use std::time::Duration;

use quotient::client::{ChatClient, ChatClientConfig, ConsumerState};
use quotient::types::{AnimationChunk, ChatRequest};

use support::{ra_quote, spawn_app, FixedSearch, ScriptedCompletion};

fn request(message: &str) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        history: Vec::new(),
        thinking_mode: false,
        target_language: None,
        include_confederation: false,
    }
}

fn client_for(base_url: &str) -> ChatClient {
    ChatClient::new(reqwest::Client::new(), ChatClientConfig::new(base_url))
}

#[tokio::test]
async fn test_standard_mode_full_flow_with_torn_marker() {
    let completion = Arc::new(ScriptedCompletion::new(vec![
        "The passages agree: ",
        "{{QUO",
        "TE:1}}",
        " closes the thought.",
    ]));
    let search = Arc::new(FixedSearch::new(vec![ra_quote()]));
    let app = spawn_app(completion, search, 0, 100).await;

    let client = client_for(&app.base_url);
    let mut chunks = Vec::new();
    let outcome = client
        .send(&request("What is the law of one?"), &mut |c| chunks.push(c))
        .await;

    assert_eq!(outcome.state, ConsumerState::Done);
    assert!(outcome.error.is_none());
    assert!(!outcome.recovered);
    assert_eq!(outcome.quotes, vec![ra_quote()]);
    assert!(!outcome.suggestions.is_empty());

    // Opening paragraph arrives first as its own text chunk.
    assert_eq!(
        chunks.first(),
        Some(&AnimationChunk::Text {
            content: "The sources frame this succinctly.".to_string()
        })
    );
    // The torn marker resolved into exactly one citation chunk.
    let citations: Vec<_> = chunks
        .iter()
        .filter_map(|c| match c {
            AnimationChunk::Quote { quote } => Some(quote.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(citations, vec![ra_quote()]);

    // Reassembled text keeps generation order with the marker removed.
    let text: String = chunks
        .iter()
        .filter_map(|c| match c {
            AnimationChunk::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        text,
        "The sources frame this succinctly.The passages agree:  closes the thought."
    );
}

#[tokio::test]
async fn test_quote_search_mode_uses_quoted_span() {
    let completion = Arc::new(ScriptedCompletion::new(vec!["Found it: ", "{{QUOTE:1}}"]));
    let search = Arc::new(FixedSearch::new(vec![ra_quote()]));
    let app = spawn_app(completion, search.clone(), 0, 100).await;

    let client = client_for(&app.base_url);
    let mut chunks = Vec::new();
    let outcome = client
        .send(
            &request("Where does it say \"I am Ra\" exactly?"),
            &mut |c| chunks.push(c),
        )
        .await;

    assert_eq!(outcome.state, ConsumerState::Done);
    let queries = search.queries.lock().unwrap().clone();
    assert_eq!(queries, vec!["I am Ra".to_string()]);
    // No opening paragraph in quote-search mode: first chunk is model text.
    assert_eq!(
        chunks.first(),
        Some(&AnimationChunk::Text {
            content: "Found it: ".to_string()
        })
    );
}

#[tokio::test]
async fn test_mid_stream_failure_recovers_from_cache() {
    let completion = Arc::new(ScriptedCompletion {
        fail_stream_after: Some(2),
        ..ScriptedCompletion::new(vec!["part one, ", "part two, ", "never sent"])
    });
    let search = Arc::new(FixedSearch::new(vec![ra_quote()]));
    let app = spawn_app(completion, search, 0, 100).await;

    let client = client_for(&app.base_url);
    let mut chunks = Vec::new();
    let outcome = client
        .send(&request("What happens on failure?"), &mut |c| {
            chunks.push(c)
        })
        .await;

    // The error event forces the failure path, and the cache already holds
    // the opening chunk plus the streamed parts, so recovery succeeds.
    assert_eq!(outcome.state, ConsumerState::Done);
    assert!(outcome.recovered);
    assert!(outcome.error.is_none());
    assert!(outcome.chunk_count >= 1);

    let text: String = chunks
        .iter()
        .filter_map(|c| match c {
            AnimationChunk::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert!(text.contains("part one, part two, ") || text.contains("part one, "));
}

#[tokio::test]
async fn test_total_failure_surfaces_visible_error() {
    let completion = Arc::new(ScriptedCompletion {
        fail_complete: true,
        ..ScriptedCompletion::new(vec![])
    });
    let search = Arc::new(FixedSearch::new(vec![]));
    let app = spawn_app(completion, search, 0, 100).await;

    let client = client_for(&app.base_url);
    let mut chunks = Vec::new();
    let outcome = client
        .send(&request("Anything at all?"), &mut |c| chunks.push(c))
        .await;

    // Zero content was ever delivered and the cache has no chunks, so this
    // is the one case that shows a hard error.
    assert_eq!(outcome.state, ConsumerState::Errored);
    assert!(outcome.error.is_some());
    assert_eq!(outcome.chunk_count, 0);
    assert!(chunks.is_empty());
}

#[tokio::test]
async fn test_validation_rejection_maps_to_errored() {
    let completion = Arc::new(ScriptedCompletion::new(vec![]));
    let search = Arc::new(FixedSearch::new(vec![]));
    let app = spawn_app(completion, search, 0, 100).await;

    let client = client_for(&app.base_url);
    let outcome = client.send(&request(""), &mut |_c| {}).await;

    assert_eq!(outcome.state, ConsumerState::Errored);
    assert!(outcome
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("empty"));
}

#[tokio::test]
async fn test_rate_limit_surfaces_retry_after() {
    let completion = Arc::new(ScriptedCompletion::new(vec!["short answer"]));
    let search = Arc::new(FixedSearch::new(vec![ra_quote()]));
    let app = spawn_app(completion, search, 0, 1).await;

    let client = client_for(&app.base_url);
    let first = client.send(&request("First question"), &mut |_c| {}).await;
    assert_eq!(first.state, ConsumerState::Done);

    let second = client.send(&request("Second question"), &mut |_c| {}).await;
    assert_eq!(second.state, ConsumerState::Errored);
    assert!(second
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Too many requests"));
}

#[tokio::test]
async fn test_rate_limit_headers_present() {
    let completion = Arc::new(ScriptedCompletion::new(vec!["hi"]));
    let search = Arc::new(FixedSearch::new(vec![]));
    let app = spawn_app(completion, search, 0, 1).await;

    let http = reqwest::Client::new();
    let body = serde_json::json!({"message": "hello", "history": []});
    let first = http
        .post(format!("{}/api/chat", app.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert!(first.status().is_success());
    assert_eq!(
        first
            .headers()
            .get("X-RateLimit-Limit")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let second = http
        .post(format!("{}/api/chat", app.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 429);
    assert!(second.headers().contains_key("Retry-After"));
    assert!(second.headers().contains_key("X-RateLimit-Reset"));
    let payload: serde_json::Value = second.json().await.unwrap();
    assert!(payload.get("retryAfter").is_some());
}

#[tokio::test]
async fn test_search_failures_are_retried_then_succeed() {
    let completion = Arc::new(ScriptedCompletion::new(vec!["answer {{QUOTE:1}}"]));
    let search = Arc::new(FixedSearch {
        fail_times: std::sync::Mutex::new(2),
        ..FixedSearch::new(vec![ra_quote()])
    });
    let app = spawn_app(completion, search, 3, 100).await;

    let client = client_for(&app.base_url);
    let outcome = client
        .send(&request("What survives transient search failures?"), &mut |_c| {})
        .await;

    assert_eq!(outcome.state, ConsumerState::Done);
    assert_eq!(outcome.quotes, vec![ra_quote()]);
}

#[tokio::test]
async fn test_generator_keeps_caching_after_client_disconnect() {
    let completion = Arc::new(ScriptedCompletion {
        delta_gap: Duration::from_millis(30),
        ..ScriptedCompletion::new(vec!["slow ", "and ", "steady ", "wins"])
    });
    let search = Arc::new(FixedSearch::new(vec![ra_quote()]));
    let app = spawn_app(completion, search, 0, 100).await;

    // Open the stream raw, read only the session event, then drop the
    // connection.
    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/api/chat", app.base_url))
        .json(&serde_json::json!({"message": "Will this finish?", "history": []}))
        .send()
        .await
        .unwrap();

    use futures_util::StreamExt;
    let mut body = response.bytes_stream();
    let mut decoder = quotient::protocol::FrameDecoder::new();
    let mut response_id = None;
    while response_id.is_none() {
        let bytes = body.next().await.unwrap().unwrap();
        for frame in decoder.push(&String::from_utf8_lossy(&bytes)) {
            if frame.event == "session" {
                let data: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
                response_id = data["responseId"].as_str().map(String::from);
            }
        }
    }
    drop(body);

    let rid = response_id.unwrap();
    // Generation keeps running into the cache after the disconnect.
    let mut complete = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(session) = app.state.cache.read(&rid).await.unwrap() {
            if session.complete {
                complete = true;
                assert!(session.has_content());
                break;
            }
        }
    }
    assert!(complete, "cache entry never completed after disconnect");
}
