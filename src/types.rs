use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_error::SpanTrace;

use crate::constants::{
    MAX_HISTORY_CONTENT_CHARS, MAX_HISTORY_MESSAGES, MAX_MESSAGE_CHARS, MIN_MESSAGE_CHARS,
};

#[derive(Error, Debug)]
pub enum QuotientError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl QuotientError {
    /// Short machine code used in SSE `error` payloads and JSON bodies
    pub fn code(&self) -> &'static str {
        match self {
            QuotientError::Database(_) => "DATABASE_ERROR",
            QuotientError::Serialization(_) => "SERIALIZATION_ERROR",
            QuotientError::Network(_) => "NETWORK_ERROR",
            QuotientError::Io(_) => "IO_ERROR",
            QuotientError::Validation(_) => "VALIDATION_ERROR",
            QuotientError::RateLimited { .. } => "RATE_LIMITED",
            QuotientError::Upstream(_, _) => "UPSTREAM_ERROR",
            QuotientError::CircuitOpen(_) => "CIRCUIT_OPEN",
            QuotientError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            QuotientError::Cancelled => "CANCELLED",
            QuotientError::RecoveryFailed(_) => "RECOVERY_FAILED",
            QuotientError::Protocol(_) => "PROTOCOL_ERROR",
            QuotientError::Internal(_, _) => "INTERNAL_ERROR",
        }
    }
}

/// An error plus the span trace captured where it was observed.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: QuotientError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<QuotientError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = match &self.inner {
            QuotientError::Validation(m) => (axum::http::StatusCode::BAD_REQUEST, m.clone()),
            QuotientError::RateLimited { .. } => (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                self.inner.to_string(),
            ),
            QuotientError::Upstream(s, m) => (*s, m.clone()),
            QuotientError::Network(e) => (axum::http::StatusCode::BAD_GATEWAY, e.to_string()),
            QuotientError::CircuitOpen(_) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                self.inner.to_string(),
            ),
            other => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                other.to_string(),
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": self.inner.code(),
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CHAT REQUEST ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default, alias = "thinkingMode")]
    pub thinking_mode: bool,
    #[serde(default, alias = "targetLanguage")]
    pub target_language: Option<String>,
    #[serde(default, alias = "includeConfederation")]
    pub include_confederation: bool,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<()> {
        let len = self.message.chars().count();
        if len < MIN_MESSAGE_CHARS {
            return Err(QuotientError::Validation("Message must not be empty".into()).into());
        }
        if len > MAX_MESSAGE_CHARS {
            return Err(QuotientError::Validation(format!(
                "Message exceeds {} characters",
                MAX_MESSAGE_CHARS
            ))
            .into());
        }
        if self.history.len() > MAX_HISTORY_MESSAGES {
            return Err(QuotientError::Validation(format!(
                "History exceeds {} messages",
                MAX_HISTORY_MESSAGES
            ))
            .into());
        }
        for (i, msg) in self.history.iter().enumerate() {
            if msg.content.chars().count() > MAX_HISTORY_CONTENT_CHARS {
                return Err(QuotientError::Validation(format!(
                    "History message {} exceeds {} characters",
                    i, MAX_HISTORY_CONTENT_CHARS
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// --- CITATIONS ---

/// An immutable citation returned by the passage search collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quote {
    pub text: String,
    pub reference: String,
    pub url: String,
}

/// Client-side display unit: plain text, or a resolved citation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnimationChunk {
    Text { content: String },
    Quote { quote: Quote },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            history: Vec::new(),
            thinking_mode: false,
            target_language: None,
            include_confederation: false,
        }
    }

    #[test]
    fn test_empty_message_rejected() {
        let result = request("").validate();
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(matches!(e.inner, QuotientError::Validation(_)));
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(request(&long).validate().is_err());
    }

    #[test]
    fn test_message_at_limit_accepted() {
        let exact = "x".repeat(MAX_MESSAGE_CHARS);
        assert!(request(&exact).validate().is_ok());
    }

    #[test]
    fn test_history_limits() {
        let mut req = request("hello");
        req.history = vec![
            ChatMessage {
                role: ChatRole::User,
                content: "hi".into(),
            };
            MAX_HISTORY_MESSAGES + 1
        ];
        assert!(req.validate().is_err());

        req.history.truncate(MAX_HISTORY_MESSAGES);
        assert!(req.validate().is_ok());

        req.history[0].content = "y".repeat(MAX_HISTORY_CONTENT_CHARS + 1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_camel_case_aliases_accepted() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"message":"hi","history":[],"thinkingMode":true,"targetLanguage":"de"}"#,
        )
        .unwrap();
        assert!(req.thinking_mode);
        assert_eq!(req.target_language.as_deref(), Some("de"));
    }
}
