pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// Message fragments that mark an otherwise-unclassified failure as transient
pub const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "rate limit",
    "server error",
    "overloaded",
    "temporarily unavailable",
];

/// Request validation bounds
pub const MIN_MESSAGE_CHARS: usize = 1;
pub const MAX_MESSAGE_CHARS: usize = 5000;
pub const MAX_HISTORY_MESSAGES: usize = 20;
pub const MAX_HISTORY_CONTENT_CHARS: usize = 10_000;

/// How many candidate passages a search returns to the generator
pub const CANDIDATE_QUOTE_LIMIT: usize = 5;

/// Cached stream sessions expire after this many seconds
pub const SESSION_TTL_SECS: i64 = 3600;

/// How long the generator waits for the suggestion call before emitting
/// `done` and letting suggestions land in the cache only
pub const SUGGESTION_WAIT_MS: u64 = 1500;

/// Client-side suggestion polling after a recovery without suggestions
pub const SUGGESTION_POLL_INTERVAL_MS: u64 = 2000;
pub const SUGGESTION_POLL_MAX_ATTEMPTS: u32 = 5;

/// Appended once when a stream died after partial content was shown
pub const INCOMPLETE_NOTICE: &str =
    "\n\n_The connection was interrupted; this response may be incomplete._";

/// Shown only when no content was ever delivered and recovery failed
pub const TOTAL_FAILURE_MESSAGE: &str =
    "Something went wrong while generating the answer. Please try again.";

/// Visibility monitor: hidden durations past this threshold mean the OS has
/// likely torn down the connection
pub const BACKGROUND_HIDDEN_THRESHOLD_MS: u64 = 10_000;
/// Grace period after resume before the registered stream is cancelled
pub const STALE_CANCEL_DELAY_MS: u64 = 5_000;

/// SSE keep-alive comment interval
pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;
