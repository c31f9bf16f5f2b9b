use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::extractor::Segment;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Global panic hook that logs panics through tracing before the default
/// hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    next.run(req).instrument(span).await
}

/// Per-stream counters logged once at stream end.
#[derive(Default)]
pub struct StreamMetric {
    pub segments: usize,
    pub citations: usize,
    pub text_chars: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_segment(&mut self, segment: &Segment) {
        self.segments += 1;
        match segment {
            Segment::Text(text) => self.text_chars += text.chars().count(),
            Segment::Citation(_) => self.citations += 1,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "[STREAM END] Segments: {} | Citations: {} | Text: {} chars",
            self.segments, self.citations, self.text_chars
        );
    }
}
