use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::client::StreamHandle;

/// Page-lifetime observer that detects "the app was backgrounded long enough
/// that the OS likely killed the connection". One instance exists per client
/// lifetime, never per request, so no listeners accumulate.
///
/// When the hidden duration crosses the backgrounded threshold and a stream
/// handle is registered, a single delayed cancellation is armed; it fires
/// only if the stream has made no progress by then, pushing the consumer
/// into its recovery path. Short hides (a desktop tab switch) never arm the
/// timer, because cancelling a healthy connection would be actively harmful.
pub struct VisibilityMonitor {
    inner: Mutex<MonitorState>,
    hidden_threshold: Duration,
    stale_delay: Duration,
}

#[derive(Default)]
struct MonitorState {
    handle: Option<StreamHandle>,
    hidden_since: Option<Instant>,
    pending: Option<tokio::task::JoinHandle<()>>,
}

impl VisibilityMonitor {
    pub fn new(hidden_threshold: Duration, stale_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(MonitorState::default()),
            hidden_threshold,
            stale_delay,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            Duration::from_millis(crate::constants::BACKGROUND_HIDDEN_THRESHOLD_MS),
            Duration::from_millis(crate::constants::STALE_CANCEL_DELAY_MS),
        )
    }

    /// Register the current in-flight stream, or `None` once it completed or
    /// was replaced. Registering `None` also disarms any pending
    /// stale-cancellation.
    pub fn register(&self, handle: Option<StreamHandle>) {
        let mut state = self.inner.lock().expect("monitor lock");
        if handle.is_none() {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
        state.handle = handle;
    }

    /// Clear the registration only if `handle` is still the registered one.
    pub fn clear_if(&self, handle: &StreamHandle) {
        let mut state = self.inner.lock().expect("monitor lock");
        let is_current = state
            .handle
            .as_ref()
            .map(|h| h.same_stream(handle))
            .unwrap_or(false);
        if is_current {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            state.handle = None;
        }
    }

    pub fn on_hidden(&self) {
        let mut state = self.inner.lock().expect("monitor lock");
        state.hidden_since = Some(Instant::now());
    }

    pub fn on_visible(&self) {
        let mut state = self.inner.lock().expect("monitor lock");
        let hidden_for = match state.hidden_since.take() {
            Some(since) => since.elapsed(),
            None => return,
        };

        if hidden_for < self.hidden_threshold {
            tracing::trace!(
                "Hidden for {:?}; below backgrounding threshold, leaving stream alone",
                hidden_for
            );
            return;
        }

        let handle = match state.handle.clone() {
            Some(handle) => handle,
            None => return,
        };

        tracing::info!(
            "Hidden for {:?}; arming stale-connection cancel in {:?}",
            hidden_for,
            self.stale_delay
        );

        // Replace, never stack: at most one pending stale timer exists.
        if let Some(previous) = state.pending.take() {
            previous.abort();
        }

        let epoch_at_arm = handle.progress_epoch();
        let stale_delay = self.stale_delay;
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(stale_delay).await;
            if handle.progress_epoch() == epoch_at_arm {
                tracing::warn!(
                    "No stream progress {:?} after resume; cancelling to force recovery",
                    stale_delay
                );
                handle.token.cancel();
            } else {
                tracing::debug!("Stream progressed after resume; stale cancel skipped");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_monitor() -> VisibilityMonitor {
        VisibilityMonitor::new(Duration::from_millis(40), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn test_long_hide_without_progress_cancels() {
        let monitor = fast_monitor();
        let handle = StreamHandle::new();
        monitor.register(Some(handle.clone()));

        monitor.on_hidden();
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.on_visible();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.token.is_cancelled());
        assert!(!handle.is_user_cancelled());
    }

    #[tokio::test]
    async fn test_short_hide_never_arms() {
        let monitor = fast_monitor();
        let handle = StreamHandle::new();
        monitor.register(Some(handle.clone()));

        monitor.on_hidden();
        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.on_visible();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_registering_none_clears_pending_cancel() {
        let monitor = fast_monitor();
        let handle = StreamHandle::new();
        monitor.register(Some(handle.clone()));

        monitor.on_hidden();
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.on_visible();

        // Stream completes before the stale timer fires.
        monitor.register(None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!handle.token.is_cancelled());
    }
}
